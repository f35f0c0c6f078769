//! Prometheus metrics for the engine and the HTTP surface.

use lazy_static::lazy_static;
use prometheus::Counter;
use prometheus::CounterVec;
use prometheus::Histogram;
use prometheus::HistogramVec;
use prometheus::TextEncoder;
use prometheus::exponential_buckets;
use prometheus::register_counter;
use prometheus::register_counter_vec;
use prometheus::register_histogram;
use prometheus::register_histogram_vec;

lazy_static! {
    /// Total HTTP requests served by the front door, by method, path, and
    /// status text.
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "rlm_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("failed to register rlm_http_requests_total");

    /// HTTP request latency by method and path.
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "rlm_http_request_duration_seconds",
        "Duration of HTTP requests in seconds",
        &["method", "path"]
    )
    .expect("failed to register rlm_http_request_duration_seconds");

    /// Iterations consumed per completion.
    pub static ref RLM_ITERATIONS: Histogram = register_histogram!(
        "rlm_iterations_count",
        "Number of iterations per RLM completion",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0]
    )
    .expect("failed to register rlm_iterations_count");

    /// Wall time per completion, success or failure.
    pub static ref RLM_DURATION: Histogram = register_histogram!(
        "rlm_completion_duration_seconds",
        "Total duration of RLM completion in seconds",
        exponential_buckets(1.0, 2.0, 10).expect("valid exponential bucket layout")
    )
    .expect("failed to register rlm_completion_duration_seconds");

    /// Token usage per model, split by direction (`input` / `output`).
    pub static ref TOKEN_USAGE: CounterVec = register_counter_vec!(
        "rlm_token_usage_total",
        "Total number of tokens used",
        &["model", "direction"]
    )
    .expect("failed to register rlm_token_usage_total");

    /// Completions aborted by an infrastructure error.
    pub static ref RLM_ERRORS: Counter = register_counter!(
        "rlm_errors_total",
        "Total number of RLM errors"
    )
    .expect("failed to register rlm_errors_total");
}

/// Touches every metric so it is registered before the first exposition.
/// Called during server startup.
pub fn init() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&HTTP_REQUEST_DURATION);
    lazy_static::initialize(&RLM_ITERATIONS);
    lazy_static::initialize(&RLM_DURATION);
    lazy_static::initialize(&TOKEN_USAGE);
    lazy_static::initialize(&RLM_ERRORS);
}

/// Renders the default registry in the Prometheus text exposition format.
pub fn render_metrics() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
