//! Engine settings with environment-variable overrides.

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_MAX_OUTPUT_CHARS: usize = 2000;
const DEFAULT_BATCH_CONCURRENCY: usize = 8;
const DEFAULT_PYTHON_COMMAND: &str = "python3";
const DEFAULT_PORT: u16 = 8080;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
const MODEL_ENV: &str = "RLM_MODEL";
const MAX_ITERATIONS_ENV: &str = "RLM_MAX_ITERATIONS";
const MAX_OUTPUT_CHARS_ENV: &str = "RLM_MAX_OUTPUT_CHARS";
const BATCH_CONCURRENCY_ENV: &str = "RLM_BATCH_CONCURRENCY";
const PYTHON_COMMAND_ENV: &str = "RLM_PYTHON_COMMAND";
const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlmSettings {
    /// Root model used for driver iterations and sandbox sub-queries.
    pub model: String,
    /// Iteration budget per completion. Overridable per request.
    pub max_iterations: u32,
    /// Head-truncation limit applied independently to captured stdout and
    /// stderr before they are fed back into the conversation.
    pub max_output_chars: usize,
    /// Concurrency bound for `llm_query_batched` fan-out.
    pub batch_concurrency: usize,
    /// Interpreter command for the sandbox child; may carry arguments.
    pub python_command: String,
    /// Listen port for the HTTP front door.
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RlmEnvOverrides {
    model: Option<String>,
    max_iterations: Option<u32>,
    max_output_chars: Option<usize>,
    batch_concurrency: Option<usize>,
    python_command: Option<String>,
    port: Option<u16>,
}

impl Default for RlmSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            python_command: DEFAULT_PYTHON_COMMAND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl RlmSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides(RlmEnvOverrides::from_env());
        settings
    }

    /// Per-request iteration budget. Zero and `None` keep the configured
    /// default; no upper bound is enforced.
    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        if let Some(value) = max_iterations.filter(|value| *value > 0) {
            self.max_iterations = value;
        }
        self
    }

    fn apply_env_overrides(&mut self, overrides: RlmEnvOverrides) {
        let RlmEnvOverrides {
            model,
            max_iterations,
            max_output_chars,
            batch_concurrency,
            python_command,
            port,
        } = overrides;

        if let Some(model) = model {
            self.model = model;
        }
        if let Some(max_iterations) = max_iterations {
            self.max_iterations = max_iterations;
        }
        if let Some(max_output_chars) = max_output_chars {
            self.max_output_chars = max_output_chars;
        }
        if let Some(batch_concurrency) = batch_concurrency {
            self.batch_concurrency = batch_concurrency;
        }
        if let Some(python_command) = python_command {
            self.python_command = python_command;
        }
        if let Some(port) = port {
            self.port = port;
        }
    }

    #[cfg(test)]
    fn from_raw_values(
        model: Option<&str>,
        max_iterations: Option<&str>,
        max_output_chars: Option<&str>,
        batch_concurrency: Option<&str>,
        python_command: Option<&str>,
        port: Option<&str>,
    ) -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides(RlmEnvOverrides {
            model: non_empty(model),
            max_iterations: parse_positive_u32(max_iterations),
            max_output_chars: parse_positive_usize(max_output_chars),
            batch_concurrency: parse_positive_usize(batch_concurrency),
            python_command: non_empty(python_command),
            port: parse_port(port),
        });
        settings
    }
}

impl RlmEnvOverrides {
    fn from_env() -> Self {
        let model = std::env::var(MODEL_ENV).ok();
        let max_iterations = std::env::var(MAX_ITERATIONS_ENV).ok();
        let max_output_chars = std::env::var(MAX_OUTPUT_CHARS_ENV).ok();
        let batch_concurrency = std::env::var(BATCH_CONCURRENCY_ENV).ok();
        let python_command = std::env::var(PYTHON_COMMAND_ENV).ok();
        let port = std::env::var(PORT_ENV).ok();

        Self {
            model: non_empty(model.as_deref()),
            max_iterations: parse_positive_u32(max_iterations.as_deref()),
            max_output_chars: parse_positive_usize(max_output_chars.as_deref()),
            batch_concurrency: parse_positive_usize(batch_concurrency.as_deref()),
            python_command: non_empty(python_command.as_deref()),
            port: parse_port(port.as_deref()),
        }
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn parse_positive_u32(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|value| *value > 0)
}

fn parse_positive_usize(raw: Option<&str>) -> Option<usize> {
    raw?.trim().parse::<usize>().ok().filter(|value| *value > 0)
}

fn parse_port(raw: Option<&str>) -> Option<u16> {
    raw?.trim().parse::<u16>().ok().filter(|value| *value > 0)
}
