//! Extractors for model replies: fenced REPL code blocks and the terminal
//! answer markers.

use regex::Regex;
use std::sync::LazyLock;

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```repl\n(.*?)\n```").expect("code block pattern is valid")
});

static FINAL_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)FINAL\((.*?)\)").expect("final answer pattern is valid"));

static FINAL_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)FINAL_VAR\((.*?)\)").expect("final var pattern is valid"));

/// Returns the bodies of all ```repl fenced blocks in document order, with
/// the fence lines stripped and interior newlines preserved verbatim. Only
/// the lowercase `repl` tag opens a block; other tags are ignored.
pub fn find_code_blocks(text: &str) -> Vec<String> {
    CODE_BLOCK
        .captures_iter(text)
        .map(|capture| capture[1].to_string())
        .collect()
}

/// Returns the trimmed body of the earliest `FINAL(...)` marker. The body
/// ends at the first `)` byte; parentheses are not balanced. Absent marker
/// (or an unterminated one) yields `None`.
pub fn find_final_answer(text: &str) -> Option<String> {
    FINAL_ANSWER
        .captures(text)
        .map(|capture| capture[1].trim().to_string())
}

/// Returns the trimmed body of the earliest `FINAL_VAR(...)` marker, the
/// name of a sandbox variable to surface as the final answer.
pub fn find_final_var(text: &str) -> Option<String> {
    FINAL_VAR
        .captures(text)
        .map(|capture| capture[1].trim().to_string())
}

/// Whether `name` is usable as a bare Python identifier. `FINAL_VAR` bodies
/// that fail this check are rejected before touching the sandbox.
pub fn is_python_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
