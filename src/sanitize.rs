//! Cleanup applied to every piece of text returned by the chat endpoint
//! before it is cached, stored or sent to a browser.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("Invalid regex"));
static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("Invalid regex"));
static SPACED_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:eval|exec)\s+\([^)]*\)").expect("Invalid regex"));
static FUNCTION_CTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Function\s*\([^)]*\)").expect("Invalid regex"));
static MERMAID_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```mermaid\n(.*?)\n```").expect("Invalid regex"));
static MERMAID_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]\n]*)\]|\{([^}\n]*)\}|\(([^)\n]*)\)").expect("Invalid regex")
});

const BLOCKED_CALLS: [&str; 4] = ["eval", "exec", "compile", "__import__"];

pub fn clean_llm_output(raw: &str) -> String {
    let mut text = strip_invisible(raw);
    text = normalize_quotes(&text);
    text = SCRIPT_BLOCK.replace_all(&text, "").into_owned();
    text = STYLE_BLOCK.replace_all(&text, "").into_owned();

    for name in BLOCKED_CALLS {
        text = text.replace(&format!("{}(", name), &format!("{}_SAFE(", name));
    }
    text = SPACED_CALL.replace_all(&text, "[filtered]").into_owned();
    text = FUNCTION_CTOR.replace_all(&text, "[filtered]").into_owned();

    text = repair_mermaid(&text);
    text.trim().to_string()
}

fn strip_invisible(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Quotes diagram node labels containing non-ASCII text so the renderer accepts them
fn repair_mermaid(text: &str) -> String {
    MERMAID_BLOCK
        .replace_all(text, |block: &Captures| {
            let body = MERMAID_LABEL.replace_all(&block[1], |label: &Captures| {
                let (open, inner, close) = if let Some(inner) = label.get(1) {
                    ('[', inner.as_str(), ']')
                } else if let Some(inner) = label.get(2) {
                    ('{', inner.as_str(), '}')
                } else {
                    ('(', label.get(3).map(|m| m.as_str()).unwrap_or_default(), ')')
                };

                if inner.starts_with('"') || inner.is_ascii() {
                    label[0].to_string()
                } else {
                    format!("{}\"{}\"{}", open, inner, close)
                }
            });
            format!("```mermaid\n{}\n```", body)
        })
        .into_owned()
}
