//! Redaction of sensitive text in logs and query highlights.
//!
//! Detects email addresses, card-like digit runs, US SSNs, and bearer /
//! API-key tokens, and replaces each with a fixed marker.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::PrivacyConfig;

/// Patterns in the order they are applied, with their markers.
fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)\b(?:bearer\s+[A-Za-z0-9._~+/=-]{8,}|sk-[A-Za-z0-9_-]{8,}|api[_-]?key\s*[:=]\s*\S{8,})",
                "[SECRET]",
            ),
            (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "[EMAIL]"),
            (r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
            (r"\b(?:\d[ -]?){12,15}\d\b", "[CARD]"),
        ]
        .into_iter()
        .filter_map(|(pattern, marker)| Regex::new(pattern).ok().map(|re| (re, marker)))
        .collect()
    })
}

/// Replace every sensitive match in `text`. Borrows when nothing matched.
pub fn redact(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (re, marker) in patterns() {
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, *marker).into_owned());
        }
    }
    out
}

/// Applies [`redact`] according to the `[privacy]` settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redactor {
    logs: bool,
    highlights: bool,
}

impl Redactor {
    pub fn new(config: &PrivacyConfig) -> Self {
        Self {
            logs: config.redact_logs,
            highlights: config.redact_highlights,
        }
    }

    /// Text safe to put in a log line. With log redaction on, user text is
    /// replaced by its length.
    pub fn for_log<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.logs {
            Cow::Owned(format!("<{} chars>", text.chars().count()))
        } else {
            Cow::Borrowed(text)
        }
    }

    pub fn highlight(&self, text: String) -> String {
        if self.highlights {
            redact(&text).into_owned()
        } else {
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_known_shapes() {
        let out = redact("mail bob@example.com, card 4111 1111 1111 1111, ssn 123-45-6789");
        assert_eq!(out, "mail [EMAIL], card [CARD], ssn [SSN]");
        let out = redact("Authorization: Bearer abcdefghijklmnop and sk-0123456789abcdef");
        assert!(!out.contains("abcdefghijklmnop"));
        assert!(!out.contains("sk-0123"));
    }

    #[test]
    fn test_clean_text_is_borrowed() {
        assert!(matches!(redact("nothing to see here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_redactor_follows_config() {
        let off = Redactor::default();
        assert_eq!(off.highlight("a@b.io".into()), "a@b.io");
        let on = Redactor::new(&PrivacyConfig {
            redact_logs: true,
            redact_highlights: true,
        });
        assert_eq!(on.highlight("a@b.io".into()), "[EMAIL]");
        assert_eq!(on.for_log("hello"), "<5 chars>");
    }
}
