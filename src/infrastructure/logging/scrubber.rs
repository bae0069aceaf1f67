//! Redaction of secrets and personal data in text bound for logs.
//!
//! Applied to oracle error bodies before they reach logs or the
//! `last_error` columns.

use regex::{Captures, Regex};

#[derive(Debug, Clone)]
pub struct LogScrubber {
    bearer_pattern: Regex,
    api_key_pattern: Regex,
    field_pattern: Regex,
    email_pattern: Regex,
}

impl LogScrubber {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bearer_pattern: Regex::new(r"Bearer\s+[A-Za-z0-9\-_\.=]+")?,
            api_key_pattern: Regex::new(r"\bsk-[A-Za-z0-9\-_]{16,}")?,
            field_pattern: Regex::new(
                r#"(?i)(["']?(?:api_key|apikey|token|secret|password)["']?\s*[:=]\s*)["']?[^"'\s,}]+["']?"#,
            )?,
            email_pattern: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
        })
    }

    pub fn scrub(&self, message: &str) -> String {
        let scrubbed = self.bearer_pattern.replace_all(message, "Bearer [TOKEN_REDACTED]");
        let scrubbed = self.api_key_pattern.replace_all(&scrubbed, "[API_KEY_REDACTED]");
        let scrubbed = self
            .field_pattern
            .replace_all(&scrubbed, |caps: &Captures| format!("{}[REDACTED]", &caps[1]));
        self.email_pattern
            .replace_all(&scrubbed, "[EMAIL_REDACTED]")
            .into_owned()
    }
}
