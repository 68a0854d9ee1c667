//! Runtime configuration, sourced from environment variables.
//!
//! Required: `BOT_TOKEN`, `CHAT_ID`. Everything else has a default.
//! `validate()` collects every problem so the operator sees them all at
//! once instead of fixing one per restart.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot credential.
    pub bot_token: String,
    /// The single authorized chat. Messages from any other chat are dropped.
    pub chat_id: i64,
    /// Working directory handed to the agent child process.
    pub work_dir: PathBuf,
    /// When on, tool results are rendered into the chat.
    pub verbose: bool,
    /// Model override passed through to the child.
    pub model: Option<String>,
    /// Budget cap (USD) passed through to the child.
    pub max_budget: Option<f64>,
    /// Idle time after which the remembered session is cleared.
    pub session_timeout: Duration,
    /// Minimum spacing between message edits.
    pub update_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Unparseable
    /// numeric values fall back to their defaults; `validate` reports the
    /// genuinely fatal cases (missing token, zero chat id, bad work dir).
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let work_dir = get("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Self {
            bot_token: get("BOT_TOKEN").unwrap_or_default(),
            chat_id: get("CHAT_ID")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            work_dir,
            verbose: matches!(get("VERBOSE").as_deref(), Some("1") | Some("true")),
            model: get("MODEL").filter(|v| !v.is_empty()),
            max_budget: get("MAX_BUDGET").and_then(|v| v.trim().parse().ok()),
            session_timeout: Duration::from_secs(
                get("SESSION_TIMEOUT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(3600),
            ),
            update_interval: Duration::from_secs_f64(
                get("UPDATE_INTERVAL")
                    .and_then(|v| v.trim().parse().ok())
                    .filter(|v: &f64| *v > 0.0)
                    .unwrap_or(2.0),
            ),
        }
    }

    /// Return every configuration problem. Empty means valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.bot_token.is_empty() {
            errors.push(ConfigError {
                field: "BOT_TOKEN".into(),
                message: "is required".into(),
            });
        }

        if self.chat_id == 0 {
            errors.push(ConfigError {
                field: "CHAT_ID".into(),
                message: "is required and must be a non-zero integer".into(),
            });
        }

        if !self.work_dir.is_dir() {
            errors.push(ConfigError {
                field: "WORK_DIR".into(),
                message: format!("'{}' is not a directory", self.work_dir.display()),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConfigError
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_applied() {
        let config = config_from(&[("BOT_TOKEN", "tok"), ("CHAT_ID", "42")]);
        assert_eq!(config.bot_token, "tok");
        assert_eq!(config.chat_id, 42);
        assert!(!config.verbose);
        assert_eq!(config.model, None);
        assert_eq!(config.max_budget, None);
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.update_interval, Duration::from_secs_f64(2.0));
    }

    #[test]
    fn overrides_parsed() {
        let config = config_from(&[
            ("BOT_TOKEN", "tok"),
            ("CHAT_ID", "-100123"),
            ("VERBOSE", "1"),
            ("MODEL", "sonnet"),
            ("MAX_BUDGET", "1.5"),
            ("SESSION_TIMEOUT", "120"),
            ("UPDATE_INTERVAL", "0.5"),
        ]);
        assert_eq!(config.chat_id, -100123);
        assert!(config.verbose);
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert_eq!(config.max_budget, Some(1.5));
        assert_eq!(config.session_timeout, Duration::from_secs(120));
        assert_eq!(config.update_interval, Duration::from_secs_f64(0.5));
    }

    #[test]
    fn missing_required_fields_reported() {
        let mut config = config_from(&[]);
        config.work_dir = std::env::temp_dir();
        let errors = config.validate();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"BOT_TOKEN"));
        assert!(fields.contains(&"CHAT_ID"));
    }

    #[test]
    fn bad_work_dir_reported() {
        let mut config = config_from(&[("BOT_TOKEN", "tok"), ("CHAT_ID", "1")]);
        config.work_dir = PathBuf::from("/definitely/not/a/real/dir");
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "WORK_DIR");
    }

    #[test]
    fn valid_config_has_no_errors() {
        let mut config = config_from(&[("BOT_TOKEN", "tok"), ("CHAT_ID", "1")]);
        config.work_dir = std::env::temp_dir();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let mut config = config_from(&[
            ("BOT_TOKEN", "tok"),
            ("CHAT_ID", "not-a-number"),
            ("SESSION_TIMEOUT", "soon"),
            ("UPDATE_INTERVAL", "-3"),
        ]);
        config.work_dir = std::env::temp_dir();
        assert_eq!(config.chat_id, 0);
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.update_interval, Duration::from_secs_f64(2.0));
        // Unparseable CHAT_ID surfaces through validate, not a panic.
        assert!(!config.validate().is_empty());
    }
}
