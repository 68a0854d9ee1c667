//! Append-only JSONL log of the conversation as seen in the chat.
//!
//! Off the hot path: write failures are logged and swallowed, never
//! surfaced to the turn.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use tc_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub role: String,
    pub text: String,
}

pub struct ConversationLog {
    path: PathBuf,
}

impl ConversationLog {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            path: work_dir.join("data").join("conversation_log.jsonl"),
        }
    }

    /// The prompt as handed to the agent (attachment preambles included).
    pub fn log_user(&self, text: &str) {
        self.append("user", text);
    }

    /// The final assistant text shown in the chat; blank turns are skipped.
    pub fn log_assistant(&self, text: &str) {
        if !text.trim().is_empty() {
            self.append("assistant", text);
        }
    }

    fn append(&self, role: &str, text: &str) {
        if let Err(e) = self.try_append(role, text) {
            tracing::warn!(error = %e, "conversation log write failed");
        }
    }

    fn try_append(&self, role: &str, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = LogEntry {
            ts: Utc::now().to_rfc3339(),
            role: role.to_string(),
            text: text.to_string(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path());

        log.log_user("hello");
        log.log_assistant("world");

        let data =
            std::fs::read_to_string(dir.path().join("data").join("conversation_log.jsonl"))
                .unwrap();
        let entries: Vec<LogEntry> = data
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[1].role, "assistant");
        assert!(!entries[1].ts.is_empty());
    }

    #[test]
    fn blank_assistant_text_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path());

        log.log_assistant("   \n");
        assert!(!dir.path().join("data").join("conversation_log.jsonl").exists());
    }
}
