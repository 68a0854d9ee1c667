//! Append-only text buffer that splits a turn's output across several
//! Telegram messages.
//!
//! Telegram caps message bodies at 4096 characters; the default budget of
//! 3800 leaves margin for HTML entity expansion. All length accounting is
//! in characters, never bytes, so multi-byte text cannot split a code
//! point.

/// Default per-message character budget.
pub const MAX_MESSAGE_LEN: usize = 3800;

pub struct MessageChain {
    max_length: usize,
    completed: Vec<String>,
    current: String,
    footer: String,
}

impl MessageChain {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            completed: Vec::new(),
            current: String::new(),
            footer: String::new(),
        }
    }

    pub fn current_text(&self) -> &str {
        &self.current
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// The live buffer has outgrown one message and must be split.
    pub fn needs_new_message(&self) -> bool {
        char_len(&self.current) > self.max_length
    }

    pub fn append_text(&mut self, text: &str) {
        self.current.push_str(text);
    }

    /// Tool-call lines sit on their own line.
    pub fn append_tool_call(&mut self, line: &str) {
        if !self.current.is_empty() && !self.current.ends_with('\n') {
            self.current.push('\n');
        }
        self.current.push_str(line);
        self.current.push('\n');
    }

    pub fn prepend_text(&mut self, text: &str) {
        self.current.insert_str(0, text);
    }

    /// Freeze the head of the live buffer and start a new one. Prefers
    /// splitting at the last line break within budget; if that break sits
    /// below half the budget (long unbroken lines), hard-cuts at the budget
    /// instead. Returns the frozen text.
    pub fn complete_current(&mut self) -> String {
        let completed = if char_len(&self.current) <= self.max_length {
            std::mem::take(&mut self.current)
        } else {
            let hard_cut = byte_index_of_char(&self.current, self.max_length);
            let split_at = match self.current[..hard_cut].rfind('\n') {
                Some(pos) if char_len(&self.current[..pos]) >= self.max_length / 2 => pos,
                _ => hard_cut,
            };
            let head = self.current[..split_at].to_string();
            self.current = self.current[split_at..].trim_start_matches('\n').to_string();
            head
        };
        self.completed.push(completed.clone());
        completed
    }

    pub fn set_footer(&mut self, footer: &str) {
        self.footer = footer.to_string();
    }

    /// The live buffer as displayed, footer attached after a blank line.
    pub fn render(&self) -> String {
        if self.footer.is_empty() {
            self.current.clone()
        } else {
            format!("{}\n\n{}", self.current.trim_end(), self.footer)
        }
    }
}

impl Default for MessageChain {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_LEN)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`-th character (or the string's end).
fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
