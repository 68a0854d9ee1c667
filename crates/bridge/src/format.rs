//! Markdown → Telegram-HTML conversion and compact tool-call rendering.
//!
//! Telegram's HTML dialect accepts only a handful of tags, so the
//! converter protects code spans first, escapes everything else, then
//! rewrites the inline markers. Finished HTML segments, code blocks, and
//! inline code are parked behind NUL-delimited placeholders while the rest
//! of the text is processed.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Delimiters for segments that are already finished HTML (tool results):
/// the converter passes them through untouched instead of escaping them.
const RAW_HTML_OPEN: char = '\u{1}';
const RAW_HTML_CLOSE: char = '\u{2}';

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern"))
}

fn raw_html_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?s)\x01(.*?)\x02")
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?s)```(\w*)\n(.*?)```")
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"`([^`\n]+)`")
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\*\*(.+?)\*\*")
}

fn italic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\*([^*\n]+)\*")
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"\[([^\]]+)\]\(([^)]+)\)")
}

/// Escape the characters Telegram's HTML parser treats specially.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&#x27;")
        .replace('"', "&quot;")
}

/// Wrap a finished HTML fragment so [`md_to_html`] passes it through
/// verbatim.
pub fn raw_html(html: &str) -> String {
    format!("{RAW_HTML_OPEN}{html}{RAW_HTML_CLOSE}")
}

/// Remove the raw-HTML delimiters, keeping the fragment text. Used by the
/// plain-text fallback path, which never runs the converter.
pub fn strip_raw_markers(text: &str) -> String {
    text.replace([RAW_HTML_OPEN, RAW_HTML_CLOSE], "")
}

/// Convert agent Markdown to Telegram-compatible HTML.
pub fn md_to_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Park finished HTML segments first; their tags must survive the
    // escape pass below.
    let mut raw_segments: Vec<String> = Vec::new();
    let text = raw_html_re().replace_all(text, |caps: &Captures| {
        raw_segments.push(caps[1].to_string());
        format!("\x00RAW{}\x00", raw_segments.len() - 1)
    });

    // Park fenced code blocks behind placeholders so their contents are
    // escaped once and never rewritten.
    let mut blocks: Vec<String> = Vec::new();
    let text = code_block_re().replace_all(&text, |caps: &Captures| {
        let lang = &caps[1];
        let class = if lang.is_empty() {
            String::new()
        } else {
            format!(" class=\"language-{lang}\"")
        };
        blocks.push(format!(
            "<pre><code{class}>{}</code></pre>",
            escape_html(&caps[2])
        ));
        format!("\x00BLOCK{}\x00", blocks.len() - 1)
    });

    let mut inline_codes: Vec<String> = Vec::new();
    let text = inline_code_re().replace_all(&text, |caps: &Captures| {
        inline_codes.push(format!("<code>{}</code>", escape_html(&caps[1])));
        format!("\x00INLINE{}\x00", inline_codes.len() - 1)
    });

    let mut result = escape_html(&text);
    result = bold_re().replace_all(&result, "<b>${1}</b>").into_owned();
    // Bold markers are already consumed, so remaining single-asterisk pairs
    // are italics.
    result = italic_re().replace_all(&result, "<i>${1}</i>").into_owned();
    result = link_re()
        .replace_all(&result, "<a href=\"${2}\">${1}</a>")
        .into_owned();

    for (i, code) in inline_codes.iter().enumerate() {
        result = result.replace(&format!("\x00INLINE{i}\x00"), code);
    }
    for (i, block) in blocks.iter().enumerate() {
        result = result.replace(&format!("\x00BLOCK{i}\x00"), block);
    }
    for (i, segment) in raw_segments.iter().enumerate() {
        result = result.replace(&format!("\x00RAW{i}\x00"), segment);
    }
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool_icon(name: &str) -> &'static str {
    match name {
        "Read" => "📂",
        "Edit" => "✏️",
        "Write" => "📝",
        "Bash" => "▶️",
        "Grep" | "Glob" => "🔍",
        "Task" => "🤖",
        "WebSearch" | "WebFetch" => "🌐",
        _ => "🔧",
    }
}

/// Format a tool call as a compact one-liner for the chat.
pub fn format_tool_call(name: &str, input: &Map<String, Value>) -> String {
    let icon = tool_icon(name);
    let str_arg = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("");

    match name {
        "Read" | "Edit" | "Write" => format!("{icon} {name}: {}", short_path(str_arg("file_path"))),
        "Bash" => format!("{icon} Bash: {}", truncate_chars(str_arg("command"), 60)),
        "Grep" | "Glob" => format!("{icon} {name}: {}", str_arg("pattern")),
        _ => format!("{icon} {name}"),
    }
}

/// Format a tool result as an expandable blockquote.
pub fn format_tool_result(result: &str, max_length: usize) -> String {
    let total = result.chars().count();
    let mut text: String = result.chars().take(max_length).collect();
    if total > max_length {
        text.push_str(&format!("\n... ({total} chars total)"));
    }
    format!("<blockquote expandable>{}</blockquote>", escape_html(&text))
}

/// Last two path components, or the path itself when it has no separator.
fn short_path(path: &str) -> String {
    if !path.contains('/') {
        return path.to_string();
    }
    let mut parts: Vec<&str> = path.rsplit('/').take(2).collect();
    parts.reverse();
    parts.join("/")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let mut out: String = text.chars().take(limit).collect();
        out.push_str("...");
        out
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn escapes_angle_brackets() {
        assert_eq!(escape_html("a < b > c"), "a &lt; b &gt; c");
    }

    #[test]
    fn escapes_ampersand() {
        assert_eq!(escape_html("a & b"), "a &amp; b");
    }

    #[test]
    fn no_double_escape_guard() {
        // Escaping is single-pass by contract; pre-escaped text escapes again.
        assert_eq!(escape_html("&amp;"), "&amp;amp;");
    }

    #[test]
    fn bold() {
        assert_eq!(md_to_html("**hello**"), "<b>hello</b>");
    }

    #[test]
    fn italic() {
        assert_eq!(md_to_html("*hello*"), "<i>hello</i>");
    }

    #[test]
    fn inline_code() {
        assert_eq!(md_to_html("`foo()`"), "<code>foo()</code>");
    }

    #[test]
    fn code_block_with_language() {
        let result = md_to_html("```python\nprint('hi')\n```");
        assert!(result.contains("<pre><code class=\"language-python\">"));
        assert!(result.contains("print(&#x27;hi&#x27;)"));
    }

    #[test]
    fn code_block_without_language() {
        let result = md_to_html("```\nsome code\n```");
        assert!(result.contains("<pre><code>"));
    }

    #[test]
    fn link() {
        assert_eq!(
            md_to_html("[click](http://x.com)"),
            "<a href=\"http://x.com\">click</a>"
        );
    }

    #[test]
    fn no_bold_inside_inline_code() {
        let result = md_to_html("`**not bold**`");
        assert!(!result.contains("<b>"));
    }

    #[test]
    fn code_block_contents_untouched() {
        let result = md_to_html("```\n**not bold** <html>\n```");
        assert!(!result.contains("<b>"));
        assert!(result.contains("&lt;html&gt;"));
    }

    #[test]
    fn underscores_in_identifiers_untouched() {
        let result = md_to_html("use `send_message` function");
        assert!(result.contains("send_message"));
        assert!(!result.contains("<i>"));
    }

    #[test]
    fn plain_text_escaped() {
        let result = md_to_html("x < 5 && y > 3");
        assert!(result.contains("&lt;"));
        assert!(result.contains("&gt;"));
        assert!(result.contains("&amp;"));
    }

    #[test]
    fn mixed_formatting() {
        let result = md_to_html("**bold** and *italic* and `code`");
        assert!(result.contains("<b>bold</b>"));
        assert!(result.contains("<i>italic</i>"));
        assert!(result.contains("<code>code</code>"));
    }

    #[test]
    fn empty_input() {
        assert_eq!(md_to_html(""), "");
    }

    #[test]
    fn multiline_text() {
        let result = md_to_html("line 1\nline 2\n**bold line**");
        assert!(result.contains("<b>bold line</b>"));
    }

    #[test]
    fn tool_call_read_shows_short_path() {
        let result = format_tool_call("Read", &input(&[("file_path", "/a/b/c/main.py")]));
        assert_eq!(result, "📂 Read: c/main.py");
    }

    #[test]
    fn tool_call_edit() {
        let result = format_tool_call("Edit", &input(&[("file_path", "/src/main.py")]));
        assert!(result.contains("✏️"));
        assert!(result.contains("src/main.py"));
    }

    #[test]
    fn tool_call_write() {
        let result = format_tool_call("Write", &input(&[("file_path", "/tests/test.py")]));
        assert!(result.contains("📝"));
    }

    #[test]
    fn tool_call_bash() {
        let result = format_tool_call("Bash", &input(&[("command", "npm test")]));
        assert_eq!(result, "▶️ Bash: npm test");
    }

    #[test]
    fn tool_call_bash_truncates_long_commands() {
        let command = "x".repeat(80);
        let result = format_tool_call("Bash", &input(&[("command", &command)]));
        assert!(result.ends_with("..."));
        assert!(result.chars().count() < 80);
    }

    #[test]
    fn tool_call_grep() {
        let result = format_tool_call("Grep", &input(&[("pattern", "TODO"), ("glob", "**/*.py")]));
        assert_eq!(result, "🔍 Grep: TODO");
    }

    #[test]
    fn tool_call_unknown() {
        let result = format_tool_call("SomeTool", &input(&[("arg", "val")]));
        assert_eq!(result, "🔧 SomeTool");
    }

    #[test]
    fn tool_result_short() {
        let result = format_tool_result("output", 1000);
        assert_eq!(result, "<blockquote expandable>output</blockquote>");
    }

    #[test]
    fn tool_result_truncated_with_total() {
        let long = "y".repeat(1500);
        let result = format_tool_result(&long, 1000);
        assert!(result.contains("... (1500 chars total)"));
        assert!(result.starts_with("<blockquote expandable>"));
    }

    #[test]
    fn tool_result_escapes_html() {
        let result = format_tool_result("<script>alert()</script>", 1000);
        assert!(result.contains("&lt;script&gt;"));
    }

    #[test]
    fn raw_html_survives_md_conversion() {
        let text = format!(
            "checking < 1 file\n{}",
            raw_html("<blockquote expandable>a &amp; b</blockquote>")
        );
        let result = md_to_html(&text);
        assert!(result.contains("checking &lt; 1 file"));
        assert!(result.contains("<blockquote expandable>a &amp; b</blockquote>"));
    }

    #[test]
    fn tool_result_renders_as_expandable_quote() {
        // A buffer mixing prose and a marked tool result keeps the quote
        // tags through the Markdown pass; only the contents are escaped.
        let quoted = format_tool_result("x < y", 1000);
        let result = md_to_html(&format!("📂 Read: c/main.py\n{}", raw_html(&quoted)));
        assert!(result.contains("<blockquote expandable>x &lt; y</blockquote>"));
        assert!(!result.contains("&lt;blockquote"));
    }

    #[test]
    fn strip_raw_markers_keeps_fragment() {
        let marked = raw_html("<code>x</code>");
        assert_eq!(strip_raw_markers(&marked), "<code>x</code>");
    }
}
