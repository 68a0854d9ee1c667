//! Turn coordination and Telegram handler wiring.
//!
//! One [`Bridge`] per process. Incoming messages from the single authorized
//! chat are debounced into one prompt; at most one turn is active at a
//! time, and each turn owns a fresh [`TelegramStream`] that is discarded on
//! finalize.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::command::BotCommands;
use tokio::task::JoinHandle;

use tc_domain::{AgentEvent, Config};

use crate::format::{format_tool_call, format_tool_result};
use crate::log::ConversationLog;
use crate::media::MediaStore;
use crate::runner::ClaudeRunner;
use crate::stream::TelegramStream;

/// Window in which consecutive messages coalesce into one prompt.
const DEBOUNCE: Duration = Duration::from_millis(500);
/// Callback payload of the inline cancel button.
const CANCEL_CALLBACK: &str = "claude_cancel";
/// Character budget for a tool result preview in the chat.
const TOOL_RESULT_PREVIEW: usize = 1000;

const BUSY_MESSAGE: &str = "⚠️ Claude is busy. Use /cancel first.";

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Bridge commands:")]
pub enum Command {
    #[command(description = "start a fresh conversation")]
    Clear,
    #[command(description = "ask the agent to compact its context")]
    Compact,
    #[command(description = "show the accumulated session cost")]
    Cost,
    #[command(description = "cancel the running turn")]
    Cancel,
    // Bare "/model" must still parse (it prints the current model).
    #[command(description = "set the model, e.g. /model sonnet", parse_with = whole_tail)]
    Model(String),
}

fn whole_tail(input: String) -> Result<(String,), teloxide::utils::command::ParseError> {
    Ok((input.trim().to_string(),))
}

#[derive(Default)]
struct InputBuffer {
    texts: Vec<String>,
    photos: Vec<std::path::PathBuf>,
    docs: Vec<std::path::PathBuf>,
}

/// Ties the runner, the media store, and the chat together.
pub struct Bridge {
    config: Config,
    bot: Bot,
    runner: ClaudeRunner,
    media: MediaStore,
    log: ConversationLog,
    /// Renderer of the active turn, if any; shared so the cancel paths can
    /// finalize it.
    stream: tokio::sync::Mutex<Option<Arc<TelegramStream>>>,
    buffer: Mutex<InputBuffer>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<Instant>,
    session_cost: Mutex<f64>,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        let bot = Bot::new(config.bot_token.clone());
        let runner = ClaudeRunner::new(
            config.work_dir.clone(),
            config.model.clone(),
            config.max_budget,
        );
        let log = ConversationLog::new(&config.work_dir);
        Self {
            bot,
            runner,
            media: MediaStore::new(),
            log,
            stream: tokio::sync::Mutex::new(None),
            buffer: Mutex::new(InputBuffer::default()),
            debounce: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            session_cost: Mutex::new(0.0),
            config,
        }
    }

    /// Start long polling (blocking until shutdown).
    pub async fn run(self: Arc<Self>) {
        // Sweep uploads left behind by a previous run.
        self.media.purge_all();

        let bot = self.bot.clone();
        let handler = dptree::entry()
            .branch(
                Update::filter_message()
                    .filter_command::<Command>()
                    .endpoint(Self::handle_command),
            )
            .branch(Update::filter_message().endpoint(Self::handle_message))
            .branch(Update::filter_callback_query().endpoint(Self::handle_callback));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self])
            .build()
            .dispatch()
            .await;
    }

    fn is_authorized(&self, chat_id: ChatId) -> bool {
        chat_id == ChatId(self.config.chat_id)
    }

    // ── Handlers ─────────────────────────────────────────────────────

    async fn handle_message(bridge: Arc<Bridge>, msg: Message) -> ResponseResult<()> {
        if !bridge.is_authorized(msg.chat.id) {
            return Ok(());
        }

        if let Some(photos) = msg.photo() {
            // Variants are ordered by size; the last is the full resolution.
            if let Some(photo) = photos.last() {
                match bridge.media.save_photo(&bridge.bot, photo).await {
                    Ok(path) => {
                        bridge.push_attachment(path, false, msg.caption());
                        Arc::clone(&bridge).arm_debounce();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "photo download failed");
                        bridge
                            .bot
                            .send_message(msg.chat.id, "❌ Failed to download the photo.")
                            .await?;
                    }
                }
            }
        } else if let Some(doc) = msg.document() {
            match bridge.media.save_document(&bridge.bot, doc).await {
                Ok(path) => {
                    bridge.push_attachment(path, true, msg.caption());
                    Arc::clone(&bridge).arm_debounce();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "document download failed");
                    bridge
                        .bot
                        .send_message(msg.chat.id, "❌ Failed to download the file.")
                        .await?;
                }
            }
        } else if msg.voice().is_some() {
            bridge
                .bot
                .send_message(msg.chat.id, "🎤 Voice messages not supported yet.")
                .await?;
        } else if let Some(text) = msg.text() {
            bridge.buffer.lock().texts.push(text.to_string());
            Arc::clone(&bridge).arm_debounce();
        }
        Ok(())
    }

    async fn handle_command(bridge: Arc<Bridge>, msg: Message, cmd: Command) -> ResponseResult<()> {
        if !bridge.is_authorized(msg.chat.id) {
            return Ok(());
        }
        match cmd {
            Command::Clear => {
                bridge.reset_session();
                bridge
                    .bot
                    .send_message(msg.chat.id, "🆕 Session cleared.")
                    .await?;
            }
            Command::Compact => {
                if bridge.runner.is_running() {
                    bridge.bot.send_message(msg.chat.id, BUSY_MESSAGE).await?;
                } else {
                    bridge.buffer.lock().texts.push("/compact".to_string());
                    Arc::clone(&bridge).process_buffer().await;
                }
            }
            Command::Cost => {
                let cost = *bridge.session_cost.lock();
                bridge
                    .bot
                    .send_message(msg.chat.id, format!("💰 Session cost: ${cost:.4}"))
                    .await?;
            }
            Command::Cancel => {
                if !bridge.runner.is_running() {
                    bridge
                        .bot
                        .send_message(msg.chat.id, "Nothing running.")
                        .await?;
                } else {
                    bridge.cancel_turn().await;
                    bridge.bot.send_message(msg.chat.id, "🛑 Cancelled.").await?;
                }
            }
            Command::Model(name) => {
                let name = name.trim();
                if name.is_empty() {
                    let current = bridge
                        .runner
                        .model()
                        .unwrap_or_else(|| "default".to_string());
                    bridge
                        .bot
                        .send_message(
                            msg.chat.id,
                            format!("Current model: {current}\nUsage: /model <name>"),
                        )
                        .await?;
                } else {
                    bridge.runner.set_model(Some(name.to_string()));
                    bridge
                        .bot
                        .send_message(msg.chat.id, format!("Model set to: {name}"))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_callback(bridge: Arc<Bridge>, q: CallbackQuery) -> ResponseResult<()> {
        bridge.bot.answer_callback_query(q.id.clone()).await?;
        if q.from.id.0 as i64 != bridge.config.chat_id {
            return Ok(());
        }
        if q.data.as_deref() != Some(CANCEL_CALLBACK) {
            return Ok(());
        }
        if !bridge.runner.is_running() {
            if let Some(msg) = q.regular_message() {
                let _ = bridge
                    .bot
                    .edit_message_text(msg.chat.id, msg.id, "Nothing running.")
                    .await;
            }
            return Ok(());
        }
        bridge.cancel_turn().await;
        Ok(())
    }

    // ── Coordination ─────────────────────────────────────────────────

    fn push_attachment(&self, path: std::path::PathBuf, is_doc: bool, caption: Option<&str>) {
        let mut buffer = self.buffer.lock();
        if is_doc {
            buffer.docs.push(path);
        } else {
            buffer.photos.push(path);
        }
        if let Some(caption) = caption {
            buffer.texts.push(caption.to_string());
        }
    }

    /// (Re)start the debounce window; the newest input always restarts it.
    fn arm_debounce(self: Arc<Self>) {
        let mut slot = self.debounce.lock();
        if let Some(task) = slot.take() {
            task.abort();
        }
        let bridge = Arc::clone(&self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            // The turn runs detached: aborting the next debounce window
            // must not be able to kill an in-flight turn.
            tokio::spawn(bridge.process_buffer());
        }));
    }

    /// Snapshot the buffer and run one turn with it. Input arriving while
    /// the turn runs accumulates for the next one.
    async fn process_buffer(self: Arc<Self>) {
        let (text, photos, docs) = {
            let mut buffer = self.buffer.lock();
            (
                std::mem::take(&mut buffer.texts).join("\n"),
                std::mem::take(&mut buffer.photos),
                std::mem::take(&mut buffer.docs),
            )
        };
        if text.is_empty() && photos.is_empty() && docs.is_empty() {
            return;
        }

        self.check_session_timeout();
        *self.last_activity.lock() = Instant::now();

        if self.runner.is_running() {
            let _ = self.bot.send_message(self.chat_id(), BUSY_MESSAGE).await;
            return;
        }

        let prompt = MediaStore::build_prompt(&text, &photos, &docs);
        self.log.log_user(&prompt);

        let stream = Arc::new(TelegramStream::new(
            self.bot.clone(),
            self.chat_id(),
            self.config.update_interval,
            cancel_keyboard(),
        ));
        *self.stream.lock().await = Some(Arc::clone(&stream));

        if let Err(e) = stream.start().await {
            tracing::error!(error = %e, "failed to open the turn in the chat");
            *self.stream.lock().await = None;
            return;
        }

        self.drive_turn(&stream, prompt).await;
        *self.stream.lock().await = None;
    }

    /// Consume the runner's event stream and route every event into the
    /// renderer.
    async fn drive_turn(&self, stream: &TelegramStream, prompt: String) {
        let events = self.runner.run(prompt);
        tokio::pin!(events);

        let mut final_text = String::new();
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::TextDelta { text } => {
                    final_text.push_str(&text);
                    stream.push_text(&text).await;
                }
                AgentEvent::ToolUse {
                    tool_name,
                    tool_input,
                } => {
                    stream
                        .push_tool_call(&format_tool_call(&tool_name, &tool_input))
                        .await;
                }
                AgentEvent::ToolResult { text, .. } if self.config.verbose => {
                    stream
                        .push_tool_result(&format_tool_result(&text, TOOL_RESULT_PREVIEW))
                        .await;
                }
                AgentEvent::Result {
                    duration_ms,
                    num_turns,
                    cost_usd,
                    ..
                } => {
                    // The child reports the cumulative session cost; keep
                    // the latest value instead of summing.
                    *self.session_cost.lock() = cost_usd;
                    let footer = format!("⏱ {}s · {num_turns} turns", duration_ms / 1000);
                    stream.finalize(&footer, false).await;
                }
                AgentEvent::Init { .. }
                | AgentEvent::ToolStart { .. }
                | AgentEvent::ToolResult { .. } => {}
            }
        }

        // Turns that end without a RESULT (child death, timeout, cancel)
        // still get exactly one finalize; this is a no-op otherwise.
        stream.finalize("", false).await;
        self.log.log_assistant(&final_text);
    }

    async fn cancel_turn(&self) {
        self.runner.cancel().await;
        if let Some(stream) = self.stream.lock().await.take() {
            stream.finalize("", true).await;
        }
    }

    fn reset_session(&self) {
        self.runner.clear_session();
        self.media.cleanup();
        *self.session_cost.lock() = 0.0;
    }

    /// Evaluated on every flush: a long-idle session is reset before the
    /// prompt runs.
    fn check_session_timeout(&self) {
        let idle = self.last_activity.lock().elapsed();
        if self.runner.session_id().is_some() && idle >= self.config.session_timeout {
            tracing::info!(idle_secs = idle.as_secs(), "session idle timeout, resetting");
            self.reset_session();
        }
    }

    fn chat_id(&self) -> ChatId {
        ChatId(self.config.chat_id)
    }
}

/// The inline keyboard carrying the single cancel button.
pub fn cancel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([[InlineKeyboardButton::callback("🛑 Cancel", CANCEL_CALLBACK)]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config(work_dir: PathBuf) -> Config {
        Config {
            bot_token: "123:TEST".to_string(),
            chat_id: 42,
            work_dir,
            verbose: false,
            model: None,
            max_budget: None,
            session_timeout: Duration::from_secs(3600),
            update_interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn commands_parse() {
        let cmd = Command::parse("/model sonnet", "testbot").unwrap();
        assert!(matches!(cmd, Command::Model(name) if name == "sonnet"));
        assert!(matches!(
            Command::parse("/clear", "testbot").unwrap(),
            Command::Clear
        ));
        assert!(matches!(
            Command::parse("/cancel", "testbot").unwrap(),
            Command::Cancel
        ));
        assert!(Command::parse("/unknown", "testbot").is_err());
    }

    #[test]
    fn cancel_keyboard_has_single_cancel_button() {
        let kb = cancel_keyboard();
        assert_eq!(kb.inline_keyboard.len(), 1);
        assert_eq!(kb.inline_keyboard[0].len(), 1);
        assert_eq!(kb.inline_keyboard[0][0].text, "🛑 Cancel");
    }

    #[test]
    fn authorization_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(test_config(dir.path().to_path_buf()));
        assert!(bridge.is_authorized(ChatId(42)));
        assert!(!bridge.is_authorized(ChatId(43)));
        assert!(!bridge.is_authorized(ChatId(-42)));
    }

    #[test]
    fn idle_timeout_resets_session_and_cost() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.session_timeout = Duration::from_secs(0);
        let bridge = Bridge::new(config);

        bridge.runner.set_session("s1");
        *bridge.session_cost.lock() = 0.25;

        bridge.check_session_timeout();
        assert_eq!(bridge.runner.session_id(), None);
        assert_eq!(*bridge.session_cost.lock(), 0.0);
    }

    #[test]
    fn no_session_means_no_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.session_timeout = Duration::from_secs(0);
        let bridge = Bridge::new(config);

        *bridge.session_cost.lock() = 0.25;
        bridge.check_session_timeout();
        // Cost belongs to the (nonexistent) session; nothing to reset.
        assert_eq!(*bridge.session_cost.lock(), 0.25);
    }

    #[test]
    fn buffer_snapshot_composition() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(test_config(dir.path().to_path_buf()));

        bridge.buffer.lock().texts.push("a".to_string());
        bridge.buffer.lock().texts.push("b".to_string());
        bridge.push_attachment(PathBuf::from("/tmp/p.jpg"), false, Some("caption"));

        let buffer = bridge.buffer.lock();
        assert_eq!(buffer.texts, vec!["a", "b", "caption"]);
        assert_eq!(buffer.photos, vec![PathBuf::from("/tmp/p.jpg")]);
        assert!(buffer.docs.is_empty());
    }
}
