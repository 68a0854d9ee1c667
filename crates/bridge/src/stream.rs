//! Live-editing Telegram output for one agent turn.
//!
//! A [`TelegramStream`] posts a placeholder message, then keeps editing it
//! as event fragments arrive, respecting a minimum interval between edits.
//! When the buffer outgrows one message the current message is frozen
//! (keyboard removed) and a continuation message is posted as a reply to
//! the first. `finalize` performs the single closing edit; pushes after it
//! are ignored.

use std::time::{Duration, Instant};

use teloxide::payloads::{EditMessageTextSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardMarkup, LinkPreviewOptions, MessageId, ParseMode, ReplyParameters,
};
use teloxide::{ApiError, RequestError};

use tc_domain::{Error, Result};

use crate::chain::MessageChain;
use crate::format::{md_to_html, raw_html, strip_raw_markers};

pub struct TelegramStream {
    bot: Bot,
    chat_id: ChatId,
    update_interval: Duration,
    keyboard: InlineKeyboardMarkup,
    state: tokio::sync::Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    chain: MessageChain,
    first: Option<MessageId>,
    current: Option<MessageId>,
    last_update: Option<Instant>,
    dirty: bool,
    finalized: bool,
}

impl TelegramStream {
    pub fn new(
        bot: Bot,
        chat_id: ChatId,
        update_interval: Duration,
        keyboard: InlineKeyboardMarkup,
    ) -> Self {
        Self {
            bot,
            chat_id,
            update_interval,
            keyboard,
            state: tokio::sync::Mutex::new(StreamState::default()),
        }
    }

    /// Post the placeholder message that the turn will keep editing.
    pub async fn start(&self) -> Result<()> {
        let msg = self
            .bot
            .send_message(self.chat_id, "⏳ Thinking...")
            .reply_markup(self.keyboard.clone())
            .await
            .map_err(|e| Error::Telegram(e.to_string()))?;
        let mut st = self.state.lock().await;
        st.first = Some(msg.id);
        st.current = Some(msg.id);
        Ok(())
    }

    pub async fn push_text(&self, text: &str) {
        let mut st = self.state.lock().await;
        if st.finalized {
            return;
        }
        st.chain.append_text(text);
        st.dirty = true;
        self.maybe_update(&mut st).await;
    }

    pub async fn push_tool_call(&self, line: &str) {
        let mut st = self.state.lock().await;
        if st.finalized {
            return;
        }
        st.chain.append_tool_call(line);
        st.dirty = true;
        self.maybe_update(&mut st).await;
    }

    /// Pre-rendered HTML (expandable blockquote). Marked as raw so the
    /// Markdown pass at edit time does not escape its tags.
    pub async fn push_tool_result(&self, html: &str) {
        let mut st = self.state.lock().await;
        if st.finalized {
            return;
        }
        st.chain.append_text(&raw_html(html));
        st.dirty = true;
        self.maybe_update(&mut st).await;
    }

    /// The only completion path: one closing edit with the keyboard
    /// removed. Idempotent; later pushes and finalizes are no-ops.
    pub async fn finalize(&self, footer: &str, cancelled: bool) {
        let mut st = self.state.lock().await;
        if st.finalized {
            return;
        }
        st.finalized = true;
        if cancelled {
            st.chain.prepend_text("🛑 Cancelled\n\n");
        }
        if !footer.is_empty() {
            st.chain.set_footer(footer);
        }
        let display = st.chain.render();
        if let Some(current) = st.current {
            if !display.trim().is_empty() {
                self.edit_message(current, &display, None).await;
            }
        }
    }

    async fn maybe_update(&self, st: &mut StreamState) {
        if let Some(last) = st.last_update {
            if last.elapsed() < self.update_interval {
                return;
            }
        }
        self.flush(st).await;
    }

    async fn flush(&self, st: &mut StreamState) {
        if !st.dirty {
            return;
        }
        let Some(mut current) = st.current else {
            return;
        };

        if st.chain.needs_new_message() {
            let completed = st.chain.complete_current();
            // The cancel affordance belongs to the active tail only.
            self.edit_message(current, &completed, None).await;

            let mut req = self
                .bot
                .send_message(self.chat_id, "⏳ ...")
                .reply_markup(self.keyboard.clone());
            if let Some(first) = st.first {
                req = req.reply_parameters(ReplyParameters::new(first));
            }
            match req.await {
                Ok(msg) => {
                    st.current = Some(msg.id);
                    current = msg.id;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to post continuation message");
                }
            }
        }

        let display = st.chain.render();
        if !display.trim().is_empty() {
            self.edit_message(current, &display, Some(&self.keyboard)).await;
        }
        st.last_update = Some(Instant::now());
        st.dirty = false;
    }

    /// Edit with HTML rendering; "not modified" is success. A parse failure
    /// falls back to a plain-text edit, and any remaining error is
    /// swallowed: rendering must never take down the turn.
    async fn edit_message(
        &self,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) {
        let mut req = self
            .bot
            .edit_message_text(self.chat_id, message_id, md_to_html(text))
            .parse_mode(ParseMode::Html)
            .link_preview_options(disabled_preview());
        if let Some(kb) = keyboard {
            req = req.reply_markup(kb.clone());
        }
        let err = match req.await {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => return,
            Err(e) => e,
        };
        tracing::debug!(error = %err, "HTML edit failed, retrying as plain text");

        let mut req = self
            .bot
            .edit_message_text(self.chat_id, message_id, strip_raw_markers(text))
            .link_preview_options(disabled_preview());
        if let Some(kb) = keyboard {
            req = req.reply_markup(kb.clone());
        }
        match req.await {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => {}
            Err(e) => tracing::warn!(error = %e, "message edit failed"),
        }
    }
}

fn disabled_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}
