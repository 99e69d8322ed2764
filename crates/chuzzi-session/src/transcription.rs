//! Per-turn transcription accumulation.
//!
//! Fragments for each direction are concatenated in arrival order. On turn
//! completion both sides are trimmed and taken off the accumulators as a
//! [`CompletedTurn`]. Turning that into [`ChatMessage`]s (user first) may run
//! the user side through a [`TextTransform`], which can happen off the task
//! that owns the aggregator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use chuzzi_core::types::{ChatMessage, Role};
use chuzzi_live::TextTransform;

#[derive(Debug, Default)]
pub struct TranscriptionAggregator {
    user_text: String,
    model_text: String,
}

impl TranscriptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of the user's speech; returns the running partial.
    pub fn append_user_fragment(&mut self, text: &str) -> &str {
        self.user_text.push_str(text);
        &self.user_text
    }

    /// Append a fragment of the model's speech; returns the running partial.
    pub fn append_model_fragment(&mut self, text: &str) -> &str {
        self.model_text.push_str(text);
        &self.model_text
    }

    pub fn user_text(&self) -> &str {
        &self.user_text
    }

    pub fn model_text(&self) -> &str {
        &self.model_text
    }

    pub fn has_pending_user_text(&self) -> bool {
        !self.user_text.trim().is_empty()
    }

    pub fn reset(&mut self) {
        self.user_text.clear();
        self.model_text.clear();
    }

    /// Close the current turn: trim both sides and clear the accumulators.
    pub fn take_turn(&mut self) -> CompletedTurn {
        let user = std::mem::take(&mut self.user_text);
        let model = std::mem::take(&mut self.model_text);
        let turn = CompletedTurn {
            user: non_empty(user.trim()),
            model: non_empty(model.trim()),
            at: Utc::now(),
        };
        debug!(
            user = turn.user.is_some(),
            model = turn.model.is_some(),
            "Turn complete"
        );
        turn
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// Trimmed text of one finished turn. Empty sides are `None`.
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    user: Option<String>,
    model: Option<String>,
    at: DateTime<Utc>,
}

impl CompletedTurn {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.model.is_none()
    }

    pub fn has_user_text(&self) -> bool {
        self.user.is_some()
    }

    /// Messages with the user text kept as recognized.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        let Self { user, model, at } = self;
        messages(user, model, at)
    }

    /// Messages with the user text converted by `transform`.
    ///
    /// The conversion is bounded by `timeout`; on error, timeout, or an empty
    /// result the trimmed original is kept.
    pub async fn finalize(
        self,
        transform: &dyn TextTransform,
        timeout: Duration,
    ) -> Vec<ChatMessage> {
        let Self { user, model, at } = self;
        let user = match user {
            Some(text) => Some(convert(transform, text, timeout).await),
            None => None,
        };
        messages(user, model, at)
    }
}

fn messages(user: Option<String>, model: Option<String>, at: DateTime<Utc>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(2);
    if let Some(text) = user {
        out.push(ChatMessage::with_timestamp(Role::User, text, at));
    }
    if let Some(text) = model {
        out.push(ChatMessage::with_timestamp(Role::Model, text, at));
    }
    out
}

async fn convert(transform: &dyn TextTransform, text: String, timeout: Duration) -> String {
    match tokio::time::timeout(timeout, transform.transform(&text)).await {
        Ok(Ok(converted)) if !converted.trim().is_empty() => converted.trim().to_string(),
        Ok(Ok(_)) => {
            warn!("Text conversion returned nothing, keeping original");
            text
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Text conversion failed, keeping original");
            text
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Text conversion timed out, keeping original");
            text
        }
    }
}
