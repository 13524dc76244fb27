//! Per-turn transcript aggregation
//!
//! Input and output transcription arrives as small fragments. They are
//! appended to two accumulators for the open turn and flushed as one
//! `(user, model)` pair when the service signals the turn is complete.

use tracing::debug;

/// Text of one completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub user_text: String,
    pub model_text: String,
}

/// Accumulates fragments for the currently open turn.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    user: String,
    model: String,
    fragment_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append recognized user speech.
    pub fn on_input_fragment(&mut self, text: &str) {
        self.user.push_str(text);
        self.fragment_count += 1;
    }

    /// Append the model's synthesized speech.
    pub fn on_output_fragment(&mut self, text: &str) {
        self.model.push_str(text);
        self.fragment_count += 1;
    }

    /// Close the turn. Returns the turn if either side said anything;
    /// both accumulators are cleared either way.
    pub fn on_turn_complete(&mut self) -> Option<CompletedTurn> {
        let user = std::mem::take(&mut self.user);
        let model = std::mem::take(&mut self.model);
        let fragments = std::mem::take(&mut self.fragment_count);

        let user_text = user.trim();
        let model_text = model.trim();
        if user_text.is_empty() && model_text.is_empty() {
            debug!("Turn complete with no transcript ({} fragments)", fragments);
            return None;
        }

        debug!(
            "Turn complete: {} user chars, {} model chars, {} fragments",
            user_text.len(),
            model_text.len(),
            fragments
        );
        Some(CompletedTurn {
            user_text: user_text.to_string(),
            model_text: model_text.to_string(),
        })
    }

    /// Drop anything accumulated for the open turn.
    pub fn clear(&mut self) {
        self.user.clear();
        self.model.clear();
        self.fragment_count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.model.is_empty()
    }
}
