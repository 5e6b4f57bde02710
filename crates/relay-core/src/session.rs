// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use relay_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Reserved output budget (set from the model's catalog entry).
    pub max_output_tokens: usize,
    /// Estimated token cost of tool schemas + dynamic context that are sent
    /// with every request but never stored in `messages`. Refreshed once per
    /// turn by `Agent::estimate_schema_overhead`.
    pub schema_overhead: usize,
    /// Correction factor applied to the chars/4 token estimate, derived from
    /// the provider's actual reported input token counts. Starts at 1.0 and
    /// is nudged toward `actual / estimated` after every turn.
    pub calibration_factor: f32,
    /// Running totals of prompt-cache read/write tokens for the whole session.
    pub cache_read_total: u64,
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    /// Effective input budget: the context window minus the reserved output
    /// budget and the estimated non-message overhead. Zero (rather than a
    /// negative/underflowed value) means compaction should be skipped
    /// entirely — there's no sensible budget to enforce.
    pub fn input_budget(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.schema_overhead)
    }

    /// Record prompt-cache usage reported by the provider for the turn just
    /// completed.
    pub fn add_cache_usage(&mut self, read: u32, write: u32) {
        self.cache_read_total += read as u64;
        self.cache_write_total += write as u64;
    }

    /// Nudge `calibration_factor` toward the ratio of actual-to-estimated
    /// input tokens reported by the provider, using an exponential moving
    /// average so a single noisy turn can't swing the estimate wildly.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let observed = actual_input as f32 / estimated as f32;
        const SMOOTHING: f32 = 0.2;
        self.calibration_factor =
            (1.0 - SMOOTHING) * self.calibration_factor + SMOOTHING * observed;
        self.calibration_factor = self.calibration_factor.clamp(0.25, 4.0);
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
