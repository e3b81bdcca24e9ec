//! Rolling conversation history
//!
//! [`ConversationContext`] is owned by the controller. Pipeline stages only
//! ever see a cloned window of it; turns are appended once a session ends.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat completion APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// User turn stamped now
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Assistant turn stamped now
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Approximate token cost of this turn
    #[must_use]
    pub const fn estimated_tokens(&self) -> usize {
        estimate_tokens(self.text.as_str())
    }
}

/// Size limits for the retained history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum turns retained
    pub max_turns: usize,
    /// Maximum estimated tokens retained
    pub max_tokens: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_tokens: 4000,
        }
    }
}

/// Append-only turn history with oldest-first eviction
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    turns: VecDeque<ConversationTurn>,
    limits: ContextLimits,
    tokens: usize,
}

impl ConversationContext {
    #[must_use]
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            turns: VecDeque::new(),
            limits,
            tokens: 0,
        }
    }

    /// Append a turn, evicting the oldest turns while over either cap
    ///
    /// The newest turn is always kept, even if it alone exceeds the token cap.
    pub fn push(&mut self, turn: ConversationTurn) {
        self.tokens += turn.estimated_tokens();
        self.turns.push_back(turn);

        while self.turns.len() > 1
            && (self.turns.len() > self.limits.max_turns || self.tokens > self.limits.max_tokens)
        {
            if let Some(evicted) = self.turns.pop_front() {
                self.tokens -= evicted.estimated_tokens();
                tracing::trace!(role = %evicted.role, "evicted oldest turn");
            }
        }
    }

    /// Most recent turns fitting both `max_turns` and `max_tokens`, oldest first
    #[must_use]
    pub fn window(&self, max_turns: usize, max_tokens: usize) -> Vec<ConversationTurn> {
        let mut used = 0;
        let mut picked: Vec<ConversationTurn> = self
            .turns
            .iter()
            .rev()
            .take(max_turns)
            .take_while(|turn| {
                used += turn.estimated_tokens();
                used <= max_tokens
            })
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Estimated tokens currently retained
    #[must_use]
    pub const fn estimated_tokens(&self) -> usize {
        self.tokens
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    #[must_use]
    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }
}

/// Rough token estimation (4 bytes per token on average)
#[must_use]
pub const fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_turns: usize, max_tokens: usize) -> ContextLimits {
        ContextLimits {
            max_turns,
            max_tokens,
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("hello"), 1);
        assert_eq!(estimate_tokens("hello world"), 2);
    }

    #[test]
    fn evicts_oldest_by_count() {
        let mut ctx = ConversationContext::new(limits(3, 10_000));
        for i in 0..5 {
            ctx.push(ConversationTurn::user(format!("turn {i}")));
        }

        let texts: Vec<_> = ctx.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["turn 2", "turn 3", "turn 4"]);
    }

    #[test]
    fn evicts_oldest_by_tokens() {
        let mut ctx = ConversationContext::new(limits(100, 10));
        ctx.push(ConversationTurn::user("a".repeat(20)));
        ctx.push(ConversationTurn::assistant("b".repeat(20)));
        ctx.push(ConversationTurn::user("c".repeat(20)));

        assert_eq!(ctx.len(), 2);
        assert!(ctx.estimated_tokens() <= 10);
        assert_eq!(ctx.last().map(|t| t.role), Some(Role::User));
    }

    #[test]
    fn oversized_turn_is_kept_alone() {
        let mut ctx = ConversationContext::new(limits(10, 5));
        ctx.push(ConversationTurn::user("short"));
        ctx.push(ConversationTurn::assistant("x".repeat(400)));

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.last().map(|t| t.role), Some(Role::Assistant));
    }

    #[test]
    fn window_takes_most_recent_in_order() {
        let mut ctx = ConversationContext::new(ContextLimits::default());
        ctx.push(ConversationTurn::user("one"));
        ctx.push(ConversationTurn::assistant("two"));
        ctx.push(ConversationTurn::user("three"));

        let window = ctx.window(2, 1000);
        let texts: Vec<_> = window.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["two", "three"]);
    }

    #[test]
    fn window_respects_token_budget() {
        let mut ctx = ConversationContext::new(ContextLimits::default());
        ctx.push(ConversationTurn::user("a".repeat(40)));
        ctx.push(ConversationTurn::assistant("b".repeat(40)));

        assert_eq!(ctx.window(10, 15).len(), 1);
        assert!(ctx.window(10, 5).is_empty());
    }
}
