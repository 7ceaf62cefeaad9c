//! Rolling conversation log used to seed a session on (re)connect

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_MAX_TURN_PAIRS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One role-tagged utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// Fixed-capacity log of user/assistant pairs, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
    max_turn_pairs: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURN_PAIRS)
    }
}

impl ConversationHistory {
    pub fn new(max_turn_pairs: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turn_pairs * 2),
            max_turn_pairs,
        }
    }

    /// Record one exchange. Both sides are always stored, the missing one as
    /// an empty string; nothing happens if both are empty.
    pub fn append(&mut self, user_text: &str, assistant_text: &str) {
        if user_text.is_empty() && assistant_text.is_empty() {
            return;
        }

        self.turns.push_back(Turn::user(user_text));
        self.turns.push_back(Turn::assistant(assistant_text));

        while self.turns.len() > self.max_turn_pairs * 2 {
            self.turns.pop_front();
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Owned copy in insertion order, for seeding a session.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turn_pairs(&self) -> usize {
        self.max_turn_pairs
    }
}
