//! Conversation state
//!
//! Holds the ordered chat turns of a session together with the rendered
//! template text the engine has already consumed.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// A single chat turn.
///
/// Turns are immutable once created. The role is an open tag such as
/// `"user"`, `"assistant"` or `"system"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: String,
    content: String,
}

impl Turn {
    /// Create a turn with an arbitrary role tag
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Ordered turns plus the cursor into the rendered template.
///
/// The consumed text is the template rendering (without generation prompt)
/// as it stood after the last successful turn. Its length is the cursor.
/// Keeping the text rather than only its length lets the next turn verify
/// that the fresh rendering still starts with it.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    consumed: String,
}

impl Conversation {
    /// Create an empty conversation with the cursor at 0
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Byte offset into the rendered template already fed to the engine
    pub fn cursor(&self) -> usize {
        self.consumed.len()
    }

    pub fn extend<I>(&mut self, turns: I)
    where
        I: IntoIterator<Item = Turn>,
    {
        self.turns.extend(turns);
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Replace the stored turns without touching the cursor.
    pub fn replace_turns(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }

    /// Returns the part of `rendered` that lies past the cursor.
    ///
    /// Fails with [`SessionError::StateInconsistency`] when the previously
    /// consumed text is not a prefix of `rendered`.
    pub fn prompt_diff<'a>(&self, rendered: &'a str) -> Result<&'a str, SessionError> {
        rendered
            .strip_prefix(self.consumed.as_str())
            .ok_or(SessionError::StateInconsistency {
                cursor: self.cursor(),
                rendered_len: rendered.len(),
            })
    }

    /// Record `rendered` as the text consumed so far. The cursor is
    /// recomputed from it, never incremented.
    pub fn commit(&mut self, rendered: String) {
        self.consumed = rendered;
    }

    /// Drop all turns and move the cursor back to 0
    pub fn clear(&mut self) {
        self.turns.clear();
        self.consumed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_constructors() {
        let turn = Turn::user("Hello");
        assert_eq!(turn.role(), "user");
        assert_eq!(turn.content(), "Hello");

        assert_eq!(Turn::assistant("x").role(), "assistant");
        assert_eq!(Turn::system("x").role(), "system");
        assert_eq!(Turn::new("tool", "{}").role(), "tool");
    }

    #[test]
    fn test_turn_serialization() {
        let turn = Turn::user("Hello");
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hello"}"#);
    }

    #[test]
    fn test_prompt_diff_from_empty_cursor() {
        let conversation = Conversation::new();
        assert_eq!(conversation.cursor(), 0);
        assert_eq!(conversation.prompt_diff("<user>hi").unwrap(), "<user>hi");
    }

    #[test]
    fn test_prompt_diff_after_commit() {
        let mut conversation = Conversation::new();
        conversation.commit("<user>hi<end>".to_string());
        assert_eq!(conversation.cursor(), 13);

        let diff = conversation
            .prompt_diff("<user>hi<end><user>again")
            .unwrap();
        assert_eq!(diff, "<user>again");
    }

    #[test]
    fn test_prompt_diff_detects_prefix_mismatch() {
        let mut conversation = Conversation::new();
        conversation.commit("<user>hi<end>".to_string());

        let result = conversation.prompt_diff("<user>HI<end><user>again");
        assert!(matches!(
            result,
            Err(SessionError::StateInconsistency {
                cursor: 13,
                rendered_len: 24
            })
        ));

        // Shorter than the cursor is also a mismatch
        assert!(conversation.prompt_diff("<user>").is_err());
    }

    #[test]
    fn test_clear_resets_cursor() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::user("a"));
        conversation.commit("rendered".to_string());

        conversation.clear();
        assert!(conversation.turns().is_empty());
        assert_eq!(conversation.cursor(), 0);
    }
}
