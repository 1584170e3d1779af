use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chat turn. Immutable once appended; the history only grows until
/// an explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Session-scoped conversation state: the ordered turn history plus the
/// id of the most recent completed remote response, which threads
/// context across turns without resending the full history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<Turn>,
    last_response_id: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_response_id(&self) -> Option<&str> {
        self.last_response_id.as_deref()
    }

    /// Append one user turn and one assistant turn atomically.
    ///
    /// Only called once a turn has fully completed; failed or empty
    /// exchanges must leave the store untouched. An absent or blank
    /// `response_id` keeps the previous id instead of clearing it.
    pub fn commit_exchange(
        &mut self,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        response_id: Option<String>,
    ) {
        self.turns.push(Turn {
            role: Role::User,
            content: user_text.into(),
        });
        self.turns.push(Turn {
            role: Role::Assistant,
            content: assistant_text.into(),
        });
        if let Some(id) = response_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.last_response_id = Some(id);
        }
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.last_response_id = None;
    }
}
