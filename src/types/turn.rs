//! Turn framing
//!
//! Turns are wrapped in plain role markers before tokenization. The assistant
//! marker is appended to every user turn so the model continues as the
//! assistant.

use serde::{Deserialize, Serialize};

/// Role of a turn in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
}

/// Text placed around each turn before it is tokenized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptFormat {
    pub system_prefix: String,
    pub system_suffix: String,
    pub user_prefix: String,
    /// Closes the user turn and opens the assistant's reply
    pub user_suffix: String,
}

impl Default for PromptFormat {
    fn default() -> Self {
        Self {
            system_prefix: "System: ".to_string(),
            system_suffix: "\n".to_string(),
            user_prefix: "User: ".to_string(),
            user_suffix: "\nAssistant: ".to_string(),
        }
    }
}

impl PromptFormat {
    /// Wrap `text` in the markers for `role`.
    ///
    /// Assistant text is generated, never submitted, so it is returned as is.
    pub fn frame(&self, role: Role, text: &str) -> String {
        match role {
            Role::System => format!("{}{}{}", self.system_prefix, text, self.system_suffix),
            Role::User => format!("{}{}{}", self.user_prefix, text, self.user_suffix),
            Role::Assistant => text.to_string(),
        }
    }
}
