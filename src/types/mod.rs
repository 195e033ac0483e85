//! Shared types
//!
//! Conversation roles and the plain-text framing applied to each turn.

pub mod turn;

pub use turn::{PromptFormat, Role};
