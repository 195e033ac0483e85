//! aichat
//!
//! Single-session chat runtime over llama.cpp with a sliding context window
//! and UTF-8 safe token streaming.

pub mod config;
pub mod inference;
pub mod system;
pub mod types;
