//! Host introspection
//!
//! Decides how much of the machine the decoder may use.

pub mod threads;

pub use threads::{thread_count, ThreadBudget};
