//! Context window management
//!
//! Tracks the append-only position cursor into the fixed-capacity context and
//! reclaims space by evicting the older half of the conversation that follows
//! the system prompt.

use thiserror::Error;

use crate::inference::backend::{BackendError, InferenceBackend};

/// Errors raised while shifting the context window
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShiftError {
    #[error(
        "Context exhausted: nothing to evict after the system prompt ({system_prompt_position} of {capacity} positions)"
    )]
    Exhausted {
        system_prompt_position: u32,
        capacity: u32,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Cursor bookkeeping for the single sequence held in the context.
///
/// Invariant: `0 <= system_prompt_position <= current_position <= capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    capacity: u32,
    headroom: u32,
    system_prompt_position: u32,
    current_position: u32,
}

impl ContextWindow {
    /// Creates an empty window. `headroom` is clamped below `capacity`.
    pub fn new(capacity: u32, headroom: u32) -> Self {
        Self {
            capacity,
            headroom: headroom.min(capacity.saturating_sub(1)),
            system_prompt_position: 0,
            current_position: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    /// Highest cursor value appends may reach: `capacity - headroom`.
    pub fn limit(&self) -> u32 {
        self.capacity - self.headroom
    }

    pub fn current_position(&self) -> u32 {
        self.current_position
    }

    pub fn system_prompt_position(&self) -> u32 {
        self.system_prompt_position
    }

    /// True iff `n` more tokens fit without touching the reserved headroom.
    pub fn has_room(&self, n: u32) -> bool {
        self.current_position.saturating_add(n) <= self.limit()
    }

    /// True once the cursor sits in the reserved headroom.
    pub fn is_full(&self) -> bool {
        self.current_position >= self.limit()
    }

    /// Tokens a single turn may occupy next to the system prompt.
    pub fn turn_budget(&self) -> u32 {
        self.limit().saturating_sub(self.system_prompt_position)
    }

    /// Moves the cursor past `n` freshly decoded tokens.
    pub(crate) fn advance(&mut self, n: u32) {
        debug_assert!(self.current_position + n <= self.capacity);
        self.current_position = (self.current_position + n).min(self.capacity);
    }

    /// Freezes everything decoded so far as the system prompt prefix.
    pub(crate) fn seal_system_prompt(&mut self) {
        self.system_prompt_position = self.current_position;
    }

    /// Forgets the whole conversation, system prompt included.
    pub(crate) fn reset(&mut self) {
        self.system_prompt_position = 0;
        self.current_position = 0;
    }

    /// Evicts the oldest half of the history after the system prompt.
    ///
    /// Removes `[system, system + n_discard)` from the backend, slides
    /// `[system + n_discard, current)` left by `n_discard` and returns
    /// `n_discard`.
    pub fn shift<B: InferenceBackend>(&mut self, backend: &mut B) -> Result<u32, ShiftError> {
        let n_discard = (self.current_position - self.system_prompt_position) / 2;
        if n_discard == 0 {
            tracing::error!(
                "Cannot shift context: system prompt occupies {} of {} positions",
                self.system_prompt_position,
                self.capacity
            );
            return Err(ShiftError::Exhausted {
                system_prompt_position: self.system_prompt_position,
                capacity: self.capacity,
            });
        }

        tracing::info!("Discarding {} tokens", n_discard);
        let keep_from = self.system_prompt_position + n_discard;
        backend.remove_positions(self.system_prompt_position, keep_from)?;
        backend.shift_positions(keep_from, self.current_position, -(n_discard as i32))?;

        self.current_position -= n_discard;
        tracing::info!(
            "Context shifting done! Current position: {}",
            self.current_position
        );
        Ok(n_discard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::{BatchToken, TokenId};
    use crate::inference::testing::ScriptedBackend;

    fn fill(window: &mut ContextWindow, backend: &mut ScriptedBackend, n: u32) {
        for _ in 0..n {
            let position = window.current_position();
            backend
                .decode(&[BatchToken {
                    token: TokenId(1000 + position as i32),
                    position,
                    wants_logits: false,
                }])
                .unwrap();
            window.advance(1);
        }
    }

    #[test]
    fn test_has_room_respects_headroom() {
        let mut window = ContextWindow::new(256, 4);
        window.advance(250);
        assert!(window.has_room(2));
        assert!(!window.has_room(3));
        assert!(!window.is_full());
        window.advance(2);
        assert!(window.is_full());
    }

    #[test]
    fn test_shift_discards_half_of_history() {
        let mut backend = ScriptedBackend::with_context(256);
        let mut window = ContextWindow::new(256, 4);
        fill(&mut window, &mut backend, 20);
        window.seal_system_prompt();
        fill(&mut window, &mut backend, 232);

        let discarded = window.shift(&mut backend).unwrap();

        assert_eq!(discarded, 116);
        assert_eq!(window.current_position(), 136);
        assert_eq!(window.system_prompt_position(), 20);
        assert_eq!(backend.removed, vec![(20, 136)]);
        assert_eq!(backend.shifted, vec![(136, 252, -116)]);
    }

    #[test]
    fn test_shift_renumbers_content() {
        let mut backend = ScriptedBackend::with_context(64);
        let mut window = ContextWindow::new(64, 4);
        fill(&mut window, &mut backend, 5);
        window.seal_system_prompt();
        fill(&mut window, &mut backend, 50);

        let last = backend.token_at(54);
        let system = backend.token_at(4);
        let discarded = window.shift(&mut backend).unwrap();

        assert_eq!(discarded, 25);
        assert_eq!(backend.token_at(54 - 25), last);
        assert_eq!(backend.token_at(4), system);
        assert_eq!(backend.resident_len(), 30);
    }

    #[test]
    fn test_shift_with_odd_history_rounds_down() {
        let mut backend = ScriptedBackend::with_context(64);
        let mut window = ContextWindow::new(64, 4);
        fill(&mut window, &mut backend, 3);
        window.seal_system_prompt();
        fill(&mut window, &mut backend, 7);

        assert_eq!(window.shift(&mut backend).unwrap(), 3);
        assert_eq!(window.current_position(), 7);
    }

    #[test]
    fn test_shift_without_history_is_fatal() {
        let mut backend = ScriptedBackend::with_context(16);
        let mut window = ContextWindow::new(16, 4);
        fill(&mut window, &mut backend, 12);
        window.seal_system_prompt();

        let err = window.shift(&mut backend).unwrap_err();
        assert_eq!(
            err,
            ShiftError::Exhausted {
                system_prompt_position: 12,
                capacity: 16
            }
        );
        assert_eq!(window.current_position(), 12);
        assert!(backend.removed.is_empty());
    }

    #[test]
    fn test_turn_budget_and_reset() {
        let mut window = ContextWindow::new(256, 4);
        window.advance(16);
        window.seal_system_prompt();
        assert_eq!(window.turn_budget(), 236);

        window.reset();
        assert_eq!(window.current_position(), 0);
        assert_eq!(window.system_prompt_position(), 0);
        assert_eq!(window.turn_budget(), 252);
    }

    #[test]
    fn test_headroom_clamped_below_capacity() {
        let window = ContextWindow::new(4, 10);
        assert_eq!(window.headroom(), 3);
        assert_eq!(window.limit(), 1);
    }
}
