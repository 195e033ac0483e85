//! Decoder thread budget
//!
//! The decoder gets the available cores minus a headroom left to the OS and
//! the caller's UI thread, clamped to a fixed range.

use serde::{Deserialize, Serialize};

/// Bounds for the decoder thread count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBudget {
    pub min: u32,
    pub max: u32,
    /// Cores kept free for everything else
    pub headroom: u32,
}

impl Default for ThreadBudget {
    fn default() -> Self {
        Self {
            min: 2,
            max: 4,
            headroom: 2,
        }
    }
}

impl ThreadBudget {
    /// Thread count for a machine with `cores` logical cores.
    pub fn threads_for(&self, cores: u32) -> u32 {
        let max = self.max.max(self.min);
        cores.saturating_sub(self.headroom).clamp(self.min, max)
    }
}

/// Thread count for this machine.
pub fn thread_count(budget: &ThreadBudget) -> u32 {
    let cores = num_cpus::get() as u32;
    let threads = budget.threads_for(cores);
    tracing::info!("Using {} threads ({} cores available)", threads, cores);
    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_clamped_to_range() {
        let budget = ThreadBudget::default();
        assert_eq!(budget.threads_for(1), 2);
        assert_eq!(budget.threads_for(4), 2);
        assert_eq!(budget.threads_for(5), 3);
        assert_eq!(budget.threads_for(16), 4);
    }

    #[test]
    fn test_inverted_bounds_do_not_panic() {
        let budget = ThreadBudget {
            min: 6,
            max: 2,
            headroom: 0,
        };
        assert_eq!(budget.threads_for(3), 6);
    }

    #[test]
    fn test_thread_count_within_bounds() {
        let budget = ThreadBudget::default();
        let threads = thread_count(&budget);
        assert!((budget.min..=budget.max).contains(&threads));
    }
}
