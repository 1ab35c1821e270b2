//! Rest-screen cadence for scored trials.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Decides whether a rest screen follows a scored trial.
///
/// Breaks are offered every `interval` scored trials, except immediately
/// after the final trial (redundant with the end-of-run transition) and at
/// the exact halfway trial, which is reserved for the dedicated halfway
/// screen. Odd totals have no trial at exactly half the run, so the halfway
/// exclusion only applies when `total_trials` is even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakPolicy {
    pub interval: u32,
    pub total_trials: u32,
}

impl BreakPolicy {
    pub fn new(interval: u32, total_trials: u32) -> Result<Self> {
        if interval == 0 {
            return Err(Error::InvalidConfig(
                "break interval must be positive".to_string(),
            ));
        }
        if total_trials == 0 {
            return Err(Error::InvalidConfig(
                "total trial count must be positive".to_string(),
            ));
        }
        Ok(Self {
            interval,
            total_trials,
        })
    }

    /// Midpoint of the run, truncating for odd totals.
    pub fn halfway_trial(&self) -> u32 {
        self.total_trials / 2
    }

    /// Whether a rest screen follows the scored trial with this 1-based
    /// number.
    pub fn offers_break_after(&self, trial_num: u32) -> bool {
        if trial_num == 0 || trial_num % self.interval != 0 {
            return false;
        }
        if trial_num == self.total_trials {
            return false;
        }
        if self.total_trials % 2 == 0 && trial_num == self.halfway_trial() {
            return false;
        }
        true
    }
}

/// Free-function form of the break decision; validates its configuration on
/// every call.
pub fn should_insert_break(trial_num: u32, interval: u32, total_trials: u32) -> Result<bool> {
    Ok(BreakPolicy::new(interval, total_trials)?.offers_break_after(trial_num))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaks_fall_on_interval_multiples() {
        assert!(should_insert_break(21, 21, 168).expect("valid policy"));
        assert!(should_insert_break(42, 21, 168).expect("valid policy"));
        assert!(should_insert_break(126, 21, 168).expect("valid policy"));
    }

    #[test]
    fn off_multiples_never_break() {
        let policy = BreakPolicy::new(21, 168).expect("valid policy");
        for trial_num in [1, 5, 20, 22, 100, 167] {
            assert!(
                !policy.offers_break_after(trial_num),
                "unexpected break after trial {}",
                trial_num
            );
        }
    }

    #[test]
    fn zeroth_trial_never_breaks() {
        assert!(!should_insert_break(0, 21, 168).expect("valid policy"));
    }

    #[test]
    fn final_trial_never_breaks() {
        assert!(!should_insert_break(168, 21, 168).expect("valid policy"));
        assert!(!should_insert_break(8, 4, 8).expect("valid policy"));
    }

    #[test]
    fn halfway_trial_is_reserved_for_the_halfway_screen() {
        assert!(!should_insert_break(84, 21, 168).expect("valid policy"));
        assert!(!should_insert_break(135, 27, 270).expect("valid policy"));
    }

    #[test]
    fn odd_totals_have_no_halfway_exclusion() {
        // 85 / 2 truncates to 42; trial 42 still gets its interval break.
        assert!(should_insert_break(42, 42, 85).expect("valid policy"));
    }

    #[test]
    fn zero_interval_is_invalid() {
        let err = should_insert_break(10, 0, 168).expect_err("should fail");
        assert!(
            err.to_string().contains("invalid_config"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn zero_total_is_invalid() {
        assert!(should_insert_break(10, 21, 0).is_err());
    }
}
