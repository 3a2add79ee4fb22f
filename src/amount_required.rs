//! AmountRequired (§4.7): a trivial monotonic threshold tracker that logs at
//! most once per satisfied/unsatisfied transition.

use tracing::{info, warn};

pub struct AmountRequired {
    description: String,
    required: u64,
    current: u64,
    was_satisfied: bool,
}

impl AmountRequired {
    pub fn new(description: impl Into<String>, required: u64) -> Self {
        Self {
            description: description.into(),
            required,
            current: 0,
            was_satisfied: true,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.current >= self.required
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Updates `current`, logging once on a transition into or out of
    /// satisfaction.
    pub fn set(&mut self, value: u64) {
        self.current = value;
        let satisfied = self.is_satisfied();

        if satisfied && !self.was_satisfied {
            info!(description = %self.description, current = self.current, required = self.required, "requirement satisfied");
        } else if !satisfied && self.was_satisfied {
            warn!(description = %self.description, current = self.current, required = self.required, "requirement not satisfied");
        }

        self.was_satisfied = satisfied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_satisfaction_threshold() {
        let mut amount = AmountRequired::new("manager balance", 100);
        assert!(!amount.is_satisfied());

        amount.set(150);
        assert!(amount.is_satisfied());

        amount.set(50);
        assert!(!amount.is_satisfied());
    }

    #[test]
    fn zero_required_is_immediately_satisfied() {
        let amount = AmountRequired::new("noop", 0);
        assert!(amount.is_satisfied());
    }
}
