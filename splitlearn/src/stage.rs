//! Per-step position of one side in the staged forward/backward exchange.

use crate::error::{Result, SplitErr};

/// The state machine driven at each split boundary during one training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No cycle in flight; the retained-activation list must be empty.
    AwaitingInput,
    /// Running local segments of the forward pass.
    Forwarding,
    /// Blocked on the peer's reply at a boundary.
    AwaitingReply,
    /// Walking retained activations in reverse.
    Backpropagating,
    /// A full forward+backward cycle completed.
    Done,
}

impl ExchangeState {
    fn name(self) -> &'static str {
        match self {
            ExchangeState::AwaitingInput => "awaiting input",
            ExchangeState::Forwarding => "forwarding",
            ExchangeState::AwaitingReply => "awaiting reply",
            ExchangeState::Backpropagating => "backpropagating",
            ExchangeState::Done => "done",
        }
    }

    fn permits(self, next: ExchangeState) -> bool {
        use ExchangeState::*;

        matches!(
            (self, next),
            (AwaitingInput, Forwarding)
                | (Done, Forwarding)
                | (Forwarding, AwaitingReply)
                | (AwaitingReply, Forwarding)
                | (Forwarding, Backpropagating)
                | (Backpropagating, Done)
        )
    }
}

/// Validates exchange transitions, turning ordering violations into
/// [`SplitErr::StaleState`] instead of corrupted frames further down.
#[derive(Debug)]
pub struct StageTracker {
    state: ExchangeState,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::AwaitingInput,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Moves to `next` if the exchange permits it.
    ///
    /// # Errors
    /// `StaleState` carrying the attempted operation and the retained count.
    pub fn advance(&mut self, next: ExchangeState, retained: usize) -> Result<()> {
        if !self.state.permits(next) {
            return Err(SplitErr::StaleState {
                op: next.name(),
                retained,
            });
        }

        self.state = next;
        Ok(())
    }

    /// Asserts the current state without moving.
    pub fn require(&self, expected: ExchangeState, retained: usize) -> Result<()> {
        if self.state != expected {
            return Err(SplitErr::StaleState {
                op: expected.name(),
                retained,
            });
        }
        Ok(())
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExchangeState::*;

    #[test]
    fn a_full_cycle_is_legal() {
        let mut tracker = StageTracker::new();

        tracker.advance(Forwarding, 0).unwrap();
        tracker.advance(AwaitingReply, 1).unwrap();
        tracker.advance(Forwarding, 1).unwrap();
        tracker.advance(Backpropagating, 2).unwrap();
        tracker.advance(Done, 0).unwrap();

        // The next step starts over from `Done`.
        tracker.advance(Forwarding, 0).unwrap();
    }

    #[test]
    fn backward_before_forward_is_stale() {
        let mut tracker = StageTracker::new();

        assert!(matches!(
            tracker.advance(Backpropagating, 0),
            Err(SplitErr::StaleState { .. })
        ));
    }

    #[test]
    fn a_second_forward_mid_cycle_is_stale() {
        let mut tracker = StageTracker::new();

        tracker.advance(Forwarding, 0).unwrap();
        tracker.advance(Backpropagating, 1).unwrap();

        assert!(matches!(
            tracker.advance(Forwarding, 1),
            Err(SplitErr::StaleState { .. })
        ));
    }

    #[test]
    fn require_rejects_the_wrong_state() {
        let tracker = StageTracker::new();
        assert!(tracker.require(AwaitingInput, 0).is_ok());
        assert!(tracker.require(Backpropagating, 0).is_err());
    }
}
