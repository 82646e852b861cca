//! Ordered external mutations with compensating rollback
//!
//! A [`MultiResourceTransaction`] runs its steps forward in order. When a step
//! fails, every step that completed before it is compensated, newest first.
//! Compensation keeps going past failures so that as much as possible is
//! restored, and the steps it could not restore are named in the outcome.
//!
//! A step is only compensated if its forward action returned successfully, so
//! compensation never has to guess whether the forward action ran.

use async_trait::async_trait;
use placemend_core::{PlacemendError, PlacemendResult};
use tracing::{debug, error, warn};

/// One external mutation and its inverse
#[async_trait]
pub trait Step: Send {
    /// Name surfaced to the operator when the step fails or cannot be undone
    fn name(&self) -> String;

    async fn forward(&mut self) -> PlacemendResult<()>;

    async fn compensate(&mut self) -> PlacemendResult<()>;
}

/// A step whose compensation failed
#[derive(Debug)]
pub struct CompensationFailure {
    pub step: String,
    pub error: PlacemendError,
}

/// Result of applying a transaction
#[derive(Debug)]
pub enum TransactionOutcome {
    /// Every forward action succeeded
    Committed,
    /// `failed_step` failed and every earlier step was compensated
    RolledBack {
        failed_step: String,
        error: PlacemendError,
    },
    /// `failed_step` failed and some earlier steps could not be compensated
    RollbackFailed {
        failed_step: String,
        error: PlacemendError,
        uncompensated: Vec<CompensationFailure>,
    },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

/// Ordered list of steps applied with all-or-compensate semantics
#[derive(Default)]
pub struct MultiResourceTransaction<'a> {
    steps: Vec<Box<dyn Step + 'a>>,
}

impl<'a> MultiResourceTransaction<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: impl Step + 'a) {
        self.steps.push(Box::new(step));
    }

    pub async fn apply(mut self) -> TransactionOutcome {
        let mut failure = None;
        for (index, step) in self.steps.iter_mut().enumerate() {
            debug!(step = %step.name(), "Applying step");
            if let Err(e) = step.forward().await {
                warn!(step = %step.name(), error = %e, "Step failed, rolling back");
                failure = Some((index, step.name(), e));
                break;
            }
        }

        let Some((failed_index, failed_step, error)) = failure else {
            return TransactionOutcome::Committed;
        };

        let mut uncompensated = Vec::new();
        for step in self.steps[..failed_index].iter_mut().rev() {
            if let Err(e) = step.compensate().await {
                error!(step = %step.name(), error = %e, "Compensation failed");
                uncompensated.push(CompensationFailure {
                    step: step.name(),
                    error: e,
                });
            }
        }

        if uncompensated.is_empty() {
            TransactionOutcome::RolledBack { failed_step, error }
        } else {
            TransactionOutcome::RollbackFailed {
                failed_step,
                error,
                uncompensated,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placemend_core::Service;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorded {
        name: &'static str,
        journal: Journal,
        fail_forward: bool,
        fail_compensate: bool,
    }

    impl Recorded {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail_forward: false,
                fail_compensate: false,
            }
        }
    }

    #[async_trait]
    impl Step for Recorded {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn forward(&mut self) -> PlacemendResult<()> {
            if self.fail_forward {
                return Err(PlacemendError::unavailable(Service::Ledger, "down"));
            }
            self.journal.lock().unwrap().push(format!("+{}", self.name));
            Ok(())
        }

        async fn compensate(&mut self) -> PlacemendResult<()> {
            if self.fail_compensate {
                return Err(PlacemendError::unavailable(Service::Network, "down"));
            }
            self.journal.lock().unwrap().push(format!("-{}", self.name));
            Ok(())
        }
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_all_steps_commit() {
        let journal = Journal::default();
        let mut tx = MultiResourceTransaction::new();
        tx.push(Recorded::new("a", &journal));
        tx.push(Recorded::new("b", &journal));

        assert!(tx.apply().await.is_committed());
        assert_eq!(entries(&journal), vec!["+a", "+b"]);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let journal = Journal::default();
        let mut tx = MultiResourceTransaction::new();
        tx.push(Recorded::new("a", &journal));
        tx.push(Recorded::new("b", &journal));
        let mut last = Recorded::new("c", &journal);
        last.fail_forward = true;
        tx.push(last);

        match tx.apply().await {
            TransactionOutcome::RolledBack { failed_step, error } => {
                assert_eq!(failed_step, "c");
                assert!(error.is_unavailable());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // c never ran, so it is not compensated
        assert_eq!(entries(&journal), vec!["+a", "+b", "-b", "-a"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported_and_rest_continue() {
        let journal = Journal::default();
        let mut tx = MultiResourceTransaction::new();
        tx.push(Recorded::new("a", &journal));
        let mut sticky = Recorded::new("b", &journal);
        sticky.fail_compensate = true;
        tx.push(sticky);
        let mut last = Recorded::new("c", &journal);
        last.fail_forward = true;
        tx.push(last);

        match tx.apply().await {
            TransactionOutcome::RollbackFailed {
                failed_step,
                uncompensated,
                ..
            } => {
                assert_eq!(failed_step, "c");
                assert_eq!(uncompensated.len(), 1);
                assert_eq!(uncompensated[0].step, "b");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(entries(&journal), vec!["+a", "+b", "-a"]);
    }

    #[tokio::test]
    async fn test_first_step_failure_has_nothing_to_undo() {
        let journal = Journal::default();
        let mut tx = MultiResourceTransaction::new();
        let mut first = Recorded::new("a", &journal);
        first.fail_forward = true;
        tx.push(first);
        tx.push(Recorded::new("b", &journal));

        assert!(matches!(
            tx.apply().await,
            TransactionOutcome::RolledBack { .. }
        ));
        assert!(entries(&journal).is_empty());
    }
}
