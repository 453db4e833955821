//! Typed operation outcomes composed with short-circuit combinators,
//! instead of exceptions thrown mid-verification.

use super::BlockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Header,
    Randao,
    Eth1Data,
    ProposerSlashing,
    AttesterSlashing,
    Attestation,
    Deposit,
    VoluntaryExit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Passed,
    Failed { kind: OperationKind, reason: String },
}

impl Verification {
    pub fn require(condition: bool, kind: OperationKind, reason: impl Into<String>) -> Self {
        if condition {
            Verification::Passed
        } else {
            Verification::Failed {
                kind,
                reason: reason.into(),
            }
        }
    }

    /// Evaluate the next check only if this one passed.
    pub fn and_then(self, next: impl FnOnce() -> Verification) -> Verification {
        match self {
            Verification::Passed => next(),
            failed => failed,
        }
    }

    pub fn into_result(self) -> Result<(), BlockError> {
        match self {
            Verification::Passed => Ok(()),
            Verification::Failed { kind, reason } => {
                Err(BlockError::OperationInvalid { kind, reason })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn later_checks_do_not_run_after_a_failure() {
        let outcome = Verification::require(false, OperationKind::Deposit, "first")
            .and_then(|| panic!("must not be evaluated"));
        assert!(matches!(outcome, Verification::Failed { reason, .. } if reason == "first"));
    }

    #[test]
    fn chains_collapse_to_the_first_failure() {
        let outcome = Verification::require(true, OperationKind::Attestation, "a")
            .and_then(|| Verification::require(false, OperationKind::Attestation, "b"))
            .and_then(|| Verification::require(false, OperationKind::Attestation, "c"));
        assert!(matches!(outcome, Verification::Failed { reason, .. } if reason == "b"));
        assert!(Verification::require(true, OperationKind::Randao, "ok")
            .into_result()
            .is_ok());
    }
}
