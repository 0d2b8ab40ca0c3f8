//! Package revision lifecycle and its transition rules
//!
//! ```text
//! Draft <-> Proposed -> Published <-> DeletionProposed
//! ```
//!
//! Regular updates may move a revision between `Draft` and `Proposed` and
//! between `Published` and `DeletionProposed`. Publishing (and rejecting a
//! proposal) goes through the approval subresource.

use serde::{Deserialize, Serialize};

use crate::error::FieldErrors;

/// Field path used in lifecycle validation errors
pub const LIFECYCLE_FIELD: &str = "spec.lifecycle";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Draft,
    Proposed,
    Published,
    DeletionProposed,
}

impl Lifecycle {
    /// Whether resources and tasks may still change
    pub fn is_mutable(self) -> bool {
        matches!(self, Lifecycle::Draft)
    }

    /// Whether the revision has a revision number
    pub fn is_published(self) -> bool {
        matches!(self, Lifecycle::Published | Lifecycle::DeletionProposed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Draft => "Draft",
            Lifecycle::Proposed => "Proposed",
            Lifecycle::Published => "Published",
            Lifecycle::DeletionProposed => "DeletionProposed",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Draft" => Ok(Lifecycle::Draft),
            "Proposed" => Ok(Lifecycle::Proposed),
            "Published" => Ok(Lifecycle::Published),
            "DeletionProposed" => Ok(Lifecycle::DeletionProposed),
            other => Err(format!("unknown lifecycle '{other}'")),
        }
    }
}

/// Which update path a lifecycle change arrives through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStrategy {
    /// Regular object update
    Update,
    /// The approval subresource
    Approval,
}

/// Whether `from -> to` is legal through `strategy`; unchanged is always legal
pub fn is_legal_transition(strategy: TransitionStrategy, from: Lifecycle, to: Lifecycle) -> bool {
    if from == to {
        return true;
    }
    match strategy {
        TransitionStrategy::Update => matches!(
            (from, to),
            (Lifecycle::Draft, Lifecycle::Proposed)
                | (Lifecycle::Proposed, Lifecycle::Draft)
                | (Lifecycle::Published, Lifecycle::DeletionProposed)
                | (Lifecycle::DeletionProposed, Lifecycle::Published)
        ),
        TransitionStrategy::Approval => matches!(
            (from, to),
            (Lifecycle::Proposed, Lifecycle::Draft | Lifecycle::Published)
                | (Lifecycle::Published, Lifecycle::DeletionProposed)
                | (Lifecycle::DeletionProposed, Lifecycle::Published)
        ),
    }
}

/// Validate a transition, naming both states in the field error
pub fn validate_transition(
    strategy: TransitionStrategy,
    from: Lifecycle,
    to: Lifecycle,
) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if !is_legal_transition(strategy, from, to) {
        let hint = match (strategy, to) {
            (TransitionStrategy::Update, Lifecycle::Published) => "; use the approval subresource",
            _ => "",
        };
        errors.push(
            LIFECYCLE_FIELD,
            format!("cannot change lifecycle from {from} to {to}{hint}"),
        );
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    use Lifecycle::{DeletionProposed, Draft, Proposed, Published};
    use TransitionStrategy::{Approval, Update};

    #[test]
    fn test_update_transitions() {
        assert!(is_legal_transition(Update, Draft, Proposed));
        assert!(is_legal_transition(Update, Proposed, Draft));
        assert!(is_legal_transition(Update, Published, DeletionProposed));
        assert!(!is_legal_transition(Update, Proposed, Published));
        assert!(!is_legal_transition(Update, Draft, Published));
    }

    #[test]
    fn test_approval_transitions() {
        assert!(is_legal_transition(Approval, Proposed, Published));
        assert!(is_legal_transition(Approval, Proposed, Draft));
        assert!(is_legal_transition(Approval, DeletionProposed, Published));
        assert!(!is_legal_transition(Approval, Published, Draft));
        assert!(!is_legal_transition(Approval, Draft, Published));
    }

    #[test]
    fn test_unchanged_is_legal() {
        for state in [Draft, Proposed, Published, DeletionProposed] {
            assert!(is_legal_transition(Approval, state, state));
            assert!(is_legal_transition(Update, state, state));
        }
    }

    #[test]
    fn test_error_names_both_states() {
        let errors = validate_transition(Approval, Published, Draft);
        assert!(errors.contains_field(LIFECYCLE_FIELD));
        let message = errors.to_string();
        assert!(message.contains("Published"));
        assert!(message.contains("Draft"));
    }

    #[test]
    fn test_update_to_published_hints_approval() {
        let errors = validate_transition(Update, Proposed, Published);
        assert!(errors.to_string().contains("approval"));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&DeletionProposed).unwrap(), "\"DeletionProposed\"");
        assert_eq!("Proposed".parse::<Lifecycle>().unwrap(), Proposed);
    }
}
