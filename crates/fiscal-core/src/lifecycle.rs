//! # Attempt Lifecycle
//!
//! The state machine every invoice attempt follows.
//!
//! ```text
//!                 Claim                 Complete
//!   ┌─────────┐ ───────► ┌────────────┐ ───────► ┌───────────┐
//!   │ pending │          │ processing │          │ completed │
//!   └─────────┘ ◄──┐     └────────────┘ ───┐     └───────────┘
//!                  │        ▲      │       │ Fail
//!            Rearm │        └──────┘       ▼
//!                  │        Reclaim     ┌───────┐
//!                  └─────────────────── │ error │
//!                                       └───────┘
//! ```
//!
//! Anything outside this table is a programming error. The database layer
//! enforces the same moves with conditional updates; this module is the
//! reference both sides check against.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// State of an invoice attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum AttemptState {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker; a submission may be in flight.
    Processing,
    /// Authorized. Terminal.
    Completed,
    /// Failed with a classified cause. Terminal until re-armed.
    Error,
}

impl AttemptState {
    pub const fn as_str(self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Processing => "processing",
            AttemptState::Completed => "completed",
            AttemptState::Error => "error",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::Error)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptState::Pending),
            "processing" => Ok(AttemptState::Processing),
            "completed" => Ok(AttemptState::Completed),
            "error" => Ok(AttemptState::Error),
            _ => Err(CoreError::UnknownCode {
                kind: "attempt state",
                code: -1,
            }),
        }
    }
}

/// A move through the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    /// `pending → processing`, taken by exactly one worker.
    Claim,
    /// `processing → processing` for an attempt abandoned by its worker.
    Reclaim,
    /// `processing → completed`.
    Complete,
    /// `processing → error`.
    Fail,
    /// `error → pending`, by an operator or a corrective rule.
    Rearm,
}

impl Transition {
    /// The only state this transition may start from.
    pub const fn source(self) -> AttemptState {
        match self {
            Transition::Claim => AttemptState::Pending,
            Transition::Reclaim | Transition::Complete | Transition::Fail => {
                AttemptState::Processing
            }
            Transition::Rearm => AttemptState::Error,
        }
    }

    pub const fn target(self) -> AttemptState {
        match self {
            Transition::Claim | Transition::Reclaim => AttemptState::Processing,
            Transition::Complete => AttemptState::Completed,
            Transition::Fail => AttemptState::Error,
            Transition::Rearm => AttemptState::Pending,
        }
    }

    /// Whether this transition counts as a pass through `processing`.
    pub const fn starts_pass(self) -> bool {
        matches!(self, Transition::Claim | Transition::Reclaim)
    }
}

/// Applies `transition` to `from`, returning the new state.
pub fn apply(from: AttemptState, transition: Transition) -> CoreResult<AttemptState> {
    if from == transition.source() {
        Ok(transition.target())
    } else {
        Err(CoreError::InvalidTransition { from, transition })
    }
}

/// Checks that an authorization is usable for completing an attempt.
///
/// The code must be non-empty and the expiry must not lie before `today`.
pub fn validate_completion(
    authorization_code: &str,
    expiry: NaiveDate,
    today: NaiveDate,
) -> CoreResult<()> {
    if authorization_code.trim().is_empty() {
        return Err(CoreError::IncompleteAuthorization {
            reason: "authorization code is empty".to_string(),
        });
    }
    if expiry < today {
        return Err(CoreError::IncompleteAuthorization {
            reason: format!("authorization code expired on {}", expiry),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [AttemptState; 4] = [
        AttemptState::Pending,
        AttemptState::Processing,
        AttemptState::Completed,
        AttemptState::Error,
    ];

    const ALL_TRANSITIONS: [Transition; 5] = [
        Transition::Claim,
        Transition::Reclaim,
        Transition::Complete,
        Transition::Fail,
        Transition::Rearm,
    ];

    #[test]
    fn test_happy_path() {
        let s = apply(AttemptState::Pending, Transition::Claim).unwrap();
        assert_eq!(s, AttemptState::Processing);
        let s = apply(s, Transition::Complete).unwrap();
        assert_eq!(s, AttemptState::Completed);
    }

    #[test]
    fn test_rearm_path() {
        let s = apply(AttemptState::Processing, Transition::Fail).unwrap();
        let s = apply(s, Transition::Rearm).unwrap();
        assert_eq!(s, AttemptState::Pending);
    }

    #[test]
    fn test_exactly_one_source_per_transition() {
        for t in ALL_TRANSITIONS {
            let allowed: Vec<_> = ALL_STATES
                .iter()
                .filter(|s| apply(**s, t).is_ok())
                .collect();
            assert_eq!(allowed.len(), 1, "{:?}", t);
        }
    }

    #[test]
    fn test_completed_is_final() {
        for t in ALL_TRANSITIONS {
            let err = apply(AttemptState::Completed, t).unwrap_err();
            assert!(matches!(err, CoreError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_completion_requires_code_and_live_expiry() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let later = NaiveDate::from_ymd_opt(2026, 3, 12).unwrap();
        let earlier = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        assert!(validate_completion("76123456789012", later, today).is_ok());
        assert!(validate_completion("76123456789012", today, today).is_ok());
        assert!(validate_completion("", later, today).is_err());
        assert!(validate_completion("  ", later, today).is_err());
        assert!(validate_completion("76123456789012", earlier, today).is_err());
    }

    #[test]
    fn test_state_text_round_trip() {
        for s in ALL_STATES {
            assert_eq!(s.as_str().parse::<AttemptState>().unwrap(), s);
        }
        assert!("done".parse::<AttemptState>().is_err());
    }
}
