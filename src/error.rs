//! Propagation errors

use thiserror::Error;

use crate::dynamics::Body;

/// Errors that can occur while propagating a trajectory.
///
/// Every failure detected after integration starts carries the time and
/// state at which it occurred. The partial trajectory is discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagationError {
    /// Caller misuse detected before any integration work
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid input
        message: String,
    },

    /// The dynamics were evaluated at the location of a primary body
    #[error("singularity: state coincides with the {body} at t = {t} (state = {state:?})")]
    Singularity {
        /// Primary the third body collided with
        body: Body,
        /// Stage time of the failed evaluation
        t: f64,
        /// Stage state of the failed evaluation
        state: Vec<f64>,
    },

    /// Step-size control could not satisfy the tolerances
    #[error("step size {h:e} underflowed at t = {t} (state = {state:?})")]
    StepSizeUnderflow {
        /// Time of the last accepted state
        t: f64,
        /// Rejected step size that fell below the minimum
        h: f64,
        /// Last accepted state
        state: Vec<f64>,
    },

    /// More trial steps than `Settings::max_steps`
    #[error("maximum number of steps ({max_steps}) exceeded at t = {t} (state = {state:?})")]
    MaxStepsExceeded {
        /// Time of the last accepted state
        t: f64,
        /// Last accepted state
        state: Vec<f64>,
        /// Configured step limit
        max_steps: u64,
    },

    /// An accepted state overflowed to NaN or infinity
    #[error("non-finite state at t = {t} (state = {state:?})")]
    NonFiniteState {
        /// Time of the offending state
        t: f64,
        /// The offending state
        state: Vec<f64>,
    },
}

impl PropagationError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        PropagationError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Time at which the failure occurred, if integration had started
    pub fn time(&self) -> Option<f64> {
        match self {
            PropagationError::InvalidArgument { .. } => None,
            PropagationError::Singularity { t, .. }
            | PropagationError::StepSizeUnderflow { t, .. }
            | PropagationError::MaxStepsExceeded { t, .. }
            | PropagationError::NonFiniteState { t, .. } => Some(*t),
        }
    }

    /// State at which the failure occurred, if integration had started
    pub fn state(&self) -> Option<&[f64]> {
        match self {
            PropagationError::InvalidArgument { .. } => None,
            PropagationError::Singularity { state, .. }
            | PropagationError::StepSizeUnderflow { state, .. }
            | PropagationError::MaxStepsExceeded { state, .. }
            | PropagationError::NonFiniteState { state, .. } => Some(state),
        }
    }
}
