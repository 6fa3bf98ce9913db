// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use thiserror::Error;

use crate::capabilities::{Arity, Fault};

/// Failure of a single request. Each one is reported back to the peer; none
/// of them stops the dispatcher.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Invalid root endpoint [{0}]")]
    UnknownRoot(String),

    #[error("Root object [{root}] has no attribute [{method}]")]
    UnknownMethod { root: String, method: String },

    #[error("Root object attribute [{0}] is not callable")]
    NotCallable(String),

    #[error("{target}() takes {expected} arguments ({given} given)")]
    ArityMismatch {
        target: String,
        expected: Arity,
        given: usize,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Handler panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Handler(anyhow::Error),
}

impl CallError {
    fn fault(err: &anyhow::Error) -> Option<&Fault> {
        err.chain().find_map(|cause| cause.downcast_ref::<Fault>())
    }

    /// Error kind as sent in the response's `error.type` field.
    pub fn kind(&self) -> &str {
        match self {
            CallError::UnknownRoot(_) => "UnknownRoot",
            CallError::UnknownMethod { .. } => "UnknownMethod",
            CallError::NotCallable(_) => "NotCallable",
            CallError::ArityMismatch { .. } => "ArityMismatch",
            CallError::MalformedFrame(_) => "MalformedFrame",
            CallError::Panic(_) => "Panic",
            CallError::Handler(err) => {
                Self::fault(err).map_or("HandlerError", |fault| fault.kind.as_str())
            }
        }
    }

    /// Message as sent in `error.message`. A capability fault reports its
    /// own message, not the context wrapped around it.
    pub fn message(&self) -> String {
        match self {
            CallError::Handler(err) => {
                Self::fault(err).map_or_else(|| err.to_string(), |fault| fault.message.clone())
            }
            other => other.to_string(),
        }
    }
}
