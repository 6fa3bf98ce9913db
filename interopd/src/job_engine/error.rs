// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use thiserror::Error;

/// What unwound a worker: a cooperative cancellation or a forced interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Cancel,
    Interrupt,
    Terminate,
}

/// The permitted condition used to stop a worker on purpose.
///
/// Handlers return it (usually through `?` on a probe checkpoint) to leave
/// the worker loop without the failure being reported as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker interrupted ({0:?})")]
pub struct Interrupted(pub Signal);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pools can only be started once")]
    AlreadyStarted,

    #[error("unknown worker id {0}")]
    UnknownWorkerId(usize),

    #[error("could not locate a running thread for worker {0}")]
    NoExecutionContext(usize),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Finds an [`Interrupted`] anywhere in the error chain.
pub fn interruption(err: &anyhow::Error) -> Option<Interrupted> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Interrupted>())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn interruption_is_found_behind_context() {
        let err = Err::<(), _>(Interrupted(Signal::Cancel))
            .context("sleeping")
            .unwrap_err();
        assert_eq!(interruption(&err), Some(Interrupted(Signal::Cancel)));
        assert_eq!(interruption(&anyhow::anyhow!("boom")), None);
    }
}
