// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Protocol layer.
//!
//! The read loop parses one frame per line and hands calls to the tasker
//! executor. Tasker workers resolve `root:method` in the [`Registry`],
//! invoke it and submit the encoded response to the single-worker sender
//! executor, which owns the output channel. Responses therefore leave in
//! completion order; the peer matches them by `qID`.

use std::any::Any;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::capabilities::{CallContext, Member, Registry};
use crate::job_engine::error::interruption;
use crate::job_engine::{CancelProbe, Interrupted, PoolError, Signal, TaskExecutor};

pub mod error;
pub mod frame;

pub use error::CallError;
pub use frame::{parse_frame, Frame, FrameError, Request, Response, SHUTDOWN_FIELD};

pub const DEFAULT_TASKER_THREADS: usize = 4;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub secret: String,
    pub tasker_threads: usize,
}

impl DispatcherConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tasker_threads: DEFAULT_TASKER_THREADS,
        }
    }
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shutdown frame carried the configured secret.
    Secret,
    /// The input channel reached end of file or failed.
    ChannelClosed,
    /// The output channel is gone; the sender worker has stopped.
    OutputClosed,
}

pub struct Dispatcher {
    secret: String,
    tasker: TaskExecutor<Request>,
    sender: TaskExecutor<String>,
}

impl Dispatcher {
    /// Builds and starts the tasker and sender executors. `output` is only
    /// ever written by the sender worker.
    pub fn new<W>(registry: Arc<Registry>, config: DispatcherConfig, output: W) -> Result<Self, PoolError>
    where
        W: Write + Send + 'static,
    {
        let output = Mutex::new(output);
        let sender = TaskExecutor::new("sender", 1, move |line: String, _: &CancelProbe<'_>| {
            write_line(&output, &line)
        });

        let tasker = {
            let sender = sender.clone();
            TaskExecutor::new(
                "tasker",
                config.tasker_threads,
                move |request: Request, probe: &CancelProbe<'_>| {
                    process_request(&registry, &sender, request, probe)
                },
            )
        };

        sender.start()?;
        tasker.start()?;
        info!(
            "dispatcher ready ({} tasker threads)",
            tasker.pool().worker_count()
        );
        Ok(Self {
            secret: config.secret,
            tasker,
            sender,
        })
    }

    /// Reads frames until the shutdown frame, end of input, or until the
    /// sender can no longer write.
    pub fn run<R: BufRead>(&self, mut input: R) -> ShutdownReason {
        let mut line = Vec::new();
        loop {
            if self.sender.pool().all_finished() {
                return ShutdownReason::OutputClosed;
            }
            line.clear();
            match input.read_until(b'\n', &mut line) {
                Ok(0) => return ShutdownReason::ChannelClosed,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("failed to read from request channel: {err}");
                    return ShutdownReason::ChannelClosed;
                }
            }
            let Ok(text) = std::str::from_utf8(&line) else {
                warn!("dropping frame: not valid UTF-8");
                continue;
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            match parse_frame(text, &self.secret) {
                Ok(Frame::Shutdown) => return ShutdownReason::Secret,
                Ok(Frame::Call(request)) => {
                    debug!("request {} -> {}", request.qid, request.target);
                    self.tasker.submit(request);
                }
                Ok(Frame::Malformed { qid, reason }) => {
                    warn!("malformed frame {qid}: {reason}");
                    submit_response(&self.sender, Response::failure(qid, &CallError::MalformedFrame(reason)));
                }
                Err(err) => warn!("dropping frame: {err}"),
            }
        }
    }

    /// Cancels both executors, drops whatever is still queued and waits for
    /// every worker to exit.
    pub fn shutdown(&self) {
        self.tasker.cancel();
        self.sender.cancel();
        self.tasker.join();
        self.sender.join();
        info!("dispatcher stopped");
    }

    /// [`run`](Self::run) followed by [`shutdown`](Self::shutdown).
    pub fn serve<R: BufRead>(&self, input: R) -> ShutdownReason {
        let reason = self.run(input);
        info!("read loop stopped: {reason:?}");
        self.shutdown();
        reason
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            tasker: self.tasker.clone(),
            sender: self.sender.clone(),
        }
    }
}

/// Preemptive shutdown path, usable from another thread while the read loop
/// is blocked.
#[derive(Clone)]
pub struct InterruptHandle {
    tasker: TaskExecutor<Request>,
    sender: TaskExecutor<String>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        for (name, raised) in [
            ("tasker", self.tasker.pool().raise_on_all(Signal::Interrupt)),
            ("sender", self.sender.pool().raise_on_all(Signal::Interrupt)),
        ] {
            // a worker may exit between the check and the raise
            if let Err(err) = raised {
                debug!("{name}: {err}");
            }
        }
        self.tasker.cancel();
        self.sender.cancel();
        self.tasker.join();
        self.sender.join();
    }
}

fn write_line<W: Write>(output: &Mutex<W>, line: &str) -> anyhow::Result<()> {
    let mut out = output.lock().unwrap();
    let written = out
        .write_all(line.as_bytes())
        .and_then(|_| out.write_all(b"\n"))
        .and_then(|_| out.flush());
    match written {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            warn!("response channel closed by peer");
            Err(Interrupted(Signal::Terminate).into())
        }
        Err(err) => Err(err).context("failed to write response"),
    }
}

fn submit_response(sender: &TaskExecutor<String>, response: Response) {
    match response.to_line() {
        Ok(line) => sender.submit(line),
        Err(err) => error!("cannot encode response {}: {err}", response.qid),
    }
}

/// Tasker handler. Fails only when the worker was interrupted; the request
/// then gets no response.
fn process_request(
    registry: &Registry,
    sender: &TaskExecutor<String>,
    request: Request,
    probe: &CancelProbe<'_>,
) -> anyhow::Result<()> {
    let Request {
        qid,
        target,
        arguments,
    } = request;
    let response = match invoke(registry, &target, arguments, probe) {
        Ok(result) => Response::success(qid, result),
        Err(CallError::Handler(err)) if interruption(&err).is_some() => {
            debug!("request {qid} abandoned: {err}");
            return Err(err);
        }
        Err(err) => {
            debug!("request {qid} failed: {err}");
            Response::failure(qid, &err)
        }
    };
    submit_response(sender, response);
    Ok(())
}

/// Resolves `target` and calls it with `arguments`.
pub fn invoke(
    registry: &Registry,
    target: &str,
    arguments: Vec<Value>,
    probe: &CancelProbe<'_>,
) -> Result<Value, CallError> {
    let Some((root, name)) = target.split_once(':') else {
        return Err(CallError::MalformedFrame(format!(
            "path [{target}] is not of the form root:method"
        )));
    };
    let capability = registry
        .capability(root)
        .ok_or_else(|| CallError::UnknownRoot(root.to_string()))?;
    let method = match capability.member(name) {
        Some(Member::Method(method)) => method,
        Some(Member::Attribute(_)) => return Err(CallError::NotCallable(target.to_string())),
        None => {
            return Err(CallError::UnknownMethod {
                root: root.to_string(),
                method: name.to_string(),
            })
        }
    };
    if !method.arity().accepts(arguments.len()) {
        return Err(CallError::ArityMismatch {
            target: target.to_string(),
            expected: method.arity(),
            given: arguments.len(),
        });
    }

    let ctx = CallContext::new(probe);
    match panic::catch_unwind(AssertUnwindSafe(|| method.call(arguments, &ctx))) {
        Ok(result) => result.map_err(CallError::Handler),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("{target} panicked: {message}");
            Err(CallError::Panic(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
