// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Peer side of the interop protocol: spawns a worker with its request pipe
//! on fd 4 and its response pipe on fd 3, and matches responses by `qID`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::{pipe2, Pid};
use serde_json::{json, Value};

pub const REQUEST_FD: i32 = 4;
pub const RESPONSE_FD: i32 = 3;

pub struct PeerBuilder {
    program: PathBuf,
    secret: String,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl PeerBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            program: program.into(),
            secret: format!("{:x}{:x}", std::process::id(), nanos),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn spawn(self) -> io::Result<InteropPeer> {
        let (child_requests, requests) = pipe2(OFlag::O_CLOEXEC)?;
        let (responses, child_responses) = pipe2(OFlag::O_CLOEXEC)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&self.secret)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null());

        let (request_end, response_end) = (child_requests.as_raw_fd(), child_responses.as_raw_fd());
        unsafe {
            cmd.pre_exec(move || {
                // park both ends above 3/4 first so the dup2s cannot clobber each other
                let parked_request = Errno::result(libc::fcntl(request_end, libc::F_DUPFD, 10))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                let parked_response = Errno::result(libc::fcntl(response_end, libc::F_DUPFD, 10))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Errno::result(libc::dup2(parked_request, REQUEST_FD))
                    .map(drop)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Errno::result(libc::dup2(parked_response, RESPONSE_FD))
                    .map(drop)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                libc::close(parked_request);
                libc::close(parked_response);
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        // only the child may hold these, or EOF never arrives on either side
        drop(child_requests);
        drop(child_responses);

        Ok(InteropPeer::new(child, self.secret, requests, responses))
    }
}

pub struct InteropPeer {
    child: Child,
    secret: String,
    requests: Option<File>,
    responses: Receiver<Value>,
    stash: HashMap<String, Value>,
}

impl InteropPeer {
    fn new(child: Child, secret: String, requests: OwnedFd, responses: OwnedFd) -> Self {
        let (tx, rx) = mpsc::channel();
        let reader = BufReader::new(File::from(responses));
        thread::spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("peer: unparsable response `{line}`: {e}"),
                }
            }
        });
        Self {
            child,
            secret,
            requests: Some(File::from(requests)),
            responses: rx,
            stash: HashMap::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Writes `line` as one frame.
    pub fn send_raw(&mut self, line: &str) -> io::Result<()> {
        let requests = self
            .requests
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "request channel closed"))?;
        requests.write_all(line.trim_end_matches('\n').as_bytes())?;
        requests.write_all(b"\n")?;
        requests.flush()
    }

    pub fn send(&mut self, qid: impl Into<Value>, path: &str, data: Value) -> io::Result<()> {
        let frame = json!({"qID": qid.into(), "payload": {"path": path, "data": data}});
        self.send_raw(&frame.to_string())
    }

    /// Next response in arrival order, stashed ones first.
    pub fn next_response(&mut self, timeout: Duration) -> Option<Value> {
        if let Some(key) = self.stash.keys().next().cloned() {
            return self.stash.remove(&key);
        }
        self.responses.recv_timeout(timeout).ok()
    }

    /// Waits for the response carrying `qid`, keeping others for later.
    pub fn wait_for(&mut self, qid: &Value, timeout: Duration) -> Option<Value> {
        let key = qid.to_string();
        if let Some(response) = self.stash.remove(&key) {
            return Some(response);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(left) {
                Ok(response) => {
                    let got = response["qID"].to_string();
                    if got == key {
                        return Some(response);
                    }
                    self.stash.insert(got, response);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn call(&mut self, qid: impl Into<Value>, path: &str, data: Value, timeout: Duration) -> io::Result<Value> {
        let qid = qid.into();
        self.send(qid.clone(), path, data)?;
        self.wait_for(&qid, timeout)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, format!("no response for {qid}")))
    }

    /// Sends the shutdown frame and waits for the worker to exit.
    pub fn close(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let frame = json!({ "C4NCL0S3": self.secret });
        self.send_raw(&frame.to_string())?;
        self.wait_exit(timeout)
    }

    /// Closes the request channel; the worker sees end of file.
    pub fn close_input(&mut self) {
        self.requests = None;
    }

    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        signal::kill(self.pid(), sig)
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for InteropPeer {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let _ = signal::kill(self.pid(), Signal::SIGTERM);
        for _ in 0..10 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let _ = signal::kill(self.pid(), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}
