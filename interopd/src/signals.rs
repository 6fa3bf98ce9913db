// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::thread::{self, JoinHandle};

use log::{error, info};
use nix::sys::signal::{SigSet, Signal};

use crate::dispatcher::InterruptHandle;

fn termination_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Blocks SIGINT and SIGTERM for the calling thread. Threads spawned
/// afterwards inherit the mask, so this has to run before any pool starts.
pub fn block_termination_signals() -> nix::Result<()> {
    termination_signals().thread_block()
}

/// Spawns a thread that waits for SIGINT/SIGTERM, interrupts the
/// dispatcher and exits the process.
pub fn spawn_watcher(handle: InterruptHandle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || match termination_signals().wait() {
            Ok(signal) => {
                info!("received {signal}, interrupting workers");
                handle.interrupt();
                std::process::exit(128 + signal as i32);
            }
            Err(errno) => error!("sigwait failed: {errno}"),
        })
}
