// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Opens the two byte channels the dispatcher talks over.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, RawFd};

use anyhow::Context;
use nix::errno::Errno;

use crate::config::ChannelConfig;

pub type Input = Box<dyn BufRead + Send>;
pub type Output = Box<dyn Write + Send>;

pub fn open(config: ChannelConfig) -> anyhow::Result<(Input, Output)> {
    match config {
        ChannelConfig::Stdio => Ok((
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )),
        ChannelConfig::Fds { input, output } => {
            let input = adopt_fd(input).with_context(|| format!("request channel fd {input} is not open"))?;
            let output = adopt_fd(output).with_context(|| format!("response channel fd {output} is not open"))?;
            Ok((Box::new(BufReader::new(input)), Box::new(output)))
        }
    }
}

/// Takes ownership of an inherited descriptor after checking it is open.
fn adopt_fd(fd: RawFd) -> io::Result<File> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })
        .map(drop)
        .map_err(io::Error::from)?;
    // SAFETY: the descriptor is open and nothing else in this process owns it
    Ok(unsafe { File::from_raw_fd(fd) })
}
