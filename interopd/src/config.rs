// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use clap::Parser;
use serde_json::Value;

use crate::dispatcher::{DispatcherConfig, DEFAULT_TASKER_THREADS};

pub const DEFAULT_INPUT_FD: RawFd = 4;
pub const DEFAULT_OUTPUT_FD: RawFd = 3;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Shutdown secret; a `{"C4NCL0S3": <secret>}` frame stops the worker
    #[arg(value_name = "SECRET")]
    pub secret: String,

    /// Descriptor requests are read from
    #[arg(long = "input-fd", value_name = "FD")]
    pub input_fd: Option<RawFd>,

    /// Descriptor responses are written to
    #[arg(long = "output-fd", value_name = "FD")]
    pub output_fd: Option<RawFd>,

    /// Use stdin/stdout instead of numbered descriptors. Note that this excludes --input-fd and --output-fd.
    #[arg(long)]
    pub stdio: bool,

    /// Number of tasker threads resolving and running calls
    #[arg(long = "tasker-threads", value_name = "N", default_value_t = DEFAULT_TASKER_THREADS)]
    pub tasker_threads: usize,

    /// Init options for a capability, e.g. --init 'utils={"max_sleep_secs":60}'
    #[arg(long = "init", value_name = "ROOT=JSON", value_parser = parse_init)]
    pub init: Vec<(String, Value)>,
}

fn parse_init(raw: &str) -> Result<(String, Value), String> {
    let (root, json) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ROOT=JSON, got `{raw}`"))?;
    if root.is_empty() {
        return Err("capability root must not be empty".into());
    }
    let value = serde_json::from_str(json).map_err(|e| format!("invalid JSON for `{root}`: {e}"))?;
    Ok((root.to_string(), value))
}

pub fn validate_args(args: &Args) -> Result<(), String> {
    if args.stdio && (args.input_fd.is_some() || args.output_fd.is_some()) {
        return Err("--stdio must not be used together with --input-fd or --output-fd".into());
    }

    let (input, output) = (
        args.input_fd.unwrap_or(DEFAULT_INPUT_FD),
        args.output_fd.unwrap_or(DEFAULT_OUTPUT_FD),
    );
    if !args.stdio {
        if input < 0 || output < 0 {
            return Err("descriptors must not be negative".into());
        }
        if input == output {
            return Err(format!("--input-fd and --output-fd must differ (both are {input})"));
        }
    }

    if args.tasker_threads == 0 {
        return Err("--tasker-threads must be at least 1".into());
    }

    if args.secret.is_empty() {
        return Err("the shutdown secret must not be empty".into());
    }

    let mut seen = Vec::new();
    for (root, _) in &args.init {
        if seen.contains(&root) {
            return Err(format!("--init given twice for `{root}`"));
        }
        seen.push(root);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelConfig {
    Stdio,
    Fds { input: RawFd, output: RawFd },
}

/// Validated start-up settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub dispatcher: DispatcherConfig,
    pub channels: ChannelConfig,
    pub inits: BTreeMap<String, Value>,
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self, String> {
        validate_args(&args)?;
        let channels = if args.stdio {
            ChannelConfig::Stdio
        } else {
            ChannelConfig::Fds {
                input: args.input_fd.unwrap_or(DEFAULT_INPUT_FD),
                output: args.output_fd.unwrap_or(DEFAULT_OUTPUT_FD),
            }
        };
        Ok(Self {
            dispatcher: DispatcherConfig {
                secret: args.secret,
                tasker_threads: args.tasker_threads,
            },
            channels,
            inits: args.init.into_iter().collect(),
        })
    }
}
