// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use interopd::capabilities::Registry;
use interopd::config::{Args, Settings};
use interopd::dispatcher::Dispatcher;
use interopd::{channel, signals};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match Settings::from_args(Args::parse()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    // before any worker thread exists, so every thread inherits the mask
    signals::block_termination_signals().context("failed to block termination signals")?;

    let registry = Arc::new(Registry::standard(&settings.inits)?);
    let (input, output) = channel::open(settings.channels)?;

    let dispatcher = Dispatcher::new(registry, settings.dispatcher, output)
        .context("failed to start worker pools")?;
    signals::spawn_watcher(dispatcher.interrupt_handle())
        .context("failed to spawn signal watcher")?;

    info!("Starting interopd");
    let reason = dispatcher.serve(input);
    info!("interopd stopped ({reason:?})");
    Ok(())
}
