// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{number_arg, Arity, CallContext, Capability, Fault};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct UtilsOptions {
    #[serde(default = "default_max_sleep")]
    max_sleep_secs: f64,
}

fn default_max_sleep() -> f64 {
    f64::INFINITY
}

impl Default for UtilsOptions {
    fn default() -> Self {
        Self {
            max_sleep_secs: default_max_sleep(),
        }
    }
}

pub fn capability(init: Option<&Value>) -> anyhow::Result<Capability> {
    let options = match init {
        None | Some(Value::Null) => UtilsOptions::default(),
        Some(value) => {
            UtilsOptions::deserialize(value).context("invalid utils init options")?
        }
    };
    if options.max_sleep_secs.is_nan() || options.max_sleep_secs < 0.0 {
        anyhow::bail!("max_sleep_secs must be a non-negative number");
    }

    Ok(Capability::new("utils")
        .method("sleep", Arity::Exact(1), move |args, ctx| sleep(&args, ctx, options))
        .method("current_thread", Arity::Exact(0), |_, _| Ok(current_thread())))
}

fn sleep(args: &[Value], ctx: &CallContext<'_>, options: UtilsOptions) -> anyhow::Result<Value> {
    let secs = number_arg(args, 0, "sleep")?;
    if secs < 0.0 {
        return Err(Fault::value_error("sleep length must be non-negative").into());
    }
    if secs > options.max_sleep_secs {
        return Err(Fault::value_error(format!(
            "sleep length {secs} exceeds the configured maximum of {}",
            options.max_sleep_secs
        ))
        .into());
    }
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| Fault::overflow("sleep length too large"))?;
    ctx.probe().sleep(duration)?;
    Ok(Value::Null)
}

fn current_thread() -> Value {
    let thread = std::thread::current();
    let ident = unsafe { libc::pthread_self() } as u64;
    json!({
        "name": thread.name(),
        "ident": ident,
        "native_id": nix::unistd::gettid().as_raw(),
        "daemon": false,
        "is_alive": true,
    })
}
