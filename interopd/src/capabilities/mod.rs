// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Capability registry.
//!
//! A capability is a root name (`math`, `utils`) with named members. Callable
//! members carry a declared [`Arity`]; plain attributes exist so that a
//! `root:name` target can resolve to something that is not callable. The
//! registry is built once at start-up and never changes afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;

use crate::job_engine::CancelProbe;

pub mod math;
pub mod utils;

pub type MethodFn = dyn Fn(Vec<Value>, &CallContext<'_>) -> anyhow::Result<Value> + Send + Sync;

/// Signature of a capability constructor; receives the init value given for
/// its root, if any.
pub type Constructor = fn(Option<&Value>) -> anyhow::Result<Capability>;

/// Capabilities registered by [`Registry::standard`].
pub const STANDARD: &[(&str, Constructor)] = &[("math", math::capability), ("utils", utils::capability)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(&self, given: usize) -> bool {
        match *self {
            Arity::Exact(n) => given == n,
            Arity::AtLeast(n) => given >= n,
            Arity::Range(min, max) => (min..=max).contains(&given),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "between {min} and {max}"),
        }
    }
}

/// Error raised by a capability that wants to name its own error kind.
/// Everything else is reported as `HandlerError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new("OverflowError", message)
    }
}

/// What a method sees of the worker running it.
pub struct CallContext<'a> {
    probe: &'a CancelProbe<'a>,
}

impl<'a> CallContext<'a> {
    pub fn new(probe: &'a CancelProbe<'a>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &CancelProbe<'a> {
        self.probe
    }
}

#[derive(Clone)]
pub struct Method {
    arity: Arity,
    call: Arc<MethodFn>,
}

impl Method {
    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn call(&self, args: Vec<Value>, ctx: &CallContext<'_>) -> anyhow::Result<Value> {
        (self.call)(args, ctx)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub enum Member {
    Method(Method),
    Attribute(Value),
}

#[derive(Debug, Clone)]
pub struct Capability {
    root: String,
    members: BTreeMap<String, Member>,
}

impl Capability {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn method<F>(mut self, name: &str, arity: Arity, f: F) -> Self
    where
        F: Fn(Vec<Value>, &CallContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let method = Method {
            arity,
            call: Arc::new(f),
        };
        self.members.insert(name.to_string(), Member::Method(method));
        self
    }

    pub fn attribute(mut self, name: &str, value: Value) -> Self {
        self.members
            .insert(name.to_string(), Member::Attribute(value));
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    roots: BTreeMap<String, Capability>,
}

impl RegistryBuilder {
    /// Registers `capability` under its root; a later registration for the
    /// same root replaces the earlier one.
    pub fn register(mut self, capability: Capability) -> Self {
        self.roots
            .insert(capability.root.clone(), capability);
        self
    }

    pub fn build(self) -> Registry {
        Registry { roots: self.roots }
    }
}

#[derive(Debug)]
pub struct Registry {
    roots: BTreeMap<String, Capability>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Builds the registry from [`STANDARD`], handing each constructor the
    /// init value configured for its root.
    pub fn standard(inits: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        if let Some(unknown) = inits
            .keys()
            .find(|root| !STANDARD.iter().any(|(name, _)| name == root))
        {
            anyhow::bail!("init value given for unknown capability `{unknown}`");
        }
        let mut builder = Registry::builder();
        for (root, constructor) in STANDARD {
            let capability = constructor(inits.get(*root))
                .with_context(|| format!("failed to initialise capability `{root}`"))?;
            builder = builder.register(capability);
        }
        Ok(builder.build())
    }

    pub fn capability(&self, root: &str) -> Option<&Capability> {
        self.roots.get(root)
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }
}

pub(crate) fn number_arg(args: &[Value], index: usize, method: &str) -> Result<f64, Fault> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            Fault::type_error(format!(
                "{method}() argument {} must be a number",
                index + 1
            ))
        })
}
