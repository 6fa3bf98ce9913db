// SPDX-License-Identifier: MIT
// interopd: worker process serving line-delimited JSON calls
//
// - Requests arrive on one pre-opened descriptor, responses leave on another.
// - Calls run on a tasker pool; a single sender thread owns the output.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod capabilities;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod job_engine;
pub mod signals;
