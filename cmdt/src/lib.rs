// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run shell commands as test suites, with output kept in order.
//!
//! The commands of a suite run concurrently. Their output is buffered per command and shown
//! strictly in command order, either in the same process or, with `--record-only`, from a
//! separate `cmdt tail` process reading the run's work directory.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, StderrStyles};
