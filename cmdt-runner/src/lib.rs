// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for cmdt: an ordered, asynchronous output multiplexer for test harnesses.
//!
//! Tests in a suite may run and finish in any order. Their titles, captured output and outcomes
//! are buffered per test and released strictly in sequence order, first to a per-suite channel
//! (files in a per-run directory, or memory) and from there to the terminal, possibly in a
//! separate process. See [`OutputMux`] for the entry point.

pub mod channel;
pub mod config;
pub mod errors;
pub mod format;
mod helpers;
mod mux;
pub mod printer;
pub mod registry;
pub mod session;
pub mod suite;
pub mod tail;
mod time;

pub use helpers::{decode_suite_name, encode_suite_name, plural};
pub use mux::OutputMux;
