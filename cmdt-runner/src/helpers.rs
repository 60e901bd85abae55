// Copyright (c) The cmdt Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for cmdt-runner.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "suite" if `count` is 1, otherwise "suites".
    pub fn suites_str(count: usize) -> &'static str {
        if count == 1 { "suite" } else { "suites" }
    }

    /// Returns "assertion" if `count` is 1, otherwise "assertions".
    pub fn assertions_str(count: usize) -> &'static str {
        if count == 1 {
            "assertion"
        } else {
            "assertions"
        }
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Buffers and registry maps stay structurally valid across a panic, and a panic in one test's
/// writer must not take down the other suites.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encodes a suite name into a file-stem-safe string.
///
/// The encoding is bijective and uses underscore as an escape character:
///
/// - `_` → `__` (escape underscore first)
/// - `/` → `_s`
/// - `\` → `_b`
/// - `:` → `_c`
/// - `*` → `_a`
/// - `"` → `_q`
/// - `<` → `_l`
/// - `>` → `_g`
/// - `|` → `_p`
/// - `?` → `_m`
/// - `.` → `_d` (so the stem never collides with the file extension)
///
/// # Examples
///
/// - `smoke` → `smoke`
/// - `api/v1` → `api_sv1`
/// - `with_underscore.toml` → `with__underscore_dtoml`
pub fn encode_suite_name(suite: &str) -> String {
    let mut encoded = String::with_capacity(suite.len() * 2);

    for ch in suite.chars() {
        match ch {
            '_' => encoded.push_str("__"),
            '/' => encoded.push_str("_s"),
            '\\' => encoded.push_str("_b"),
            ':' => encoded.push_str("_c"),
            '*' => encoded.push_str("_a"),
            '"' => encoded.push_str("_q"),
            '<' => encoded.push_str("_l"),
            '>' => encoded.push_str("_g"),
            '|' => encoded.push_str("_p"),
            '?' => encoded.push_str("_m"),
            '.' => encoded.push_str("_d"),
            _ => encoded.push(ch),
        }
    }

    encoded
}

/// Decodes a string produced by [`encode_suite_name`].
///
/// Returns `None` if the input isn't a valid encoding.
pub fn decode_suite_name(encoded: &str) -> Option<String> {
    let mut decoded = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();

    while let Some(ch) = chars.next() {
        if ch != '_' {
            decoded.push(ch);
            continue;
        }
        let unescaped = match chars.next()? {
            '_' => '_',
            's' => '/',
            'b' => '\\',
            'c' => ':',
            'a' => '*',
            'q' => '"',
            'l' => '<',
            'g' => '>',
            'p' => '|',
            'm' => '?',
            'd' => '.',
            _ => return None,
        };
        decoded.push(unescaped);
    }

    Some(decoded)
}
