/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Environment configuration.
//!
//! All knobs are read once at [`init`](crate::init) time:
//!
//! | Variable             | Default     | Meaning                            |
//! |----------------------|-------------|------------------------------------|
//! | `TESSERA_HOST`       | `localhost` | home host for bootstrap rendezvous |
//! | `TESSERA_PORT`       | `7777`      | home port                          |
//! | `TESSERA_SIZE`       | `1`         | world size the home waits for      |
//! | `TESSERA_BACKEND`    | see below   | `single` or `tcp`                  |
//! | `TESSERA_DEBUG_RANK` | unset       | rank to pause at init (-1 = all)   |
//!
//! The backend defaults to `single` for a world of one and `tcp`
//! otherwise.

use std::env;

use crate::error::Error;
use crate::error::Result;

/// The default home port.
pub const DEFAULT_PORT: u16 = 7777;

/// Which backend drives transitions for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Degenerate one-process backend.
    Single,
    /// Point-to-point TCP backend with home-process bootstrap.
    Tcp,
}

/// Resolved environment configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Home host to register with.
    pub home_host: String,
    /// Home port to register at.
    pub home_port: u16,
    /// Number of processes the home waits for before phase 0.
    pub world_size: usize,
    /// Selected backend.
    pub backend: BackendKind,
    /// Rank to pause at init for debugger attach; -1 pauses every rank.
    pub debug_rank: Option<i32>,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let home_host = env::var("TESSERA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let home_port = parse_var("TESSERA_PORT")?.unwrap_or(DEFAULT_PORT);
        let world_size = parse_var("TESSERA_SIZE")?.unwrap_or(1).max(1);
        let debug_rank = parse_var("TESSERA_DEBUG_RANK")?;
        let backend = match env::var("TESSERA_BACKEND") {
            Ok(s) => match s.as_str() {
                "single" => BackendKind::Single,
                "tcp" => BackendKind::Tcp,
                other => {
                    return Err(Error::config(format!(
                        "unknown TESSERA_BACKEND '{other}' (expected 'single' or 'tcp')"
                    )));
                }
            },
            Err(_) if world_size > 1 => BackendKind::Tcp,
            Err(_) => BackendKind::Single,
        };
        Ok(Self {
            home_host,
            home_port,
            world_size,
            backend,
            debug_rank,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("cannot parse {name}='{s}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so defaults are checked
    // against variables that stay unset in the test environment.
    #[test]
    fn test_defaults() {
        let cfg = Config::from_env().unwrap();
        assert!(!cfg.home_host.is_empty());
        assert!(cfg.world_size >= 1);
    }
}
