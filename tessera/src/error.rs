/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The error type for all fallible container and backend operations.

use ndspan::SpanError;

/// The error type for all fallible container and backend operations.
///
/// The taxonomy mirrors how failures propagate: `Config` is raised
/// synchronously at the offending API call; `Protocol` violations are
/// logged and the offending command dropped, surfacing here only when
/// a connection cannot continue; `Transport` failures are fatal to the
/// process; `Logic` marks a failed internal invariant.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid space, type, partitioning or group passed to an API.
    #[error("config error: {reason}")]
    Config {
        /// What was wrong with the input.
        reason: String,
    },

    /// A malformed or out-of-protocol message from a registered peer.
    #[error("protocol error from LID {lid}: {reason}")]
    Protocol {
        /// Location-ID of the offending peer, -1 if unknown.
        lid: i32,
        /// What was wrong with the message.
        reason: String,
    },

    /// Unrecoverable socket or channel failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A peer vanished mid-operation.
    #[error("peer LID {lid} unreachable: {reason}")]
    PeerLost {
        /// Location-ID of the lost peer.
        lid: i32,
        /// The underlying condition.
        reason: String,
    },

    /// A buffer or allocation limit was exceeded.
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// Which allocation failed.
        reason: String,
    },

    /// A failed internal invariant; indicates a bug.
    #[error("logic error: {reason}")]
    Logic {
        /// The violated invariant.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::Config`] with a formatted reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`Error::Logic`] with a formatted reason.
    pub fn logic(reason: impl Into<String>) -> Self {
        Error::Logic {
            reason: reason.into(),
        }
    }
}

impl From<SpanError> for Error {
    fn from(err: SpanError) -> Self {
        Error::Config {
            reason: err.to_string(),
        }
    }
}

/// Alias for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
