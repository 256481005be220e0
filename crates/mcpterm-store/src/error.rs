// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A turn with this request id already exists in the partition.
    #[error("duplicate request id: {0}")]
    DuplicateRequest(String),

    /// The configured username does not exist.  Fatal at startup; the
    /// message is propagated verbatim.
    #[error("USER_NOT_FOUND: {0}")]
    UserNotFound(String),

    /// An update would violate turn-status monotonicity or touch an
    /// immutable field.
    #[error("invalid turn update: {0}")]
    InvalidUpdate(String),

    #[error("no turn with request id {0}")]
    TurnNotFound(String),

    /// Remote replication failure.  Never user-visible; retried by the
    /// sync worker.
    #[error("remote error: {0}")]
    Remote(String),

    /// The sync retry loop was aborted by its cancellation token.
    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Remote(e.to_string())
    }
}
