// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cache;
mod error;
mod local;
mod remote;
mod schema;
mod sync;
mod types;

pub use cache::{categorize, command_hash, CacheCategory};
pub use error::StoreError;
pub use local::{LocalStore, MergeOutcome};
pub use remote::{RemoteStore, RemoteValue};
pub use sync::{RemoteApi, SyncHandle, SyncHealth, SyncWorker};
pub use types::{
    CommandCacheEntry, ConversationSummary, MachineInfo, NewTurn, Partition, SessionRow,
    SyncOp, TurnPatch, TurnRecord, TurnStatus, UserRow,
};
