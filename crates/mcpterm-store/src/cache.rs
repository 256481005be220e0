// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Read-through cache keys and TTL policy for idempotent shell outputs.

use std::time::Duration;

use sha2::{Digest, Sha256};

/// How long a cached command output stays valid, by volatility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    /// Fast-moving system state (disk, memory, processes): 1 hour.
    Volatile,
    /// Installed packages, service units: 24 hours.
    Daily,
    /// Host configuration that rarely changes: 7 days.
    Weekly,
    /// Effectively static facts (OS release, CPU model): 30 days.
    Static,
}

impl CacheCategory {
    pub fn ttl(&self) -> Duration {
        match self {
            CacheCategory::Volatile => Duration::from_secs(60 * 60),
            CacheCategory::Daily => Duration::from_secs(24 * 60 * 60),
            CacheCategory::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
            CacheCategory::Static => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Classify a command by how quickly its output goes stale.
pub fn categorize(command: &str) -> CacheCategory {
    let first = command.split_whitespace().next().unwrap_or("");
    match first {
        "uname" | "lscpu" | "hostnamectl" => CacheCategory::Static,
        "cat" if command.contains("/etc/os-release") => CacheCategory::Static,
        "dpkg" | "rpm" | "apt" | "snap" => CacheCategory::Daily,
        "ip" | "ifconfig" | "timedatectl" => CacheCategory::Weekly,
        _ => CacheCategory::Volatile,
    }
}

/// Cache key: `sha256(command ‖ machine_id)`, hex-encoded.
pub fn command_hash(command: &str, machine_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hasher.update(machine_id.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
