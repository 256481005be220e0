// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

/// Command prefixes that normally require elevated privileges on the hosts
/// this assistant administers.  A matching command is wrapped in `sudo`
/// unless it already carries one.
const SUDO_PREFIXES: &[&str] = &[
    "systemctl",
    "service",
    "journalctl",
    "apt",
    "apt-get",
    "yum",
    "dnf",
    "ufw",
    "iptables",
    "nft",
    "fail2ban-client",
    "docker",
];

/// Blocklist matcher for destructive shell commands.
///
/// A match refuses the command before any process is spawned.  The patterns
/// cover recursive deletion of the filesystem root, raw writes to block
/// devices, and filesystem creation.
pub struct CommandGuard {
    blocklist: Vec<(Regex, &'static str)>,
}

impl CommandGuard {
    pub fn new() -> Self {
        let patterns: &[(&str, &str)] = &[
            (
                r"\brm\s+(-[a-zA-Z]*[rRf][a-zA-Z]*\s+)+(/|/\*)(\s|$|;)",
                "recursive deletion of the filesystem root",
            ),
            (
                r"\bdd\b[^|;&]*\bof=/dev/[sh]d[a-z]",
                "raw write to a block device",
            ),
            (r"\bmkfs(\.\w+)?\b", "filesystem creation destroys existing data"),
            (
                r">\s*/dev/[sh]d[a-z]",
                "output redirection into a block device",
            ),
            (r"\bwipefs\b", "filesystem signature wipe"),
        ];
        let blocklist = patterns
            .iter()
            .map(|(p, why)| {
                // The pattern set is static; a non-compiling entry is a
                // programming error caught by the unit tests below.
                (Regex::new(p).unwrap(), *why)
            })
            .collect();
        Self { blocklist }
    }

    /// Returns the refusal reason when `command` matches the blocklist.
    pub fn check(&self, command: &str) -> Option<&'static str> {
        self.blocklist
            .iter()
            .find(|(re, _)| re.is_match(command))
            .map(|(_, why)| *why)
    }
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the command's first word is a known privileged operation.
pub fn needs_sudo(command: &str) -> bool {
    let first = command.split_whitespace().next().unwrap_or("");
    SUDO_PREFIXES.contains(&first)
}

/// Prefix `sudo` when the command needs elevation and does not already
/// carry it.
pub fn wrap_sudo(command: &str) -> String {
    let trimmed = command.trim_start();
    if trimmed.starts_with("sudo ") || !needs_sudo(trimmed) {
        command.to_string()
    } else {
        format!("sudo {command}")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
