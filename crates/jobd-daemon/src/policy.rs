//! Command policy applied before any job is spawned.

use jobd_types::{Job, Settings};

/// Substrings that mark a command as destructive. Matched against the
/// command line with whitespace collapsed.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -fr /",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ">/dev/sd",
    "chmod -r 777 /",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
];

/// Rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("command is empty")]
    Empty,

    #[error("command exceeds {limit} characters ({length})")]
    TooLong { length: usize, limit: usize },

    #[error("command matches dangerous pattern '{0}'")]
    Dangerous(&'static str),
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allow_dangerous: bool,
    max_length: usize,
}

impl CommandPolicy {
    pub fn new(allow_dangerous: bool, max_length: usize) -> Self {
        Self {
            allow_dangerous,
            max_length,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.allow_dangerous_commands, settings.max_command_length)
    }

    /// Check the full command line of `job` (command plus args).
    pub fn check(&self, job: &Job) -> Result<(), PolicyViolation> {
        let mut line = job.command.clone();
        for arg in &job.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.check_line(&line)
    }

    pub fn check_line(&self, line: &str) -> Result<(), PolicyViolation> {
        if line.trim().is_empty() {
            return Err(PolicyViolation::Empty);
        }
        let length = line.chars().count();
        if length > self.max_length {
            return Err(PolicyViolation::TooLong {
                length,
                limit: self.max_length,
            });
        }
        if self.allow_dangerous {
            return Ok(());
        }

        let normalized = line
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        for pattern in DANGEROUS_PATTERNS {
            if pattern_matches(&normalized, pattern) {
                return Err(PolicyViolation::Dangerous(pattern));
            }
        }
        Ok(())
    }
}

/// Word-like patterns (`reboot`) must match a whole word so that e.g.
/// `./halting-report.sh` passes; symbolic patterns match anywhere.
fn pattern_matches(line: &str, pattern: &str) -> bool {
    if !pattern.chars().all(|c| c.is_ascii_alphanumeric()) {
        if pattern == "rm -rf /" || pattern == "rm -fr /" {
            // Only the root itself, not `rm -rf /tmp/build`
            return line.match_indices(pattern).any(|(at, m)| {
                matches!(line[at + m.len()..].chars().next(), None | Some(' ' | ';' | '&' | '|'))
            });
        }
        return line.contains(pattern);
    }
    line.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == pattern)
}
