//! Input directory bookkeeping: which files are settled, in flight or finished.
//!
//! A file becomes ready once its size and modification time are unchanged
//! across two consecutive scans. Finished files are remembered until their name
//! disappears from the input directory, so a re-added file is a new job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size and modification time of a file at one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// One regular file seen in the input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub name: String,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Whether files must be seen unchanged twice before they are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Wait for an unchanged size and mtime across two scans.
    TwoScans,
    /// Treat every file as complete (one-shot runs).
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Seen once with this fingerprint; not yet ready.
    Seen(Fingerprint),
    /// Handed out as a job; awaiting its outcome.
    InFlight(Fingerprint),
    /// Reached a terminal placement. The fingerprint is the one processed.
    Settled(Fingerprint),
}

/// What a scan produced.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Files that should become jobs now.
    pub ready: Vec<Observation>,
    /// Settled files whose input is still present unchanged (input removal failed earlier).
    pub lingering: Vec<Observation>,
}

#[derive(Debug, Default)]
pub struct Scanner {
    entries: HashMap<String, Entry>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile one directory listing with the tracked state.
    pub fn observe(&mut self, listing: Vec<Observation>, settle: Settle) -> ScanResult {
        let present: std::collections::HashSet<&str> =
            listing.iter().map(|o| o.name.as_str()).collect();
        let before = self.entries.len();
        self.entries.retain(|name, entry| {
            matches!(entry, Entry::InFlight(_)) || present.contains(name.as_str())
        });
        let forgotten = before - self.entries.len();
        if forgotten > 0 {
            tracing::trace!(forgotten, "dropped entries no longer in input");
        }

        let mut result = ScanResult::default();
        for obs in listing {
            let fp = obs.fingerprint;
            let stable = match self.entries.get(&obs.name).copied() {
                Some(Entry::InFlight(_)) => continue,
                Some(Entry::Settled(done)) if done == fp => {
                    result.lingering.push(obs);
                    continue;
                }
                Some(Entry::Seen(prev)) => prev == fp,
                Some(Entry::Settled(_)) => {
                    // Same name, different content: a new file replaced the old one.
                    tracing::debug!(file = %obs.name, "settled name reappeared with new content");
                    false
                }
                None => false,
            };

            if stable || settle == Settle::Immediate {
                self.entries.insert(obs.name.clone(), Entry::InFlight(fp));
                result.ready.push(obs);
            } else {
                tracing::debug!(file = %obs.name, size = fp.len, "waiting for file to settle");
                self.entries.insert(obs.name.clone(), Entry::Seen(fp));
            }
        }
        result
    }

    /// Record the outcome of a job handed out by [`observe`](Self::observe).
    ///
    /// A settled file is not handed out again while it stays in the input
    /// directory; an unsettled one is forgotten and retried from scratch.
    pub fn finish(&mut self, name: &str, settled: bool) {
        match self.entries.get(name).copied() {
            Some(Entry::InFlight(fp)) if settled => {
                self.entries.insert(name.to_string(), Entry::Settled(fp));
            }
            Some(Entry::InFlight(_)) => {
                self.entries.remove(name);
            }
            _ => {}
        }
    }

    /// Number of names currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::InFlight(_)))
            .count()
    }
}

/// Whether a directory entry name is a candidate for processing.
///
/// Hidden files (including in-progress `.partial` writes) are never picked up.
pub fn is_candidate(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'))
}
