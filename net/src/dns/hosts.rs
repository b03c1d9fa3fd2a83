//! Hosts file lookups, reloaded when the file changes.

use crate::error::Result;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time a change must stay quiet before the file is read again.
pub const WRITE_GRACE_PERIOD: Duration = Duration::from_millis(200);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Name → IPv4 entries of a hosts file. Names are lowercase without the
/// trailing dot; the first entry for a name wins.
pub fn parse(contents: &str) -> HashMap<String, Ipv4Addr> {
    let mut entries = HashMap::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let Some(Ok(ip)) = fields.next().map(str::parse::<Ipv4Addr>) else {
            continue;
        };
        for name in fields {
            entries
                .entry(name.trim_end_matches('.').to_ascii_lowercase())
                .or_insert(ip);
        }
    }
    entries
}

pub struct HostsFile {
    path: PathBuf,
    entries: RwLock<HashMap<String, Ipv4Addr>>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> Option<Stamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Stamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

impl HostsFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = parse(&std::fs::read_to_string(&path)?);
        debug!(path = %path.display(), entries = entries.len(), "loaded hosts file");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .copied()
    }

    fn reload(&self) {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let entries = parse(&contents);
                debug!(path = %self.path.display(), entries = entries.len(), "reloaded hosts file");
                *self.entries.write().unwrap_or_else(|e| e.into_inner()) = entries;
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot read hosts file"),
        }
    }

    /// Reloads the file whenever it changes, once it has been quiet for
    /// [`WRITE_GRACE_PERIOD`].
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let mut seen = stamp(&self.path);
        let mut changed_at: Option<tokio::time::Instant> = None;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let current = stamp(&self.path);
            if current != seen {
                seen = current;
                changed_at = Some(tokio::time::Instant::now());
                continue;
            }
            if changed_at.is_some_and(|t| t.elapsed() >= WRITE_GRACE_PERIOD) {
                changed_at = None;
                self.reload();
            }
        }
    }
}
