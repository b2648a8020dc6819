//! Proxied-domain policy
//!
//! The policy file lists one domain per line. The in-memory set is
//! replaced wholesale on reload so readers always see a complete set,
//! and a polling task watches the file for changes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::{Result, SidestepError};

/// How often the watcher re-stats the policy file. Polling, not file
/// notifications: editors commonly replace the file instead of rewriting
/// it and notification APIs disagree across platforms about what that
/// looks like.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The set of domains to intercept, with public-suffix-aware matching.
pub struct PolicyStore {
    path: PathBuf,
    domains: RwLock<HashSet<String>>,
}

impl PolicyStore {
    /// Reads the policy file. Startup-time errors are surfaced to the
    /// caller and abort the process.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            SidestepError::Policy(format!("cannot read {}: {}", path.display(), e))
        })?;
        let domains = parse(&contents);
        info!(
            "loaded {} proxied domains from {}",
            domains.len(),
            path.display()
        );
        Ok(Self {
            path,
            domains: RwLock::new(domains),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_domains(domains: HashSet<String>) -> Self {
        Self {
            path: PathBuf::new(),
            domains: RwLock::new(domains),
        }
    }

    /// Re-reads the policy file and installs the new set in one swap.
    pub fn reload(&self) -> Result<()> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            SidestepError::Policy(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let domains = parse(&contents);
        info!("policy now holds {} domains", domains.len());
        *self.domains.write() = domains;
        Ok(())
    }

    /// Whether `host` should be intercepted.
    ///
    /// A hostname matches when it, or any suffix of it obtained by
    /// stripping leading labels down to its registrable domain, appears
    /// in the set. The walk stops at the registrable domain so an entry
    /// like `co.uk` can never capture every name under a public suffix.
    pub fn is_proxied(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let domains = self.domains.read();
        if domains.contains(host.as_str()) {
            return true;
        }
        let Some(base) = psl::domain_str(&host) else {
            error!("hostname invalid: {}", host);
            return false;
        };
        let mut rest = host.as_str();
        while rest != base {
            match rest.split_once('.') {
                Some((_, tail)) => rest = tail,
                None => break,
            }
            if domains.contains(rest) {
                return true;
            }
        }
        false
    }

    /// Polls the policy file for `(size, mtime)` changes and reloads on
    /// any difference. Runtime failures keep the last good set.
    pub async fn watch(self: Arc<Self>) {
        let mut last = file_stamp(&self.path).await;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let Some(stamp) = file_stamp(&self.path).await else {
                continue;
            };
            if last != Some(stamp) {
                info!("policy file changed");
                if let Err(e) = self.reload() {
                    warn!("policy reload failed, keeping previous set: {}", e);
                }
                last = Some(stamp);
            }
        }
    }
}

async fn file_stamp(path: &Path) -> Option<(u64, SystemTime)> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => match meta.modified() {
            Ok(modified) => Some((meta.len(), modified)),
            Err(e) => {
                warn!("no mtime for {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            warn!("cannot stat {}: {}", path.display(), e);
            None
        }
    }
}

/// One domain per non-empty line, trimmed, lowercased, trailing dot
/// stripped.
fn parse(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_end_matches('.').to_ascii_lowercase())
        .collect()
}
