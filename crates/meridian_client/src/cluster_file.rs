//! Cluster-descriptor file handling.
//!
//! The descriptor is a single line, `name:id@host:port,host:port,...`,
//! naming the coordinators. The client rewrites the file by atomic replace
//! whenever coordinators change so a crash never leaves a torn descriptor.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use anyhow::{bail, Context};
use tokio::sync::broadcast;
use tracing::info;

/// Parsed contents of a cluster file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub name: String,
    pub id: String,
    pub coordinators: Vec<String>,
}

impl FromStr for ClusterDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let (prefix, hosts) = s
            .split_once('@')
            .context("cluster descriptor is missing '@'")?;
        let (name, id) = prefix
            .split_once(':')
            .context("cluster descriptor is missing ':' between name and id")?;
        if name.is_empty() || id.is_empty() {
            bail!("cluster descriptor has an empty name or id");
        }
        let coordinators: Vec<String> = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if coordinators.is_empty() {
            bail!("cluster descriptor names no coordinators");
        }
        for host in &coordinators {
            if !host.contains(':') {
                bail!("coordinator address {host:?} has no port");
            }
        }
        Ok(Self {
            name: name.to_string(),
            id: id.to_string(),
            coordinators,
        })
    }
}

impl fmt::Display for ClusterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.name, self.id, self.coordinators.join(","))
    }
}

/// The on-disk cluster file plus a change feed for components (watches,
/// caches) that must react to reconnection.
pub struct ClusterFile {
    path: Option<PathBuf>,
    descriptor: RwLock<ClusterDescriptor>,
    changed: broadcast::Sender<()>,
}

impl ClusterFile {
    /// Load a descriptor from `path`. The file stays bound: coordinator
    /// updates are persisted back to it.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading cluster file {}", path.display()))?;
        let descriptor: ClusterDescriptor = raw.parse()?;
        let (changed, _) = broadcast::channel(16);
        Ok(Self {
            path: Some(path),
            descriptor: RwLock::new(descriptor),
            changed,
        })
    }

    /// A cluster file that lives only in memory (embedded and test use).
    pub fn in_memory(descriptor: ClusterDescriptor) -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            path: None,
            descriptor: RwLock::new(descriptor),
            changed,
        }
    }

    pub fn descriptor(&self) -> ClusterDescriptor {
        self.descriptor.read().unwrap().clone()
    }

    /// Subscribe to descriptor changes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    /// Install a new coordinator set and persist it by atomic replace.
    pub fn update_coordinators(&self, coordinators: Vec<String>) -> anyhow::Result<()> {
        if coordinators.is_empty() {
            bail!("refusing to install an empty coordinator set");
        }
        let updated = {
            let mut descriptor = self.descriptor.write().unwrap();
            if descriptor.coordinators == coordinators {
                return Ok(());
            }
            descriptor.coordinators = coordinators;
            descriptor.clone()
        };
        if let Some(path) = &self.path {
            atomic_write(path, &format!("{updated}\n"))
                .with_context(|| format!("persisting cluster file {}", path.display()))?;
        }
        info!(coordinators = %updated.coordinators.join(","), "cluster descriptor updated");
        let _ = self.changed.send(());
        Ok(())
    }
}

/// Write to a temporary file in the target's directory, then rename over
/// the target.
fn atomic_write(path: &Path, contents: &str) -> anyhow::Result<()> {
    let dir = path.parent().context("cluster file has no parent directory")?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .context("cluster file has no file name")?
            .to_string_lossy()
    ));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
