//! # Cluster coordination
//!
//! Decides whether this process may run the scheduler. With clustering
//! disabled every process is master. With clustering enabled the oldest
//! live member is master; the others stay idle until it leaves.
//!
//! ## Backends
//!
//! - [`Standalone`]: a cluster of one
//! - [`LocalCluster`]: an in-process membership hub shared by co-located
//!   coordinators

mod local;

pub use local::{LocalCluster, LocalMember, Standalone};

use crate::error::ClusterError;
use crate::shutdown::{ShutdownHook, ShutdownSequence};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A process taking part in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub joined_at: DateTime<Utc>,
    /// Position in join order, lower is older
    pub join_order: u64,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.join_order)
    }
}

/// A membership or ownership change
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    MemberAdded(Member),
    MemberRemoved(Member),
    /// Ownership of the shared maps is moving to another member
    MigrationStarted { from: String, to: String },
    MigrationCompleted { from: String, to: String },
}

/// Key/value map shared by every member of a cluster
///
/// Values are stored as JSON so callers can keep their own types.
#[derive(Debug, Default)]
pub struct DistributedMap {
    name: String,
    entries: DashMap<String, serde_json::Value>,
}

impl DistributedMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put<V: Serialize>(&self, key: impl Into<String>, value: &V) -> serde_json::Result<()> {
        self.entries.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Typed read; `None` when absent or stored under another shape
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let value = self.entries.get(key)?;
        serde_json::from_value(value.value().clone()).ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Membership runtime behind the coordinator
pub trait ClusterBackend: Send + Sync {
    /// Join the cluster as the local member
    fn join(&self) -> Result<Member, ClusterError>;

    /// Leave the cluster; a no-op when not joined
    fn leave(&self);

    fn local_member(&self) -> Option<Member>;

    /// Live members, oldest first
    fn members(&self) -> Vec<Member>;

    fn distributed_map(&self, name: &str) -> Arc<DistributedMap>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// `cluster` section of the application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub config: MemberConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfig {
    #[serde(default, alias = "member_name")]
    pub member_name: Option<String>,
}

/// Gatekeeper for the scheduler in multi-process deployments
pub struct ClusterCoordinator {
    enabled: bool,
    backend: Arc<dyn ClusterBackend>,
    initialized: AtomicBool,
    was_master: AtomicBool,
}

impl ClusterCoordinator {
    /// Coordinator over `backend`, or standalone when clustering is disabled
    pub fn new(config: &ClusterConfig, member_name: &str, backend: Arc<dyn ClusterBackend>) -> Self {
        if config.enabled {
            Self {
                enabled: true,
                backend,
                initialized: AtomicBool::new(false),
                was_master: AtomicBool::new(false),
            }
        } else {
            Self::standalone(member_name)
        }
    }

    pub fn standalone(member_name: &str) -> Self {
        Self {
            enabled: false,
            backend: Arc::new(Standalone::new(member_name)),
            initialized: AtomicBool::new(false),
            was_master: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Join the cluster and register teardown with the shutdown sequence
    ///
    /// May be called once; a second call fails with
    /// [`ClusterError::AlreadyInitialized`].
    pub fn initialize(&self, shutdown: &ShutdownSequence) -> Result<(), ClusterError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClusterError::AlreadyInitialized);
        }

        let member = match self.backend.join() {
            Ok(member) => member,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        shutdown.register(Arc::new(LeaveClusterHook {
            backend: Arc::clone(&self.backend),
        }));

        info!(
            member = %member,
            clustered = self.enabled,
            members = self.backend.members().len(),
            "Cluster coordinator initialized"
        );
        Ok(())
    }

    /// Whether this process may run the scheduler now
    pub fn is_master(&self) -> bool {
        if !self.enabled {
            return true;
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }

        let local = self.backend.local_member();
        let oldest = self.backend.members().into_iter().next();
        let master = matches!((local, oldest), (Some(l), Some(o)) if l.name == o.name);

        if self.was_master.swap(master, Ordering::SeqCst) != master {
            if master {
                info!("Local member became cluster master");
            } else {
                warn!("Local member lost cluster mastership");
            }
        }
        master
    }

    pub fn local_member(&self) -> Option<Member> {
        self.backend.local_member()
    }

    pub fn members(&self) -> Vec<Member> {
        self.backend.members()
    }

    /// Shared map by name
    pub fn distributed_map(&self, name: &str) -> Result<Arc<DistributedMap>, ClusterError> {
        if self.enabled && !self.initialized.load(Ordering::SeqCst) {
            return Err(ClusterError::NotInitialized);
        }
        Ok(self.backend.distributed_map(name))
    }

    /// Receiver for membership and migration events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.backend.subscribe()
    }
}

struct LeaveClusterHook {
    backend: Arc<dyn ClusterBackend>,
}

#[async_trait]
impl ShutdownHook for LeaveClusterHook {
    fn name(&self) -> &str {
        "cluster"
    }

    async fn shutdown(&self) {
        self.backend.leave();
    }
}
