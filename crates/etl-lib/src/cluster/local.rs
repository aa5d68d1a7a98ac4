use super::{ClusterBackend, DistributedMap, Member, MembershipEvent};
use crate::error::ClusterError;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A cluster of exactly one member
pub struct Standalone {
    name: String,
    member: Mutex<Option<Member>>,
    maps: DashMap<String, Arc<DistributedMap>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Standalone {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            member: Mutex::new(None),
            maps: DashMap::new(),
            events,
        }
    }
}

impl ClusterBackend for Standalone {
    fn join(&self) -> Result<Member, ClusterError> {
        let mut member = self.member.lock().unwrap_or_else(|e| e.into_inner());
        if member.is_some() {
            return Err(ClusterError::DuplicateMember(self.name.clone()));
        }
        let joined = Member {
            name: self.name.clone(),
            joined_at: Utc::now(),
            join_order: 0,
        };
        *member = Some(joined.clone());
        Ok(joined)
    }

    fn leave(&self) {
        self.member.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn local_member(&self) -> Option<Member> {
        self.member.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn members(&self) -> Vec<Member> {
        self.local_member().into_iter().collect()
    }

    fn distributed_map(&self, name: &str) -> Arc<DistributedMap> {
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DistributedMap::new(name)))
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

struct Hub {
    /// Live members in join order
    members: Mutex<Vec<Member>>,
    maps: DashMap<String, Arc<DistributedMap>>,
    events: broadcast::Sender<MembershipEvent>,
    next_order: AtomicU64,
}

/// In-process membership hub
///
/// Every [`LocalMember`] created from the same hub sees the same member list,
/// the same maps and the same event stream.
#[derive(Clone)]
pub struct LocalCluster {
    hub: Arc<Hub>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            hub: Arc::new(Hub {
                members: Mutex::new(Vec::new()),
                maps: DashMap::new(),
                events,
                next_order: AtomicU64::new(1),
            }),
        }
    }

    /// Backend handle for a member named `name`; joining happens later
    pub fn member(&self, name: impl Into<String>) -> LocalMember {
        LocalMember {
            cluster: self.clone(),
            name: name.into(),
        }
    }

    pub fn members(&self) -> Vec<Member> {
        self.hub
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn emit(&self, event: MembershipEvent) {
        debug!(event = ?event, "Membership event");
        // No subscribers is fine
        let _ = self.hub.events.send(event);
    }
}

/// One member's view of a [`LocalCluster`]
pub struct LocalMember {
    cluster: LocalCluster,
    name: String,
}

impl ClusterBackend for LocalMember {
    fn join(&self) -> Result<Member, ClusterError> {
        let member = {
            let mut members = self
                .cluster
                .hub
                .members
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if members.iter().any(|m| m.name == self.name) {
                return Err(ClusterError::DuplicateMember(self.name.clone()));
            }
            let member = Member {
                name: self.name.clone(),
                joined_at: Utc::now(),
                join_order: self.cluster.hub.next_order.fetch_add(1, Ordering::SeqCst),
            };
            members.push(member.clone());
            member
        };

        info!(member = %member, "Member joined local cluster");
        self.cluster.emit(MembershipEvent::MemberAdded(member.clone()));
        Ok(member)
    }

    fn leave(&self) {
        let (removed, successor) = {
            let mut members = self
                .cluster
                .hub
                .members
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let Some(index) = members.iter().position(|m| m.name == self.name) else {
                return;
            };
            let removed = members.remove(index);
            // Shared state changes hands only when the oldest member leaves
            let successor = if index == 0 {
                members.first().map(|m| m.name.clone())
            } else {
                None
            };
            (removed, successor)
        };

        info!(member = %removed, "Member left local cluster");
        match successor {
            Some(to) => {
                let from = removed.name.clone();
                self.cluster.emit(MembershipEvent::MigrationStarted {
                    from: from.clone(),
                    to: to.clone(),
                });
                self.cluster.emit(MembershipEvent::MemberRemoved(removed));
                self.cluster
                    .emit(MembershipEvent::MigrationCompleted { from, to });
            }
            None => self.cluster.emit(MembershipEvent::MemberRemoved(removed)),
        }
    }

    fn local_member(&self) -> Option<Member> {
        self.cluster
            .members()
            .into_iter()
            .find(|m| m.name == self.name)
    }

    fn members(&self) -> Vec<Member> {
        self.cluster.members()
    }

    fn distributed_map(&self, name: &str) -> Arc<DistributedMap> {
        self.cluster
            .hub
            .maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DistributedMap::new(name)))
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.cluster.hub.events.subscribe()
    }
}
