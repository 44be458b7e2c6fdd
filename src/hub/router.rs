//! Message routing
//!
//! Resolves a message scope into a snapshot of target connections, then
//! enqueues onto each target. Resolution happens under the hub's read lock;
//! delivery happens after it is released and never waits on the network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::message::{Message, Scope};
use super::queue::Enqueued;
use super::registry::Registry;
use super::session::{Connection, SessionId};
use super::{HubError, HubResult};

/// Group membership index
///
/// Keeps both directions so removing a session only visits the groups that
/// session actually joined.
#[derive(Debug, Default)]
pub struct Groups {
    members: HashMap<String, HashSet<SessionId>>,
    memberships: HashMap<SessionId, HashSet<String>>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a group. Returns false if it was already a member.
    pub fn join(&mut self, group: &str, id: SessionId) -> bool {
        let added = self
            .members
            .entry(group.to_string())
            .or_default()
            .insert(id);
        if added {
            self.memberships
                .entry(id)
                .or_default()
                .insert(group.to_string());
        }
        added
    }

    /// Remove a session from a group. Empty groups are dropped.
    pub fn leave(&mut self, group: &str, id: SessionId) -> bool {
        let removed = match self.members.get_mut(group) {
            Some(members) => {
                let removed = members.remove(&id);
                if members.is_empty() {
                    self.members.remove(group);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(groups) = self.memberships.get_mut(&id) {
                groups.remove(group);
                if groups.is_empty() {
                    self.memberships.remove(&id);
                }
            }
        }
        removed
    }

    /// Drop a session from every group it joined; returns those groups
    pub fn remove_session(&mut self, id: SessionId) -> Vec<String> {
        let groups: Vec<String> = self
            .memberships
            .remove(&id)
            .map(|groups| groups.into_iter().collect())
            .unwrap_or_default();
        for group in &groups {
            if let Some(members) = self.members.get_mut(group) {
                members.remove(&id);
                if members.is_empty() {
                    self.members.remove(group);
                }
            }
        }
        groups
    }

    pub fn members(&self, group: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .members
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn groups_of(&self, id: SessionId) -> Vec<String> {
        let mut groups: Vec<String> = self
            .memberships
            .get(&id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    pub fn is_member(&self, group: &str, id: SessionId) -> bool {
        self.members
            .get(group)
            .is_some_and(|members| members.contains(&id))
    }

    pub fn group_count(&self) -> usize {
        self.members.len()
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Targets whose queue accepted the message
    pub delivered: usize,
    /// Targets skipped because they were no longer Open
    pub skipped: usize,
    /// Targets whose queue was full; the hub closes these
    pub overflowed: Vec<SessionId>,
    /// Targets that accepted the message by evicting an older one
    pub evicted: usize,
}

/// Resolve a scope into a target snapshot
///
/// Unicast fails with `TargetNotFound` when the id is not registered.
/// Group and broadcast targets may include sessions that are not Open; those
/// are filtered at delivery time.
pub(crate) fn resolve_targets(
    registry: &Registry,
    groups: &Groups,
    scope: &Scope,
    sender: Option<SessionId>,
) -> HubResult<Vec<Arc<Connection>>> {
    match scope {
        Scope::Session(target) => registry
            .lookup(*target)
            .map(|connection| vec![connection])
            .map_err(|_| HubError::TargetNotFound(*target)),
        Scope::Group(group) => Ok(groups
            .members(group)
            .into_iter()
            .filter_map(|id| registry.lookup(id).ok())
            .collect()),
        Scope::Broadcast { include_sender } => Ok(registry
            .enumerate()
            .filter(|connection| *include_sender || Some(connection.id()) != sender)
            .collect()),
    }
}

/// Enqueue a message onto every target
///
/// Sessions that left Open after the snapshot was taken are skipped, not
/// treated as errors.
pub(crate) fn deliver(targets: &[Arc<Connection>], message: Arc<Message>) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for target in targets {
        match target.send(Arc::clone(&message)) {
            Ok(Enqueued::Queued) => report.delivered += 1,
            Ok(Enqueued::DroppedOldest) => {
                report.delivered += 1;
                report.evicted += 1;
            }
            Err(HubError::QueueOverflow(id)) => report.overflowed.push(id),
            Err(e) => {
                debug!("Skipping {}: {}", target.id(), e);
                report.skipped += 1;
            }
        }
    }
    report
}
