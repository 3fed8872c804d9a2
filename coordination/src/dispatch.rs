//! Work Dispatcher — round-robin assignment within domain pools
//!
//! The rotation cursor for each domain is owned by the dispatcher instance,
//! so repeated `assign` calls continue where the last one stopped.

use crate::error::CoordinationResult;
use crate::participant::Roster;
use crate::signal::names::{events, slug, SignalKey, SignalPattern, COORDINATOR};
use crate::signal::types::CompletionPayload;
use crate::signal::SignalBus;
use crate::work_item::{WorkItem, WorkItemStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One work item routed to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub story_id: String,
    pub participant: String,
    pub domain: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

/// Work item that could not be routed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unassigned {
    pub story_id: String,
    pub reason: String,
}

/// Result of a dispatch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub wave: u32,
    pub dry_run: bool,
    /// Whether this call emitted the wave start signal
    pub start_published: bool,
    pub assignments: Vec<Assignment>,
    pub unassigned: Vec<Unassigned>,
}

pub struct WorkDispatcher {
    bus: SignalBus,
    pools: BTreeMap<String, Vec<String>>,
    cursors: HashMap<String, usize>,
}

impl WorkDispatcher {
    /// Pools are the roster's workers grouped by domain, in roster order
    pub fn from_roster(bus: SignalBus, roster: &Roster) -> Self {
        let mut pools: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for worker in roster.workers() {
            if let Some(domain) = &worker.domain {
                pools
                    .entry(domain.clone())
                    .or_default()
                    .push(worker.name.clone());
            }
        }
        Self::with_pools(bus, pools)
    }

    pub fn with_pools(bus: SignalBus, pools: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            bus,
            pools,
            cursors: HashMap::new(),
        }
    }

    pub fn pools(&self) -> &BTreeMap<String, Vec<String>> {
        &self.pools
    }

    fn route(
        pools: &BTreeMap<String, Vec<String>>,
        cursors: &mut HashMap<String, usize>,
        wave: u32,
        items: &[WorkItem],
    ) -> (Vec<Assignment>, Vec<Unassigned>) {
        let mut assignments = Vec::new();
        let mut unassigned = Vec::new();

        for item in items {
            let pool = match pools.get(&item.domain) {
                Some(pool) if !pool.is_empty() => pool,
                _ => {
                    unassigned.push(Unassigned {
                        story_id: item.id.clone(),
                        reason: format!("no participants in domain '{}'", item.domain),
                    });
                    continue;
                }
            };
            let cursor = cursors.entry(item.domain.clone()).or_insert(0);
            let participant = pool[*cursor % pool.len()].clone();
            *cursor = (*cursor + 1) % pool.len();

            assignments.push(Assignment {
                story_id: item.id.clone(),
                participant,
                domain: item.domain.clone(),
                event: events::assign(wave, &item.id),
                location: None,
            });
        }
        (assignments, unassigned)
    }

    /// Preview without publishing and without advancing the rotation
    pub fn plan(&self, wave: u32, items: &[WorkItem]) -> DispatchPlan {
        let mut cursors = self.cursors.clone();
        let (assignments, unassigned) = Self::route(&self.pools, &mut cursors, wave, items);
        DispatchPlan {
            wave,
            dry_run: true,
            start_published: false,
            assignments,
            unassigned,
        }
    }

    /// Route every item and publish its assignment signal.
    ///
    /// The wave start signal is emitted only if absent. Assignment signals
    /// are re-emitted on every call; an item moved to another participant has
    /// its previous assignment withdrawn.
    pub fn assign(&mut self, wave: u32, items: &[WorkItem]) -> CoordinationResult<DispatchPlan> {
        let (mut assignments, unassigned) =
            Self::route(&self.pools, &mut self.cursors, wave, items);

        let start_key = SignalKey::new(COORDINATOR, events::start(wave))?;
        let start_published = if self.bus.read(&start_key).is_some() {
            debug!(wave, "Wave start signal already present");
            false
        } else {
            self.bus.publish(
                COORDINATOR,
                &start_key.event,
                serde_json::json!({
                    "stories": items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
                    "pools": self.pools,
                }),
            )?;
            true
        };

        for assignment in &mut assignments {
            let stale = SignalPattern::new(events::from_anyone(&assignment.event))?;
            for previous in self.bus.list(&stale) {
                if previous.participant != assignment.participant {
                    self.bus.store().remove(&previous.key())?;
                }
            }

            let item = items.iter().find(|i| i.id == assignment.story_id);
            let path = self.bus.publish(
                &assignment.participant,
                &assignment.event,
                serde_json::json!({
                    "story": item,
                    "assigned_by": COORDINATOR,
                }),
            )?;
            assignment.location = Some(path);
        }

        for skipped in &unassigned {
            warn!(wave, story = %skipped.story_id, reason = %skipped.reason, "Work item not assigned");
        }
        info!(
            wave,
            assigned = assignments.len(),
            unassigned = unassigned.len(),
            "Wave dispatched"
        );

        Ok(DispatchPlan {
            wave,
            dry_run: false,
            start_published,
            assignments,
            unassigned,
        })
    }
}

/// Current status of each item as seen on the signal bus.
///
/// Completion payloads decide `complete` / `failed`; an assignment signal
/// means at least `assigned`; otherwise the item's own status stands.
pub fn derive_statuses(
    bus: &SignalBus,
    wave: u32,
    items: &[WorkItem],
) -> CoordinationResult<BTreeMap<String, WorkItemStatus>> {
    let completions = bus.list(&SignalPattern::new(events::from_anyone(&events::complete(wave)))?);
    let mut finished: HashMap<String, WorkItemStatus> = HashMap::new();
    for signal in &completions {
        let Some(payload) = signal.payload_as::<CompletionPayload>() else {
            continue;
        };
        let status = if payload.status == "failed" {
            WorkItemStatus::Failed
        } else {
            WorkItemStatus::Complete
        };
        for story in payload.stories {
            finished.insert(slug(&story), status);
        }
    }

    let mut statuses = BTreeMap::new();
    for item in items {
        let status = if let Some(done) = finished.get(&slug(&item.id)) {
            *done
        } else {
            let assigned = SignalPattern::new(events::from_anyone(&events::assign(wave, &item.id)))?;
            match (bus.exists(&assigned).is_some(), item.status) {
                (true, WorkItemStatus::Pending) => WorkItemStatus::Assigned,
                (_, status) => status,
            }
        };
        statuses.insert(item.id.clone(), status);
    }
    Ok(statuses)
}
