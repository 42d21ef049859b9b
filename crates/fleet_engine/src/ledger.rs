use chrono::{DateTime, Utc};
use fleet_model::{HostId, HostResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("host {0} is not part of this job")]
    UnknownHost(HostId),
    #[error("result for host {0} already recorded")]
    AlreadyResolved(HostId),
}

#[derive(Debug)]
enum Slot {
    Waiting,
    Started(DateTime<Utc>),
    Resolved(HostResult),
}

/// One write-once slot per host. Workers fill their own slot; the
/// coordinator fills whatever is left when a job is stopped early.
#[derive(Debug)]
pub(crate) struct ResultLedger {
    order: Vec<HostId>,
    slots: Mutex<HashMap<HostId, Slot>>,
}

impl ResultLedger {
    pub fn new(hosts: &[HostId]) -> Self {
        Self {
            order: hosts.to_vec(),
            slots: Mutex::new(hosts.iter().map(|h| (h.clone(), Slot::Waiting)).collect()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<HostId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_started(&self, host: &str) {
        if let Some(slot) = self.slots().get_mut(host) {
            if matches!(slot, Slot::Waiting) {
                *slot = Slot::Started(Utc::now());
            }
        }
    }

    pub fn resolve(&self, result: HostResult) -> Result<(), SlotError> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(&result.host)
            .ok_or_else(|| SlotError::UnknownHost(result.host.clone()))?;
        if matches!(slot, Slot::Resolved(_)) {
            return Err(SlotError::AlreadyResolved(result.host));
        }
        *slot = Slot::Resolved(result);
        Ok(())
    }

    pub fn all_resolved(&self) -> bool {
        self.slots()
            .values()
            .all(|slot| matches!(slot, Slot::Resolved(_)))
    }

    /// Unresolved hosts in job order, with their start time if they began.
    pub fn unresolved(&self) -> Vec<(HostId, Option<DateTime<Utc>>)> {
        let slots = self.slots();
        self.order
            .iter()
            .filter_map(|host| match slots.get(host) {
                Some(Slot::Waiting) => Some((host.clone(), None)),
                Some(Slot::Started(at)) => Some((host.clone(), Some(*at))),
                _ => None,
            })
            .collect()
    }

    /// Resolved results in job order.
    pub fn results(&self) -> Vec<HostResult> {
        let slots = self.slots();
        self.order
            .iter()
            .filter_map(|host| match slots.get(host) {
                Some(Slot::Resolved(result)) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }
}
