use crate::model::{ConnectionEventKind, DeviceRollup, DeviceStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub device_id: Uuid,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

impl StatusChange {
    pub fn connection_event(&self) -> Option<ConnectionEventKind> {
        match (self.from, self.to) {
            (DeviceStatus::Unknown, DeviceStatus::Online) => Some(ConnectionEventKind::FirstSeen),
            (_, DeviceStatus::Online) => Some(ConnectionEventKind::Connected),
            (DeviceStatus::Online, DeviceStatus::Stale) => Some(ConnectionEventKind::Disconnected),
            _ => None,
        }
    }

    pub fn opens_no_heartbeat(&self) -> bool {
        self.from == DeviceStatus::Online && self.to == DeviceStatus::Stale
    }

    /// Every transition into ONLINE closes NO_HEARTBEAT; after a restart the
    /// alert may predate this process, and the close is idempotent.
    pub fn closes_no_heartbeat(&self) -> bool {
        self.to == DeviceStatus::Online
    }
}

/// Connectivity state machine over the device rollups of one tenant.
#[derive(Debug)]
pub struct DeviceStatusTracker {
    staleness: ChronoDuration,
    statuses: HashMap<Uuid, DeviceStatus>,
}

impl DeviceStatusTracker {
    pub fn new(staleness: ChronoDuration) -> Self {
        Self {
            staleness,
            statuses: HashMap::new(),
        }
    }

    pub fn status(&self, device_id: Uuid) -> Option<DeviceStatus> {
        self.statuses.get(&device_id).copied()
    }

    pub fn compute(&self, last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DeviceStatus {
        match last_seen_at {
            Some(seen) if now - seen <= self.staleness => DeviceStatus::Online,
            _ => DeviceStatus::Stale,
        }
    }

    /// Records the device's current status and returns the transition, if any.
    /// The first observation of a device starts from its registry status.
    pub fn observe(&mut self, device: &DeviceRollup, now: DateTime<Utc>) -> Option<StatusChange> {
        let next = self.compute(device.last_seen_at(), now);
        let previous = self
            .statuses
            .insert(device.device_id, next)
            .unwrap_or_else(|| DeviceStatus::from_registry(device.registry_status.as_deref()));
        (previous != next).then_some(StatusChange {
            device_id: device.device_id,
            from: previous,
            to: next,
        })
    }

    /// Drops devices that have left the registry.
    pub fn retain(&mut self, live: &HashSet<Uuid>) {
        self.statuses.retain(|device_id, _| live.contains(device_id));
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).single().expect("valid ts")
    }

    fn rollup(device_id: Uuid, registry: Option<&str>, seen: Option<DateTime<Utc>>) -> DeviceRollup {
        DeviceRollup {
            device_id,
            site_id: None,
            device_type: None,
            registry_status: registry.map(ToOwned::to_owned),
            last_heartbeat_at: seen,
            last_telemetry_at: None,
            metrics: HashMap::new(),
        }
    }

    #[test]
    fn first_sighting_then_steady_state_emits_once() {
        let device = Uuid::new_v4();
        let mut tracker = DeviceStatusTracker::new(ChronoDuration::seconds(300));
        let seen = rollup(device, None, Some(at(0)));

        let change = tracker.observe(&seen, at(10)).expect("first seen");
        assert_eq!(change.from, DeviceStatus::Unknown);
        assert_eq!(change.to, DeviceStatus::Online);
        assert_eq!(change.connection_event(), Some(ConnectionEventKind::FirstSeen));
        assert!(!change.opens_no_heartbeat());

        for offset in [20, 60, 300] {
            assert_eq!(tracker.observe(&seen, at(offset)), None);
        }
    }

    #[test]
    fn online_to_stale_and_back() {
        let device = Uuid::new_v4();
        let mut tracker = DeviceStatusTracker::new(ChronoDuration::seconds(300));
        let quiet = rollup(device, Some("online"), Some(at(0)));
        assert_eq!(tracker.observe(&quiet, at(100)), None);

        let change = tracker.observe(&quiet, at(301)).expect("went stale");
        assert_eq!(change.connection_event(), Some(ConnectionEventKind::Disconnected));
        assert!(change.opens_no_heartbeat());
        assert_eq!(tracker.observe(&quiet, at(900)), None);

        let back = rollup(device, Some("stale"), Some(at(950)));
        let change = tracker.observe(&back, at(960)).expect("reconnected");
        assert_eq!(change.connection_event(), Some(ConnectionEventKind::Connected));
        assert!(change.closes_no_heartbeat());
    }

    #[test]
    fn unknown_to_stale_is_silent() {
        let device = Uuid::new_v4();
        let mut tracker = DeviceStatusTracker::new(ChronoDuration::seconds(60));
        let change = tracker
            .observe(&rollup(device, None, None), at(0))
            .expect("status recorded");
        assert_eq!(change.to, DeviceStatus::Stale);
        assert_eq!(change.connection_event(), None);
        assert!(!change.opens_no_heartbeat());
        assert!(!change.closes_no_heartbeat());
    }

    #[test]
    fn registry_status_seeds_first_observation() {
        let device = Uuid::new_v4();
        let mut tracker = DeviceStatusTracker::new(ChronoDuration::seconds(60));
        let change = tracker
            .observe(&rollup(device, Some("offline"), Some(at(0))), at(5))
            .expect("reconnect");
        assert_eq!(change.from, DeviceStatus::Stale);
        assert_eq!(change.connection_event(), Some(ConnectionEventKind::Connected));
    }

    #[test]
    fn retain_forgets_departed_devices() {
        let (kept, gone) = (Uuid::new_v4(), Uuid::new_v4());
        let mut tracker = DeviceStatusTracker::new(ChronoDuration::seconds(60));
        tracker.observe(&rollup(kept, None, Some(at(0))), at(1));
        tracker.observe(&rollup(gone, None, Some(at(0))), at(1));
        tracker.retain(&HashSet::from([kept]));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.status(gone), None);
        assert_eq!(tracker.status(kept), Some(DeviceStatus::Online));
    }
}
