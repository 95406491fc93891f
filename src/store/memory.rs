use super::{
    AlertStore, ConnectivityLog, DeviceRegistry, GroupDirectory, NewAlert, RuleCatalog,
    UpsertOutcome,
};
use crate::model::{
    AlertRecord, AlertStatus, ConnectionEventKind, DeviceRollup, DeviceStatus, RuleRecord,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Tenants,
    Rules,
    Rollups,
    Groups,
    Upsert,
    Close,
    Active,
    Suppression,
    Connectivity,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LoggedEvent {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub event: ConnectionEventKind,
    pub details: JsonValue,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    tenants: Vec<Uuid>,
    rules: HashMap<Uuid, Vec<RuleRecord>>,
    rollups: HashMap<Uuid, Vec<DeviceRollup>>,
    groups: HashMap<(Uuid, i64), HashSet<Uuid>>,
    alerts: Vec<AlertRecord>,
    next_alert_id: i64,
    silenced: HashSet<(Uuid, String)>,
    maintenance: HashSet<Uuid>,
    events: Vec<LoggedEvent>,
    statuses: HashMap<(Uuid, Uuid), DeviceStatus>,
    failing: HashSet<Op>,
    stalled: HashSet<Op>,
    group_fetches: usize,
    close_calls: usize,
}

/// Test double for every store boundary; each upsert runs under one lock, so it is atomic.
#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn check(&self, op: Op) -> Result<()> {
        if self.with(|state| state.failing.contains(&op)) {
            return Err(anyhow!("injected {op:?} failure"));
        }
        Ok(())
    }

    async fn gate(&self, op: Op) -> Result<()> {
        if self.with(|state| state.stalled.contains(&op)) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.check(op)
    }

    pub fn set_tenants(&self, tenants: Vec<Uuid>) {
        self.with(|state| state.tenants = tenants);
    }

    pub fn set_rules(&self, tenant_id: Uuid, rules: Vec<RuleRecord>) {
        self.with(|state| {
            state.rules.insert(tenant_id, rules);
        });
    }

    pub fn set_rollups(&self, tenant_id: Uuid, rollups: Vec<DeviceRollup>) {
        self.with(|state| {
            state.rollups.insert(tenant_id, rollups);
        });
    }

    pub fn set_group(&self, tenant_id: Uuid, group_id: i64, members: &[Uuid]) {
        self.with(|state| {
            state
                .groups
                .insert((tenant_id, group_id), members.iter().copied().collect());
        });
    }

    pub fn silence(&self, tenant_id: Uuid, fingerprint: &str) {
        self.with(|state| {
            state.silenced.insert((tenant_id, fingerprint.to_string()));
        });
    }

    pub fn set_maintenance(&self, tenant_id: Uuid, active: bool) {
        self.with(|state| {
            if active {
                state.maintenance.insert(tenant_id);
            } else {
                state.maintenance.remove(&tenant_id);
            }
        });
    }

    pub fn fail(&self, op: Op, failing: bool) {
        self.with(|state| {
            if failing {
                state.failing.insert(op);
            } else {
                state.failing.remove(&op);
            }
        });
    }

    /// Makes `op` hang long enough to trip any store timeout.
    pub fn stall(&self, op: Op) {
        self.with(|state| {
            state.stalled.insert(op);
        });
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.with(|state| state.alerts.clone())
    }

    pub fn active_alerts(&self, tenant_id: Uuid) -> Vec<AlertRecord> {
        self.with(|state| {
            state
                .alerts
                .iter()
                .filter(|alert| alert.tenant_id == tenant_id && alert.status.is_active())
                .cloned()
                .collect()
        })
    }

    /// Operator acknowledgement: the alert stays active.
    pub fn acknowledge(&self, tenant_id: Uuid, fingerprint: &str) -> bool {
        self.with(|state| {
            let mut acknowledged = false;
            for alert in state.alerts.iter_mut().filter(|alert| {
                alert.tenant_id == tenant_id
                    && alert.fingerprint == fingerprint
                    && alert.status == AlertStatus::Open
            }) {
                alert.status = AlertStatus::Acknowledged;
                acknowledged = true;
            }
            acknowledged
        })
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.with(|state| state.events.clone())
    }

    pub fn device_status(&self, tenant_id: Uuid, device_id: Uuid) -> Option<DeviceStatus> {
        self.with(|state| state.statuses.get(&(tenant_id, device_id)).copied())
    }

    pub fn group_fetches(&self) -> usize {
        self.with(|state| state.group_fetches)
    }

    pub fn close_calls(&self) -> usize {
        self.with(|state| state.close_calls)
    }
}

#[async_trait]
impl RuleCatalog for MemoryStore {
    async fn fetch_active_tenants(&self) -> Result<Vec<Uuid>> {
        self.gate(Op::Tenants).await?;
        Ok(self.with(|state| state.tenants.clone()))
    }

    async fn fetch_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<RuleRecord>> {
        self.gate(Op::Rules).await?;
        Ok(self.with(|state| state.rules.get(&tenant_id).cloned().unwrap_or_default()))
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn fetch_device_rollups(&self, tenant_id: Uuid) -> Result<Vec<DeviceRollup>> {
        self.gate(Op::Rollups).await?;
        Ok(self.with(|state| state.rollups.get(&tenant_id).cloned().unwrap_or_default()))
    }

    async fn set_device_status(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        status: DeviceStatus,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        self.with(|state| {
            state.statuses.insert((tenant_id, device_id), status);
        });
        Ok(())
    }
}

#[async_trait]
impl GroupDirectory for MemoryStore {
    async fn fetch_group_members(&self, tenant_id: Uuid, group_id: i64) -> Result<HashSet<Uuid>> {
        self.with(|state| state.group_fetches += 1);
        self.gate(Op::Groups).await?;
        Ok(self.with(|state| {
            state
                .groups
                .get(&(tenant_id, group_id))
                .cloned()
                .unwrap_or_default()
        }))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn upsert_alert(&self, alert: &NewAlert<'_>) -> Result<UpsertOutcome> {
        self.gate(Op::Upsert).await?;
        Ok(self.with(|state| {
            if let Some(existing) = state.alerts.iter_mut().find(|existing| {
                existing.tenant_id == alert.tenant_id
                    && existing.fingerprint == alert.fingerprint
                    && existing.status.is_active()
            }) {
                existing.severity = alert.severity;
                existing.summary = alert.summary.to_string();
                existing.details = alert.details.clone();
                existing.trigger_count += 1;
                existing.last_triggered_at = existing.last_triggered_at.max(alert.at);
                return UpsertOutcome {
                    alert_id: existing.id,
                    was_created: false,
                    trigger_count: existing.trigger_count,
                };
            }

            state.next_alert_id += 1;
            let id = state.next_alert_id;
            state.alerts.push(AlertRecord {
                id,
                tenant_id: alert.tenant_id,
                device_id: alert.device_id,
                rule_id: alert.rule_id,
                fingerprint: alert.fingerprint.to_string(),
                kind: alert.kind,
                status: AlertStatus::Open,
                severity: alert.severity,
                summary: alert.summary.to_string(),
                details: alert.details.clone(),
                trigger_count: 1,
                last_triggered_at: alert.at,
                created_at: alert.at,
                closed_at: None,
            });
            UpsertOutcome {
                alert_id: id,
                was_created: true,
                trigger_count: 1,
            }
        }))
    }

    async fn close_alert(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with(|state| state.close_calls += 1);
        self.gate(Op::Close).await?;
        Ok(self.with(|state| {
            let mut closed = false;
            for alert in state.alerts.iter_mut().filter(|alert| {
                alert.tenant_id == tenant_id
                    && alert.fingerprint == fingerprint
                    && alert.status.is_active()
            }) {
                alert.status = AlertStatus::Closed;
                alert.closed_at = Some(at);
                closed = true;
            }
            closed
        }))
    }

    async fn active_fingerprints(&self, tenant_id: Uuid) -> Result<HashSet<String>> {
        self.gate(Op::Active).await?;
        Ok(self.with(|state| {
            state
                .alerts
                .iter()
                .filter(|alert| alert.tenant_id == tenant_id && alert.status.is_active())
                .map(|alert| alert.fingerprint.clone())
                .collect()
        }))
    }

    async fn is_silenced(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        self.gate(Op::Suppression).await?;
        Ok(self.with(|state| {
            state
                .silenced
                .contains(&(tenant_id, fingerprint.to_string()))
        }))
    }

    async fn is_in_maintenance(
        &self,
        tenant_id: Uuid,
        _site_id: Option<Uuid>,
        _device_type: Option<&str>,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        self.gate(Op::Suppression).await?;
        Ok(self.with(|state| state.maintenance.contains(&tenant_id)))
    }
}

#[async_trait]
impl ConnectivityLog for MemoryStore {
    async fn log_connection_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        event: ConnectionEventKind,
        details: &JsonValue,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.gate(Op::Connectivity).await?;
        self.with(|state| {
            state.events.push(LoggedEvent {
                tenant_id,
                device_id,
                event,
                details: details.clone(),
                at,
            })
        });
        Ok(())
    }
}
