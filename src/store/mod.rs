//! Boundaries to the external stores the evaluator reads from and writes to.
//!
//! Every trait here is implemented by [`postgres::PgStore`] for production
//! and by an in-memory store in tests. The engine never assumes anything
//! beyond these contracts; in particular, [`AlertStore::upsert_alert`] must
//! be a single atomic insert-or-update keyed by `(tenant_id, fingerprint)`
//! over active alerts.

pub mod postgres;

#[cfg(test)]
pub(crate) mod memory;

use crate::model::{AlertKind, ConnectionEventKind, DeviceRollup, DeviceStatus, RuleRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub use postgres::PgStore;

#[async_trait]
pub trait RuleCatalog: Send + Sync {
    /// Tenants that have enabled rules or registered devices.
    async fn fetch_active_tenants(&self) -> Result<Vec<Uuid>>;

    /// Enabled rules for a tenant, ordered by rule id.
    async fn fetch_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<RuleRecord>>;
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn fetch_device_rollups(&self, tenant_id: Uuid) -> Result<Vec<DeviceRollup>>;

    async fn set_device_status(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn fetch_group_members(&self, tenant_id: Uuid, group_id: i64) -> Result<HashSet<Uuid>>;
}

#[derive(Debug, Clone)]
pub struct NewAlert<'a> {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub rule_id: Option<i64>,
    pub fingerprint: &'a str,
    pub kind: AlertKind,
    pub severity: i16,
    pub summary: &'a str,
    pub details: &'a JsonValue,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub alert_id: i64,
    pub was_created: bool,
    pub trigger_count: i64,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Creates the active alert for `fingerprint` with `trigger_count = 1`, or bumps the
    /// existing one, as one atomic operation.
    async fn upsert_alert(&self, alert: &NewAlert<'_>) -> Result<UpsertOutcome>;

    /// Closes the active alert for `fingerprint`. Returns false when nothing was active.
    async fn close_alert(&self, tenant_id: Uuid, fingerprint: &str, at: DateTime<Utc>)
        -> Result<bool>;

    async fn active_fingerprints(&self, tenant_id: Uuid) -> Result<HashSet<String>>;

    async fn is_silenced(&self, tenant_id: Uuid, fingerprint: &str, at: DateTime<Utc>)
        -> Result<bool>;

    async fn is_in_maintenance(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
        device_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ConnectivityLog: Send + Sync {
    async fn log_connection_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        event: ConnectionEventKind,
        details: &JsonValue,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// The collaborators one evaluation cycle talks to.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn RuleCatalog>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub groups: Arc<dyn GroupDirectory>,
    pub alerts: Arc<dyn AlertStore>,
    pub connectivity: Arc<dyn ConnectivityLog>,
}

impl Stores {
    /// Wires every boundary to one backing implementation.
    pub fn single<S>(store: Arc<S>) -> Self
    where
        S: RuleCatalog + DeviceRegistry + GroupDirectory + AlertStore + ConnectivityLog + 'static,
    {
        Self {
            catalog: store.clone(),
            registry: store.clone(),
            groups: store.clone(),
            alerts: store.clone(),
            connectivity: store,
        }
    }
}
