use super::bounded;
use crate::model::{AlertKind, DeviceRollup};
use crate::store::{AlertStore, NewAlert, UpsertOutcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Dedup key for one alert condition. Alerts without a rule (NO_HEARTBEAT) use `-`.
pub fn fingerprint(device_id: Uuid, rule_id: Option<i64>, kind: AlertKind) -> String {
    let rule = rule_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let payload = format!("{}|{}|{}", kind.as_str(), device_id.as_hyphenated(), rule);
    let digest = Sha256::digest(payload.as_bytes());
    let hex = format!("{digest:x}");
    hex.chars().take(32).collect()
}

#[derive(Debug, Clone)]
pub struct AlertFire<'a> {
    pub tenant_id: Uuid,
    pub device_id: Uuid,
    pub rule_id: Option<i64>,
    pub kind: AlertKind,
    pub severity: i16,
    pub summary: &'a str,
    pub details: &'a JsonValue,
    pub at: DateTime<Utc>,
}

/// Keeps at most one active alert per fingerprint by delegating every write to
/// the store's atomic upsert, with a bounded timeout on each call.
#[derive(Clone)]
pub struct DeduplicatingAlertStore {
    store: Arc<dyn AlertStore>,
    timeout: Duration,
}

impl DeduplicatingAlertStore {
    pub fn new(store: Arc<dyn AlertStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn upsert(&self, fire: &AlertFire<'_>) -> Result<UpsertOutcome> {
        let fingerprint = fingerprint(fire.device_id, fire.rule_id, fire.kind);
        let alert = NewAlert {
            tenant_id: fire.tenant_id,
            device_id: fire.device_id,
            rule_id: fire.rule_id,
            fingerprint: &fingerprint,
            kind: fire.kind,
            severity: fire.severity,
            summary: fire.summary,
            details: fire.details,
            at: fire.at,
        };
        let outcome = bounded(self.timeout, "alert upsert", self.store.upsert_alert(&alert)).await?;
        if outcome.was_created {
            tracing::info!(
                tenant = %fire.tenant_id,
                device = %fire.device_id,
                rule = ?fire.rule_id,
                kind = fire.kind.as_str(),
                alert_id = outcome.alert_id,
                "alert opened"
            );
        } else {
            tracing::debug!(
                alert_id = outcome.alert_id,
                trigger_count = outcome.trigger_count,
                "alert re-triggered"
            );
        }
        Ok(outcome)
    }

    /// Closing an alert that is not active is a no-op returning `false`.
    pub async fn close(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        rule_id: Option<i64>,
        kind: AlertKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let fingerprint = fingerprint(device_id, rule_id, kind);
        let closed = bounded(
            self.timeout,
            "alert close",
            self.store.close_alert(tenant_id, &fingerprint, at),
        )
        .await?;
        if closed {
            tracing::info!(
                tenant = %tenant_id,
                device = %device_id,
                rule = ?rule_id,
                kind = kind.as_str(),
                "alert closed"
            );
        }
        Ok(closed)
    }

    pub async fn active_fingerprints(&self, tenant_id: Uuid) -> Result<HashSet<String>> {
        bounded(
            self.timeout,
            "active alert lookup",
            self.store.active_fingerprints(tenant_id),
        )
        .await
    }

    /// Silence or maintenance check. Lookup failures fail open: the alert is
    /// treated as not suppressed.
    pub async fn is_suppressed(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        device: &DeviceRollup,
        at: DateTime<Utc>,
    ) -> bool {
        let silenced = bounded(
            self.timeout,
            "silence lookup",
            self.store.is_silenced(tenant_id, fingerprint, at),
        )
        .await;
        match silenced {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    tenant = %tenant_id,
                    device = %device.device_id,
                    error = %err,
                    "silence lookup failed; treating as not suppressed"
                );
            }
        }

        let maintenance = bounded(
            self.timeout,
            "maintenance lookup",
            self.store.is_in_maintenance(
                tenant_id,
                device.site_id,
                device.device_type.as_deref(),
                at,
            ),
        )
        .await;
        match maintenance {
            Ok(active) => active,
            Err(err) => {
                tracing::warn!(
                    tenant = %tenant_id,
                    device = %device.device_id,
                    error = %err,
                    "maintenance lookup failed; treating as not suppressed"
                );
                false
            }
        }
    }
}
