use super::{
    AlertStore, ConnectivityLog, DeviceRegistry, GroupDirectory, NewAlert, RuleCatalog,
    UpsertOutcome,
};
use crate::model::{AlertStatus, ConnectionEventKind, DeviceRollup, DeviceStatus, RuleRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const ACTIVE_STATUSES: &str = "('open', 'acknowledged')";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct RollupRow {
    device_id: Uuid,
    site_id: Option<Uuid>,
    device_type: Option<String>,
    registry_status: Option<String>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    last_telemetry_at: Option<DateTime<Utc>>,
    metrics: Option<SqlJson<JsonValue>>,
}

#[derive(Debug, Clone, FromRow)]
struct UpsertRow {
    id: i64,
    trigger_count: i64,
    inserted: bool,
}

impl From<RollupRow> for DeviceRollup {
    fn from(row: RollupRow) -> Self {
        let metrics = row
            .metrics
            .as_ref()
            .map(|json| metrics_from_json(&json.0))
            .unwrap_or_default();
        DeviceRollup {
            device_id: row.device_id,
            site_id: row.site_id,
            device_type: row.device_type,
            registry_status: row.registry_status,
            last_heartbeat_at: row.last_heartbeat_at,
            last_telemetry_at: row.last_telemetry_at,
            metrics,
        }
    }
}

fn metrics_from_json(value: &JsonValue) -> HashMap<String, f64> {
    let Some(object) = value.as_object() else {
        return HashMap::new();
    };
    object
        .iter()
        .filter_map(|(name, value)| {
            value
                .as_f64()
                .filter(|value| value.is_finite())
                .map(|value| (name.clone(), value))
        })
        .collect()
}

#[async_trait]
impl RuleCatalog for PgStore {
    async fn fetch_active_tenants(&self) -> Result<Vec<Uuid>> {
        let tenants: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT tenant_id FROM alert_rules
            WHERE enabled = TRUE AND deleted_at IS NULL
            UNION
            SELECT tenant_id FROM devices
            WHERE deleted_at IS NULL
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    async fn fetch_enabled_rules(&self, tenant_id: Uuid) -> Result<Vec<RuleRecord>> {
        let rules: Vec<RuleRecord> = sqlx::query_as(
            r#"
            SELECT
                id AS rule_id,
                tenant_id,
                name,
                kind,
                metric_name,
                comparison_operator,
                threshold,
                severity,
                COALESCE(site_ids, '{}') AS site_ids,
                COALESCE(group_ids, '{}') AS group_ids,
                single_device_group_id,
                COALESCE(params, '{}'::jsonb) AS params
            FROM alert_rules
            WHERE tenant_id = $1
              AND enabled = TRUE
              AND deleted_at IS NULL
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn fetch_device_rollups(&self, tenant_id: Uuid) -> Result<Vec<DeviceRollup>> {
        let rows: Vec<RollupRow> = sqlx::query_as(
            r#"
            SELECT
                device_id,
                site_id,
                device_type,
                registry_status,
                last_heartbeat_at,
                last_telemetry_at,
                metrics
            FROM device_rollups
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DeviceRollup::from).collect())
    }

    async fn set_device_status(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET status = $3,
                status_changed_at = $4
            WHERE tenant_id = $1
              AND id = $2
              AND deleted_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GroupDirectory for PgStore {
    async fn fetch_group_members(&self, tenant_id: Uuid, group_id: i64) -> Result<HashSet<Uuid>> {
        let members: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT device_id
            FROM device_group_members
            WHERE tenant_id = $1 AND group_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members.into_iter().collect())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn upsert_alert(&self, alert: &NewAlert<'_>) -> Result<UpsertOutcome> {
        // The partial unique index on (tenant_id, fingerprint) over active rows is what makes
        // concurrent cycles converge on a single record.
        let query = format!(
            r#"
            INSERT INTO alerts (
                tenant_id,
                device_id,
                rule_id,
                fingerprint,
                kind,
                status,
                severity,
                summary,
                details,
                trigger_count,
                last_triggered_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $10, $6, $7, $8, 1, $9, $9)
            ON CONFLICT (tenant_id, fingerprint) WHERE status IN {ACTIVE_STATUSES}
            DO UPDATE SET
                severity = EXCLUDED.severity,
                summary = EXCLUDED.summary,
                details = EXCLUDED.details,
                trigger_count = alerts.trigger_count + 1,
                last_triggered_at = GREATEST(alerts.last_triggered_at, EXCLUDED.last_triggered_at)
            RETURNING id, trigger_count, (xmax = 0) AS inserted
            "#
        );
        let row: UpsertRow = sqlx::query_as(&query)
            .bind(alert.tenant_id)
            .bind(alert.device_id)
            .bind(alert.rule_id)
            .bind(alert.fingerprint)
            .bind(alert.kind.as_str())
            .bind(alert.severity)
            .bind(alert.summary)
            .bind(SqlJson(alert.details))
            .bind(alert.at)
            .bind(AlertStatus::Open.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(UpsertOutcome {
            alert_id: row.id,
            was_created: row.inserted,
            trigger_count: row.trigger_count,
        })
    }

    async fn close_alert(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!(
            r#"
            UPDATE alerts
            SET status = $4,
                closed_at = $3
            WHERE tenant_id = $1
              AND fingerprint = $2
              AND status IN {ACTIVE_STATUSES}
            "#
        );
        let result = sqlx::query(&query)
            .bind(tenant_id)
            .bind(fingerprint)
            .bind(at)
            .bind(AlertStatus::Closed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_fingerprints(&self, tenant_id: Uuid) -> Result<HashSet<String>> {
        let query = format!(
            "SELECT fingerprint FROM alerts WHERE tenant_id = $1 AND status IN {ACTIVE_STATUSES}"
        );
        let fingerprints: Vec<String> = sqlx::query_scalar(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(fingerprints.into_iter().collect())
    }

    async fn is_silenced(
        &self,
        tenant_id: Uuid,
        fingerprint: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let silenced: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM alert_silences
                WHERE tenant_id = $1
                  AND fingerprint = $2
                  AND starts_at <= $3
                  AND (ends_at IS NULL OR ends_at > $3)
            )
            "#,
        )
        .bind(tenant_id)
        .bind(fingerprint)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(silenced)
    }

    async fn is_in_maintenance(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
        device_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let in_window: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM maintenance_windows
                WHERE tenant_id = $1
                  AND starts_at <= $4
                  AND ends_at > $4
                  AND (site_id IS NULL OR site_id = $2)
                  AND (device_type IS NULL OR device_type = $3)
            )
            "#,
        )
        .bind(tenant_id)
        .bind(site_id)
        .bind(device_type)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_window)
    }
}

#[async_trait]
impl ConnectivityLog for PgStore {
    async fn log_connection_event(
        &self,
        tenant_id: Uuid,
        device_id: Uuid,
        event: ConnectionEventKind,
        details: &JsonValue,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_connection_events (tenant_id, device_id, event_type, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(tenant_id)
        .bind(device_id)
        .bind(event.as_str())
        .bind(SqlJson(details))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertKind;
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use std::env;
    use std::sync::Arc;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id bigserial primary key,
                tenant_id uuid not null,
                device_id uuid not null,
                rule_id bigint null,
                fingerprint text not null,
                kind text not null,
                status text not null,
                severity smallint not null,
                summary text not null,
                details jsonb not null default '{}'::jsonb,
                trigger_count bigint not null,
                last_triggered_at timestamptz not null,
                created_at timestamptz not null,
                closed_at timestamptz null
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS alerts_active_fingerprint
            ON alerts (tenant_id, fingerprint)
            WHERE status IN ('open', 'acknowledged')
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_silences (
                tenant_id uuid not null,
                fingerprint text not null,
                starts_at timestamptz not null,
                ends_at timestamptz null
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS maintenance_windows (
                tenant_id uuid not null,
                site_id uuid null,
                device_type text null,
                starts_at timestamptz not null,
                ends_at timestamptz not null
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(pool)
    }

    async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;
        Ok(())
    }

    fn integration_database_url() -> Option<String> {
        if env::var("ENGINE_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return None;
        }
        env::var("ENGINE_TEST_DATABASE_URL").ok()
    }

    #[tokio::test]
    async fn concurrent_upserts_converge_on_one_active_alert() -> Result<()> {
        let Some(database_url) = integration_database_url() else {
            return Ok(());
        };
        let schema = format!("engine_test_upsert_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = Arc::new(PgStore::new(pool.clone()));

        let tenant_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        let details = json!({"value": 91.0});
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let details = details.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_alert(&NewAlert {
                        tenant_id,
                        device_id,
                        rule_id: Some(11),
                        fingerprint: "fp-concurrent",
                        kind: AlertKind::Threshold,
                        severity: 3,
                        summary: "temperature high",
                        details: &details,
                        at: Utc::now(),
                    })
                    .await
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await??.was_created {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let (rows, trigger_count): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), MAX(trigger_count) FROM alerts WHERE fingerprint = 'fp-concurrent'",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(rows, 1);
        assert_eq!(trigger_count, 8);

        // An acknowledged alert is still the active record for its fingerprint.
        sqlx::query("UPDATE alerts SET status = $1 WHERE fingerprint = 'fp-concurrent'")
            .bind(AlertStatus::Acknowledged.as_str())
            .execute(&pool)
            .await?;
        let bumped = store
            .upsert_alert(&NewAlert {
                tenant_id,
                device_id,
                rule_id: Some(11),
                fingerprint: "fp-concurrent",
                kind: AlertKind::Threshold,
                severity: 3,
                summary: "temperature high",
                details: &details,
                at: Utc::now(),
            })
            .await?;
        assert!(!bumped.was_created);
        assert_eq!(bumped.trigger_count, 9);

        assert!(store.close_alert(tenant_id, "fp-concurrent", Utc::now()).await?);
        let statuses: Vec<String> =
            sqlx::query_scalar("SELECT status FROM alerts WHERE fingerprint = 'fp-concurrent'")
                .fetch_all(&pool)
                .await?;
        assert_eq!(statuses, vec![AlertStatus::Closed.as_str().to_string()]);
        assert!(!store.close_alert(tenant_id, "fp-concurrent", Utc::now()).await?);
        assert!(store.active_fingerprints(tenant_id).await?.is_empty());

        let reopened = store
            .upsert_alert(&NewAlert {
                tenant_id,
                device_id,
                rule_id: Some(11),
                fingerprint: "fp-concurrent",
                kind: AlertKind::Threshold,
                severity: 3,
                summary: "temperature high again",
                details: &details,
                at: Utc::now(),
            })
            .await?;
        assert!(reopened.was_created);
        assert_eq!(reopened.trigger_count, 1);

        drop_schema(&database_url, &schema).await?;
        Ok(())
    }

    #[tokio::test]
    async fn silences_and_maintenance_windows_respect_time_and_scope() -> Result<()> {
        let Some(database_url) = integration_database_url() else {
            return Ok(());
        };
        let schema = format!("engine_test_suppress_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgStore::new(pool.clone());

        let tenant_id = Uuid::new_v4();
        let site_id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO alert_silences (tenant_id, fingerprint, starts_at, ends_at) VALUES ($1, 'fp-a', $2, NULL)",
        )
        .bind(tenant_id)
        .bind(now - chrono::Duration::minutes(5))
        .execute(&pool)
        .await?;
        sqlx::query(
            "INSERT INTO maintenance_windows (tenant_id, site_id, device_type, starts_at, ends_at) VALUES ($1, $2, 'pump', $3, $4)",
        )
        .bind(tenant_id)
        .bind(site_id)
        .bind(now - chrono::Duration::minutes(5))
        .bind(now + chrono::Duration::minutes(5))
        .execute(&pool)
        .await?;

        assert!(store.is_silenced(tenant_id, "fp-a", now).await?);
        assert!(!store.is_silenced(tenant_id, "fp-b", now).await?);
        assert!(store.is_in_maintenance(tenant_id, Some(site_id), Some("pump"), now).await?);
        assert!(!store.is_in_maintenance(tenant_id, Some(site_id), Some("meter"), now).await?);
        assert!(!store.is_in_maintenance(tenant_id, None, Some("pump"), now).await?);
        assert!(
            !store
                .is_in_maintenance(tenant_id, Some(site_id), Some("pump"), now + chrono::Duration::hours(1))
                .await?
        );

        drop_schema(&database_url, &schema).await?;
        Ok(())
    }

    #[test]
    fn metrics_json_keeps_only_finite_numbers() {
        let metrics = metrics_from_json(&json!({
            "temperature": 21.5,
            "label": "north",
            "humidity": 40,
        }));
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.get("humidity"), Some(&40.0));
    }
}
