//! Periodic alert evaluation.
//!
//! Each tick discovers tenants and runs one cycle per tenant concurrently.
//! A tenant's windows, duration timers, group cache and device statuses live
//! in its [`EvaluationContext`], which only that tenant's cycle touches.

pub mod alerts;
pub mod eval;
pub mod scope;
pub mod status;
pub mod window;


use crate::config::Config;
use crate::model::{AlertKind, DeviceRollup, RuleDefinition};
use crate::store::Stores;
use alerts::{fingerprint, AlertFire, DeduplicatingAlertStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use eval::{evaluate, Decision, EvalState};
use scope::GroupScopeResolver;
use serde_json::json;
use status::{DeviceStatusTracker, StatusChange};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const NO_HEARTBEAT_SEVERITY: i16 = 4;

/// Runs `fut` under `timeout`; elapsing becomes an error naming `what`.
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .with_context(|| format!("{what} timed out"))?
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub cycle_deadline: Duration,
    pub store_timeout: Duration,
    pub staleness_threshold_seconds: i64,
    pub max_window_keys: usize,
    pub tenant_allowlist: Option<HashSet<Uuid>>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let allowlist: HashSet<Uuid> = config.tenants.iter().copied().collect();
        Self {
            poll_interval: config.poll_interval(),
            cycle_deadline: config.cycle_deadline(),
            store_timeout: config.store_timeout(),
            staleness_threshold_seconds: config.staleness_threshold_seconds as i64,
            max_window_keys: config.max_window_keys,
            tenant_allowlist: (!allowlist.is_empty()).then_some(allowlist),
        }
    }

    fn allows(&self, tenant_id: &Uuid) -> bool {
        self.tenant_allowlist
            .as_ref()
            .map_or(true, |allowed| allowed.contains(tenant_id))
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            cycle_deadline: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            staleness_threshold_seconds: 300,
            max_window_keys: 50_000,
            tenant_allowlist: None,
        }
    }
}

/// Everything one tenant carries from cycle to cycle.
#[derive(Debug)]
pub struct EvaluationContext {
    pub tenant_id: Uuid,
    pub state: EvalState,
    pub scope: GroupScopeResolver,
    pub status: DeviceStatusTracker,
    /// Stale devices whose NO_HEARTBEAT upsert failed; retried each cycle while still stale.
    pending_no_heartbeat: HashSet<Uuid>,
}

impl EvaluationContext {
    pub fn new(tenant_id: Uuid, settings: &EngineSettings) -> Self {
        Self {
            tenant_id,
            state: EvalState::new(settings.max_window_keys),
            scope: GroupScopeResolver::new(tenant_id),
            status: DeviceStatusTracker::new(ChronoDuration::seconds(
                settings.staleness_threshold_seconds,
            )),
            pending_no_heartbeat: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tenant_id: Uuid,
    pub devices: usize,
    pub devices_evaluated: usize,
    pub rules: usize,
    pub invalid_rules: usize,
    pub evaluations: usize,
    pub fired: usize,
    pub created: usize,
    pub retriggered: usize,
    pub closed: usize,
    pub suppressed: usize,
    pub skipped: usize,
    pub status_changes: usize,
    pub write_failures: usize,
    pub windows_swept: usize,
    pub abandoned: bool,
}

/// Closes are only issued for fingerprints known to be active, unless the
/// snapshot could not be read.
fn should_close(active: &Option<HashSet<String>>, fingerprint: &str) -> bool {
    active
        .as_ref()
        .map_or(true, |active| active.contains(fingerprint))
}

/// One evaluation cycle for one tenant.
///
/// Fails only when the rule catalog or the device rollups cannot be read;
/// every later store failure is logged, counted, and left for the next cycle.
pub async fn run_cycle(
    stores: &Stores,
    settings: &EngineSettings,
    ctx: &mut EvaluationContext,
    now: DateTime<Utc>,
    deadline: Instant,
) -> Result<CycleReport> {
    let tenant_id = ctx.tenant_id;
    let timeout = settings.store_timeout;
    let mut report = CycleReport {
        tenant_id,
        ..CycleReport::default()
    };
    ctx.scope.begin_cycle();

    let records = bounded(
        timeout,
        "rule catalog fetch",
        stores.catalog.fetch_enabled_rules(tenant_id),
    )
    .await?;
    let rollups = bounded(
        timeout,
        "device rollup fetch",
        stores.registry.fetch_device_rollups(tenant_id),
    )
    .await?;

    let mut rules: Vec<RuleDefinition> = Vec::with_capacity(records.len());
    for record in &records {
        match record.parse() {
            Ok(rule) => rules.push(rule),
            Err(err) => {
                report.invalid_rules += 1;
                tracing::warn!(
                    tenant = %tenant_id,
                    rule = record.rule_id,
                    error = %err,
                    "skipping misconfigured rule"
                );
            }
        }
    }
    rules.sort_by_key(|rule| rule.rule_id);
    report.rules = rules.len();
    report.devices = rollups.len();

    let alerts = DeduplicatingAlertStore::new(stores.alerts.clone(), timeout);
    let mut active = match alerts.active_fingerprints(tenant_id).await {
        Ok(active) => Some(active),
        Err(err) => {
            tracing::warn!(
                tenant = %tenant_id,
                error = %err,
                "active alert snapshot unavailable; closing unconditionally this cycle"
            );
            None
        }
    };

    for (index, device) in rollups.iter().enumerate() {
        if Instant::now() >= deadline {
            report.abandoned = true;
            tracing::warn!(
                tenant = %tenant_id,
                remaining = rollups.len() - index,
                "cycle deadline exceeded; abandoning remaining devices"
            );
            break;
        }
        report.devices_evaluated += 1;

        if let Some(change) = ctx.status.observe(device, now) {
            report.status_changes += 1;
            apply_status_change(
                stores,
                &alerts,
                ctx,
                device,
                change,
                now,
                &mut active,
                &mut report,
            )
            .await;
        } else if ctx.pending_no_heartbeat.contains(&device.device_id) {
            open_no_heartbeat(&alerts, ctx, device, now, &mut active, &mut report).await;
        }

        for rule in &rules {
            match ctx
                .scope
                .in_scope(stores.groups.as_ref(), &rule.scope, device, timeout)
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    report.skipped += 1;
                    tracing::warn!(
                        tenant = %tenant_id,
                        device = %device.device_id,
                        rule = rule.rule_id,
                        error = %err,
                        "group scope unresolved; skipping rule"
                    );
                    continue;
                }
            }

            report.evaluations += 1;
            let kind = rule.kind.alert_kind();
            match evaluate(rule, device, &mut ctx.state, now) {
                Decision::Fire { summary, details } => {
                    report.fired += 1;
                    let fp = fingerprint(device.device_id, Some(rule.rule_id), kind);
                    if alerts.is_suppressed(tenant_id, &fp, device, now).await {
                        report.suppressed += 1;
                        continue;
                    }
                    let fire = AlertFire {
                        tenant_id,
                        device_id: device.device_id,
                        rule_id: Some(rule.rule_id),
                        kind,
                        severity: rule.severity,
                        summary: &summary,
                        details: &details,
                        at: now,
                    };
                    match alerts.upsert(&fire).await {
                        Ok(outcome) => {
                            if outcome.was_created {
                                report.created += 1;
                            } else {
                                report.retriggered += 1;
                            }
                            if let Some(active) = active.as_mut() {
                                active.insert(fp);
                            }
                        }
                        Err(err) => {
                            report.write_failures += 1;
                            tracing::warn!(
                                tenant = %tenant_id,
                                device = %device.device_id,
                                rule = rule.rule_id,
                                error = %err,
                                "alert upsert failed"
                            );
                        }
                    }
                }
                Decision::Clear => {
                    let fp = fingerprint(device.device_id, Some(rule.rule_id), kind);
                    if !should_close(&active, &fp) {
                        continue;
                    }
                    close_alert(
                        &alerts,
                        tenant_id,
                        device.device_id,
                        Some(rule.rule_id),
                        kind,
                        now,
                        &mut active,
                        &mut report,
                    )
                    .await;
                }
                Decision::NoFire => {}
                Decision::Skip(reason) => {
                    report.skipped += 1;
                    tracing::debug!(
                        tenant = %tenant_id,
                        device = %device.device_id,
                        rule = rule.rule_id,
                        reason = %reason,
                        "rule skipped"
                    );
                }
            }
        }
    }

    if !report.abandoned {
        let live: HashSet<Uuid> = rollups.iter().map(|device| device.device_id).collect();
        let rule_ids: HashSet<i64> = rules.iter().map(|rule| rule.rule_id).collect();
        ctx.status.retain(&live);
        ctx.pending_no_heartbeat.retain(|device_id| live.contains(device_id));
        ctx.state
            .retain_conditions(|device_id, rule_id| {
                live.contains(&device_id) && rule_ids.contains(&rule_id)
            });
    }
    report.windows_swept = ctx.state.windows.sweep_idle(now);

    tracing::info!(
        tenant = %tenant_id,
        devices = report.devices,
        evaluated = report.devices_evaluated,
        rules = report.rules,
        invalid_rules = report.invalid_rules,
        fired = report.fired,
        created = report.created,
        closed = report.closed,
        suppressed = report.suppressed,
        skipped = report.skipped,
        write_failures = report.write_failures,
        window_keys = ctx.state.windows.len(),
        abandoned = report.abandoned,
        "evaluation cycle complete"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn apply_status_change(
    stores: &Stores,
    alerts: &DeduplicatingAlertStore,
    ctx: &mut EvaluationContext,
    device: &DeviceRollup,
    change: StatusChange,
    now: DateTime<Utc>,
    active: &mut Option<HashSet<String>>,
    report: &mut CycleReport,
) {
    let tenant_id = ctx.tenant_id;
    let timeout = alerts.timeout();
    tracing::info!(
        tenant = %tenant_id,
        device = %device.device_id,
        from = change.from.as_str(),
        to = change.to.as_str(),
        "device status changed"
    );

    if let Err(err) = bounded(
        timeout,
        "device status write",
        stores
            .registry
            .set_device_status(tenant_id, device.device_id, change.to, now),
    )
    .await
    {
        report.write_failures += 1;
        tracing::warn!(
            tenant = %tenant_id,
            device = %device.device_id,
            error = %err,
            "device status write failed"
        );
    }

    if let Some(event) = change.connection_event() {
        let details = json!({
            "from": change.from.as_str(),
            "to": change.to.as_str(),
            "last_seen_at": device.last_seen_at().map(|at| at.to_rfc3339()),
        });
        if let Err(err) = bounded(
            timeout,
            "connection event write",
            stores
                .connectivity
                .log_connection_event(tenant_id, device.device_id, event, &details, now),
        )
        .await
        {
            report.write_failures += 1;
            tracing::warn!(
                tenant = %tenant_id,
                device = %device.device_id,
                event = event.as_str(),
                error = %err,
                "connection event write failed"
            );
        }
    }

    if change.opens_no_heartbeat() {
        open_no_heartbeat(alerts, ctx, device, now, active, report).await;
    }
    if change.closes_no_heartbeat() {
        ctx.pending_no_heartbeat.remove(&device.device_id);
        let fp = fingerprint(device.device_id, None, AlertKind::NoHeartbeat);
        if should_close(active, &fp) {
            close_alert(
                alerts,
                tenant_id,
                device.device_id,
                None,
                AlertKind::NoHeartbeat,
                now,
                active,
                report,
            )
            .await;
        }
    }
}

async fn open_no_heartbeat(
    alerts: &DeduplicatingAlertStore,
    ctx: &mut EvaluationContext,
    device: &DeviceRollup,
    now: DateTime<Utc>,
    active: &mut Option<HashSet<String>>,
    report: &mut CycleReport,
) {
    let tenant_id = ctx.tenant_id;
    let fp = fingerprint(device.device_id, None, AlertKind::NoHeartbeat);
    report.fired += 1;
    if alerts.is_suppressed(tenant_id, &fp, device, now).await {
        report.suppressed += 1;
        // Raised once the suppression lifts, if the device is still stale.
        ctx.pending_no_heartbeat.insert(device.device_id);
        return;
    }

    let last_seen = device.last_seen_at();
    let summary = match last_seen {
        Some(at) => format!(
            "device {} has not reported since {}",
            device.device_id,
            at.to_rfc3339()
        ),
        None => format!("device {} has never reported", device.device_id),
    };
    let details = json!({
        "last_seen_at": last_seen.map(|at| at.to_rfc3339()),
        "last_heartbeat_at": device.last_heartbeat_at.map(|at| at.to_rfc3339()),
        "last_telemetry_at": device.last_telemetry_at.map(|at| at.to_rfc3339()),
    });
    let fire = AlertFire {
        tenant_id,
        device_id: device.device_id,
        rule_id: None,
        kind: AlertKind::NoHeartbeat,
        severity: NO_HEARTBEAT_SEVERITY,
        summary: &summary,
        details: &details,
        at: now,
    };
    match alerts.upsert(&fire).await {
        Ok(outcome) => {
            ctx.pending_no_heartbeat.remove(&device.device_id);
            if outcome.was_created {
                report.created += 1;
            } else {
                report.retriggered += 1;
            }
            if let Some(active) = active.as_mut() {
                active.insert(fp);
            }
        }
        Err(err) => {
            ctx.pending_no_heartbeat.insert(device.device_id);
            report.write_failures += 1;
            tracing::warn!(
                tenant = %tenant_id,
                device = %device.device_id,
                error = %err,
                "no-heartbeat alert upsert failed; retrying next cycle"
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn close_alert(
    alerts: &DeduplicatingAlertStore,
    tenant_id: Uuid,
    device_id: Uuid,
    rule_id: Option<i64>,
    kind: AlertKind,
    now: DateTime<Utc>,
    active: &mut Option<HashSet<String>>,
    report: &mut CycleReport,
) {
    match alerts.close(tenant_id, device_id, rule_id, kind, now).await {
        Ok(closed) => {
            if closed {
                report.closed += 1;
            }
            if let Some(active) = active.as_mut() {
                active.remove(&fingerprint(device_id, rule_id, kind));
            }
        }
        Err(err) => {
            report.write_failures += 1;
            tracing::warn!(
                tenant = %tenant_id,
                device = %device_id,
                rule = ?rule_id,
                error = %err,
                "alert close failed"
            );
        }
    }
}

/// Drives [`run_cycle`] for every tenant on a fixed interval.
pub struct EvaluationLoop {
    stores: Stores,
    settings: EngineSettings,
    contexts: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<EvaluationContext>>>>,
}

impl EvaluationLoop {
    pub fn new(stores: Stores, settings: EngineSettings) -> Self {
        Self {
            stores,
            settings,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::new(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.settings.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = engine.tick().await {
                            tracing::warn!(error = %err, "evaluation tick failed");
                        }
                    }
                }
            }
            tracing::info!("evaluation loop stopped");
        })
    }

    /// Runs one cycle for every active tenant and waits for all of them.
    /// Tenants whose cycle failed are absent from the result.
    pub async fn tick(self: &Arc<Self>) -> Result<Vec<CycleReport>> {
        let tenants = bounded(
            self.settings.store_timeout,
            "tenant discovery",
            self.stores.catalog.fetch_active_tenants(),
        )
        .await?;
        let tenants: Vec<Uuid> = tenants
            .into_iter()
            .filter(|tenant_id| self.settings.allows(tenant_id))
            .collect();

        let contexts: Vec<(Uuid, Arc<tokio::sync::Mutex<EvaluationContext>>)> = {
            let mut guard = self
                .contexts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.retain(|tenant_id, _| tenants.contains(tenant_id));
            tenants
                .iter()
                .map(|tenant_id| {
                    let ctx = guard
                        .entry(*tenant_id)
                        .or_insert_with(|| {
                            Arc::new(tokio::sync::Mutex::new(EvaluationContext::new(
                                *tenant_id,
                                &self.settings,
                            )))
                        })
                        .clone();
                    (*tenant_id, ctx)
                })
                .collect()
        };

        let mut tasks = tokio::task::JoinSet::new();
        for (tenant_id, ctx) in contexts {
            let engine = Arc::clone(self);
            tasks.spawn(async move { engine.run_tenant_cycle(tenant_id, ctx).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "tenant cycle task failed"),
            }
        }
        reports.sort_by_key(|report| report.tenant_id);
        Ok(reports)
    }

    async fn run_tenant_cycle(
        &self,
        tenant_id: Uuid,
        ctx: Arc<tokio::sync::Mutex<EvaluationContext>>,
    ) -> Option<CycleReport> {
        let Ok(mut guard) = ctx.try_lock() else {
            tracing::warn!(tenant = %tenant_id, "previous cycle still running; skipping");
            return None;
        };
        let deadline = Instant::now() + self.settings.cycle_deadline;
        match run_cycle(&self.stores, &self.settings, &mut guard, Utc::now(), deadline).await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(
                    tenant = %tenant_id,
                    error = %err,
                    "tenant cycle aborted; retrying next tick"
                );
                None
            }
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.contexts
            .lock()
            .map(|guard| guard.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}
