//! System-state controller.
//!
//! One row per component. Status changes are atomic read-compute-write
//! transactions that accrue uptime and leave an audit trail in
//! `system_events`. The emergency stop flips matching components to
//! `stopped`; while any component is stopped this way, every mutating
//! surface in the core refuses writes until `clear_emergency`.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ids::TraceId;
use crate::store::{ts_from_sql, ts_to_sql, Store};

/// Well-known component identifiers.
pub const COMPONENT_STORE: &str = "store";
pub const COMPONENT_LEDGER_WRITER: &str = "ledger_writer";
pub const COMPONENT_TRIGGER_MONITOR: &str = "trigger_monitor";
pub const COMPONENT_APPROVAL_MANAGER: &str = "approval_manager";
pub const COMPONENT_KEYSTORE: &str = "keystore";
pub const COMPONENT_SAFETY: &str = "safety_controls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Starting,
    Running,
    Degraded,
    Stopped,
    Error,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::Running => "running",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Stopped => "stopped",
            ComponentStatus::Error => "error",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ComponentStatus::Starting),
            "running" => Ok(ComponentStatus::Running),
            "degraded" => Ok(ComponentStatus::Degraded),
            "stopped" => Ok(ComponentStatus::Stopped),
            "error" => Ok(ComponentStatus::Error),
            other => Err(CoreError::InputInvalid(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub state_id: String,
    pub status: ComponentStatus,
    pub is_emergency_stopped: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub restart_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleComponent {
    pub state_id: String,
    pub heartbeat_age_seconds: i64,
    pub timeout_seconds: i64,
}

#[derive(Clone)]
pub struct SystemStateController {
    store: Store,
    timeouts: HashMap<&'static str, i64>,
}

fn conversion_err(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SystemState> {
    let status: String = row.get(1)?;
    let heartbeat: Option<String> = row.get(3)?;
    let changed: String = row.get(4)?;
    let updated: String = row.get(9)?;
    Ok(SystemState {
        state_id: row.get(0)?,
        status: status.parse().map_err(conversion_err)?,
        is_emergency_stopped: row.get::<_, i64>(2)? != 0,
        last_heartbeat_at: heartbeat
            .map(|s| ts_from_sql(&s).map_err(conversion_err))
            .transpose()?,
        state_changed_at: ts_from_sql(&changed).map_err(conversion_err)?,
        uptime_seconds: row.get(5)?,
        restart_count: row.get(6)?,
        error_count: row.get(7)?,
        last_error: row.get(8)?,
        updated_at: ts_from_sql(&updated).map_err(conversion_err)?,
    })
}

const STATE_COLUMNS: &str = "state_id, status, is_emergency_stopped, last_heartbeat_at, \
     state_changed_at, uptime_seconds, restart_count, error_count, last_error, updated_at";

impl SystemStateController {
    pub fn new(store: Store) -> Self {
        // Per-component heartbeat timeouts in seconds; engines tolerate
        // longer gaps than the store and safety layers.
        let timeouts = HashMap::from([
            (COMPONENT_STORE, 30i64),
            (COMPONENT_SAFETY, 60),
            (COMPONENT_LEDGER_WRITER, 60),
            (COMPONENT_KEYSTORE, 120),
            (COMPONENT_TRIGGER_MONITOR, 120),
            (COMPONENT_APPROVAL_MANAGER, 300),
        ]);
        SystemStateController { store, timeouts }
    }

    /// Atomic status transition with uptime accrual and an audit event.
    pub async fn set_status(
        &self,
        state_id: &str,
        status: ComponentStatus,
        trace_id: Option<TraceId>,
    ) -> CoreResult<SystemState> {
        let id = state_id.to_string();
        let state = self
            .store
            .with_tx(move |tx| {
                let now = Utc::now();
                let existing: Option<SystemState> = {
                    let sql =
                        format!("SELECT {STATE_COLUMNS} FROM system_states WHERE state_id = ?1");
                    let mut stmt = tx.prepare_cached(&sql)?;
                    stmt.query_row(params![id], row_to_state)
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?
                };

                let old_status = existing.as_ref().map(|s| s.status);
                match &existing {
                    Some(old) => {
                        let mut uptime = old.uptime_seconds;
                        if old.status == ComponentStatus::Running {
                            uptime += (now - old.state_changed_at).num_seconds().max(0);
                        }
                        let restart_bump =
                            i64::from(status == ComponentStatus::Starting && old.status != status);
                        tx.execute(
                            "UPDATE system_states SET status = ?1, state_changed_at = ?2, \
                             uptime_seconds = ?3, restart_count = restart_count + ?4, \
                             updated_at = ?2 WHERE state_id = ?5",
                            params![
                                status.as_str(),
                                ts_to_sql(now),
                                uptime,
                                restart_bump,
                                id
                            ],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO system_states (state_id, status, state_changed_at, \
                             updated_at) VALUES (?1, ?2, ?3, ?3)",
                            params![id, status.as_str(), ts_to_sql(now)],
                        )?;
                    }
                }

                record_event_tx(
                    tx,
                    "status_change",
                    EventSeverity::Info,
                    Some(&id),
                    &format!("{id} -> {status}"),
                    &format!(
                        "component {id} moved from {} to {status}",
                        old_status.map(|s| s.as_str()).unwrap_or("(new)")
                    ),
                    Some(serde_json::json!({
                        "old": old_status.map(|s| s.as_str()),
                        "new": status.as_str(),
                    })),
                    trace_id,
                )?;

                let sql = format!("SELECT {STATE_COLUMNS} FROM system_states WHERE state_id = ?1");
                let mut stmt = tx.prepare_cached(&sql)?;
                Ok(stmt.query_row(params![id], row_to_state)?)
            })
            .await?;
        Ok(state)
    }

    /// Touch a component's heartbeat, creating the row if needed.
    pub async fn heartbeat(&self, state_id: &str, health_data: Option<Value>) -> CoreResult<()> {
        let id = state_id.to_string();
        self.store
            .with_tx(move |tx| {
                let now = ts_to_sql(Utc::now());
                let updated = tx.execute(
                    "UPDATE system_states SET last_heartbeat_at = ?1, updated_at = ?1, \
                     health_data = COALESCE(?2, health_data) WHERE state_id = ?3",
                    params![now, health_data.as_ref().map(|v| v.to_string()), id],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO system_states (state_id, status, last_heartbeat_at, \
                         state_changed_at, updated_at, health_data) \
                         VALUES (?1, 'starting', ?2, ?2, ?2, ?3)",
                        params![id, now, health_data.as_ref().map(|v| v.to_string())],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Record a component failure without forcing a status change.
    pub async fn record_error(&self, state_id: &str, error: &str) -> CoreResult<()> {
        let id = state_id.to_string();
        let message = error.to_string();
        self.store
            .with_tx(move |tx| {
                let now = ts_to_sql(Utc::now());
                let updated = tx.execute(
                    "UPDATE system_states SET error_count = error_count + 1, last_error = ?1, \
                     updated_at = ?2 WHERE state_id = ?3",
                    params![message, now, id],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO system_states (state_id, status, state_changed_at, \
                         updated_at, error_count, last_error) \
                         VALUES (?1, 'error', ?2, ?2, 1, ?3)",
                        params![id, now, message],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Components whose heartbeat age exceeds their timeout.
    pub async fn check_stale_components(&self) -> CoreResult<Vec<StaleComponent>> {
        let timeouts = self.timeouts.clone();
        let states = self.status_overview().await?;
        let now = Utc::now();
        let mut stale = Vec::new();
        for state in states {
            if state.is_emergency_stopped {
                continue;
            }
            let Some(heartbeat) = state.last_heartbeat_at else {
                continue;
            };
            let age = (now - heartbeat).num_seconds();
            let timeout = timeouts
                .get(state.state_id.as_str())
                .copied()
                .unwrap_or(300);
            if age > timeout {
                stale.push(StaleComponent {
                    state_id: state.state_id,
                    heartbeat_age_seconds: age,
                    timeout_seconds: timeout,
                });
            }
        }
        Ok(stale)
    }

    /// Flip matching components into emergency stop. Returns affected ids.
    pub async fn trip_emergency(
        &self,
        filter: Option<Vec<String>>,
        reason: &str,
        initiated_by: &str,
    ) -> CoreResult<Vec<String>> {
        let reason = reason.to_string();
        let initiated_by = initiated_by.to_string();
        let affected = self
            .store
            .with_tx(move |tx| {
                let now = ts_to_sql(Utc::now());
                let ids: Vec<String> = match &filter {
                    Some(ids) if !ids.is_empty() => ids.clone(),
                    _ => {
                        let mut stmt =
                            tx.prepare_cached("SELECT state_id FROM system_states")?;
                        let ids = stmt
                            .query_map([], |row| row.get(0))?
                            .collect::<Result<_, _>>()?;
                        ids
                    }
                };

                let mut affected = Vec::new();
                for id in &ids {
                    let changed = tx.execute(
                        "UPDATE system_states SET is_emergency_stopped = 1, status = 'stopped', \
                         state_changed_at = ?1, updated_at = ?1 WHERE state_id = ?2",
                        params![now, id],
                    )?;
                    if changed == 0 {
                        // Component named in the filter but never registered:
                        // create it stopped so the gate still holds.
                        tx.execute(
                            "INSERT INTO system_states (state_id, status, is_emergency_stopped, \
                             state_changed_at, updated_at) VALUES (?1, 'stopped', 1, ?2, ?2)",
                            params![id, now],
                        )?;
                    }
                    affected.push(id.clone());
                    record_event_tx(
                        tx,
                        "emergency_stop",
                        EventSeverity::Critical,
                        Some(id),
                        &format!("emergency stop: {reason}"),
                        &format!("component {id} emergency stopped by {initiated_by}"),
                        None,
                        None,
                    )?;
                }

                tx.execute(
                    "INSERT INTO emergency_actions (action_type, components, reason, \
                     initiated_by, created_at) VALUES ('emergency_stop', ?1, ?2, ?3, ?4)",
                    params![affected.join(","), reason, initiated_by, now],
                )?;
                Ok(affected)
            })
            .await?;

        warn!(components = affected.len(), "emergency stop activated");
        Ok(affected)
    }

    /// The sole path that re-enables writes after an emergency stop.
    pub async fn clear_emergency(
        &self,
        filter: Option<Vec<String>>,
        cleared_by: &str,
    ) -> CoreResult<Vec<String>> {
        let cleared_by = cleared_by.to_string();
        let cleared = self
            .store
            .with_tx(move |tx| {
                let now = ts_to_sql(Utc::now());
                let ids: Vec<String> = {
                    let (sql, args): (String, Vec<String>) = match &filter {
                        Some(ids) if !ids.is_empty() => {
                            let placeholders = (1..=ids.len())
                                .map(|i| format!("?{i}"))
                                .collect::<Vec<_>>()
                                .join(", ");
                            (
                                format!(
                                    "SELECT state_id FROM system_states \
                                     WHERE is_emergency_stopped = 1 AND state_id IN ({placeholders})"
                                ),
                                ids.clone(),
                            )
                        }
                        _ => (
                            "SELECT state_id FROM system_states WHERE is_emergency_stopped = 1"
                                .to_string(),
                            Vec::new(),
                        ),
                    };
                    let mut stmt = tx.prepare_cached(&sql)?;
                    let ids = stmt
                        .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get(0))?
                        .collect::<Result<_, _>>()?;
                    ids
                };

                for id in &ids {
                    tx.execute(
                        "UPDATE system_states SET is_emergency_stopped = 0, status = 'running', \
                         state_changed_at = ?1, updated_at = ?1 WHERE state_id = ?2",
                        params![now, id],
                    )?;
                    record_event_tx(
                        tx,
                        "emergency_cleared",
                        EventSeverity::Warning,
                        Some(id),
                        "emergency stop cleared",
                        &format!("component {id} re-enabled by {cleared_by}"),
                        None,
                        None,
                    )?;
                }
                tx.execute(
                    "INSERT INTO emergency_actions (action_type, components, reason, \
                     initiated_by, created_at) VALUES ('emergency_clear', ?1, '', ?2, ?3)",
                    params![ids.join(","), cleared_by, now],
                )?;
                Ok(ids)
            })
            .await?;

        info!(components = cleared.len(), "emergency stop cleared");
        Ok(cleared)
    }

    /// True while any component is emergency-stopped. Guards every mutating
    /// surface: ledger writes, trigger transitions, approvals, signing.
    pub async fn any_emergency_stopped(&self) -> CoreResult<bool> {
        self.store
            .with_conn(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM system_states WHERE is_emergency_stopped = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn status_overview(&self) -> CoreResult<Vec<SystemState>> {
        self.store
            .with_conn(|conn| {
                let sql =
                    format!("SELECT {STATE_COLUMNS} FROM system_states ORDER BY state_id ASC");
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt.query_map([], row_to_state)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Append an audit event.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_event(
        &self,
        event_type: &str,
        severity: EventSeverity,
        component: Option<&str>,
        title: &str,
        message: &str,
        payload: Option<Value>,
        trace_id: Option<TraceId>,
    ) -> CoreResult<()> {
        let event_type = event_type.to_string();
        let component = component.map(str::to_string);
        let title = title.to_string();
        let message = message.to_string();
        self.store
            .with_tx(move |tx| {
                record_event_tx(
                    tx,
                    &event_type,
                    severity,
                    component.as_deref(),
                    &title,
                    &message,
                    payload,
                    trace_id,
                )
            })
            .await
    }

    /// Recent events of one type, newest first.
    pub async fn events_of_type(&self, event_type: &str, limit: usize) -> CoreResult<Vec<(String, String)>> {
        let event_type = event_type.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT title, message FROM system_events WHERE event_type = ?1 \
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![event_type, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn record_event_tx(
    tx: &rusqlite::Transaction,
    event_type: &str,
    severity: EventSeverity,
    component: Option<&str>,
    title: &str,
    message: &str,
    payload: Option<Value>,
    trace_id: Option<TraceId>,
) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO system_events (event_type, severity, component, title, message, payload, \
         trace_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event_type,
            severity.as_str(),
            component,
            title,
            message,
            payload.map(|v| v.to_string()),
            trace_id.map(|t| t.to_string()),
            ts_to_sql(Utc::now()),
        ],
    )?;
    Ok(())
}
