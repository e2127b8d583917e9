//! Compensation incidents -- unresolved failures waiting on an operator.
//!
//! When a reversible tool hits a critical failure and compensation was
//! not attempted or did not succeed, the kernel stays operational but the
//! gap in the world must be tracked. Incidents progress strictly forward
//! (`open` to `acknowledged` to `resolved`) and every accessor returns a
//! cloned record. An optional [`IncidentStore`] mirrors rows for
//! operator tooling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::kernel::approval_store::StoreError;
use crate::types::{CompensationIncident, IncidentStatus};

/// Incident lifecycle errors.
#[derive(Debug, Error)]
pub enum IncidentError {
    /// No incident with this id.
    #[error("incident not found: {0}")]
    NotFound(Uuid),
    /// Status may only move forward.
    #[error("incident {id} is '{current}', cannot move to '{requested}'")]
    IllegalTransition {
        /// Incident id.
        id: Uuid,
        /// Current status.
        current: IncidentStatus,
        /// Requested status.
        requested: IncidentStatus,
    },
}

/// Persistence boundary for incident rows.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Insert or replace one incident row.
    async fn upsert(&self, incident: &CompensationIncident) -> Result<(), StoreError>;
}

/// SQLite-backed incident store.
pub struct SqliteIncidentStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteIncidentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIncidentStore").finish()
    }
}

impl SqliteIncidentStore {
    /// Wrap an existing pool and create the table when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS autonomy_incidents (\
               id TEXT PRIMARY KEY,\
               payload TEXT NOT NULL,\
               status TEXT NOT NULL,\
               updated_at TEXT NOT NULL\
             )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl IncidentStore for SqliteIncidentStore {
    async fn upsert(&self, incident: &CompensationIncident) -> Result<(), StoreError> {
        let payload = serde_json::to_string(incident)?;
        sqlx::query(
            "INSERT INTO autonomy_incidents (id, payload, status, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
               payload = excluded.payload, \
               status = excluded.status, \
               updated_at = excluded.updated_at",
        )
        .bind(incident.id.to_string())
        .bind(payload)
        .bind(incident.status.to_string())
        .bind(incident.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Facts needed to open an incident.
#[derive(Debug, Clone)]
pub struct IncidentReport {
    /// Request whose compensation failed.
    pub request_id: String,
    /// Tool with unresolved side effects.
    pub tool_name: String,
    /// Pipeline run the failure belongs to.
    pub correlation_id: String,
    /// Why compensation was needed.
    pub reason: String,
    /// Whether a compensation action ran.
    pub compensation_attempted: bool,
    /// Whether it reported success.
    pub compensation_success: bool,
}

/// Tracker for unresolved compensation failures.
pub struct CompensationIncidentManager {
    incidents: Mutex<HashMap<Uuid, CompensationIncident>>,
    store: Option<Arc<dyn IncidentStore>>,
    bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for CompensationIncidentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationIncidentManager")
            .field("incidents", &self.lock().len())
            .finish()
    }
}

impl CompensationIncidentManager {
    /// Create an in-memory manager.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            incidents: Mutex::new(HashMap::new()),
            store: None,
            bus,
        }
    }

    /// Mirror every incident change to a store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn IncidentStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CompensationIncident>> {
        self.incidents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn persist(&self, incident: &CompensationIncident) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(incident).await {
                warn!(incident_id = %incident.id, error = %e, "failed to persist incident");
            }
        }
    }

    /// Open a new incident and return a clone of the record.
    pub async fn open(&self, report: IncidentReport) -> CompensationIncident {
        let now = Utc::now();
        let incident = CompensationIncident {
            id: Uuid::new_v4(),
            request_id: report.request_id,
            tool_name: report.tool_name,
            correlation_id: report.correlation_id,
            reason: report.reason,
            compensation_attempted: report.compensation_attempted,
            compensation_success: report.compensation_success,
            status: IncidentStatus::Open,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        };

        warn!(
            incident_id = %incident.id,
            tool = %incident.tool_name,
            request_id = %incident.request_id,
            reason = %incident.reason,
            "compensation incident opened"
        );
        self.bus.emit(
            topics::COMPENSATION_INCIDENT_OPENED,
            json!({
                "incidentId": incident.id.to_string(),
                "tool": incident.tool_name,
                "requestId": incident.request_id,
                "status": incident.status.to_string(),
            }),
        );

        self.lock().insert(incident.id, incident.clone());
        self.persist(&incident).await;
        incident
    }

    /// Mark an open incident as acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`IncidentError::NotFound`] for unknown ids and
    /// [`IncidentError::IllegalTransition`] when the incident already
    /// moved past `open`.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        by: impl Into<String>,
    ) -> Result<CompensationIncident, IncidentError> {
        let updated = {
            let mut incidents = self.lock();
            let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
            if incident.status != IncidentStatus::Open {
                return Err(IncidentError::IllegalTransition {
                    id,
                    current: incident.status,
                    requested: IncidentStatus::Acknowledged,
                });
            }
            let now = Utc::now();
            incident.status = IncidentStatus::Acknowledged;
            incident.acknowledged_at = Some(now);
            incident.acknowledged_by = Some(by.into());
            incident.updated_at = now;
            incident.clone()
        };
        info!(incident_id = %id, by = %updated.acknowledged_by.as_deref().unwrap_or("-"), "incident acknowledged");
        self.persist(&updated).await;
        Ok(updated)
    }

    /// Resolve an open or acknowledged incident with a note.
    ///
    /// # Errors
    ///
    /// Returns [`IncidentError::NotFound`] for unknown ids and
    /// [`IncidentError::IllegalTransition`] for already-resolved ones.
    pub async fn resolve(
        &self,
        id: Uuid,
        by: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<CompensationIncident, IncidentError> {
        let updated = {
            let mut incidents = self.lock();
            let incident = incidents.get_mut(&id).ok_or(IncidentError::NotFound(id))?;
            if incident.status == IncidentStatus::Resolved {
                return Err(IncidentError::IllegalTransition {
                    id,
                    current: incident.status,
                    requested: IncidentStatus::Resolved,
                });
            }
            let now = Utc::now();
            incident.status = IncidentStatus::Resolved;
            incident.resolved_at = Some(now);
            incident.resolved_by = Some(by.into());
            incident.resolution_note = Some(note.into());
            incident.updated_at = now;
            incident.clone()
        };
        info!(incident_id = %id, "incident resolved");
        self.persist(&updated).await;
        Ok(updated)
    }

    /// Clone of one incident.
    pub fn get(&self, id: Uuid) -> Option<CompensationIncident> {
        self.lock().get(&id).cloned()
    }

    /// Clones of all incidents still open or acknowledged, oldest first.
    pub fn unresolved(&self) -> Vec<CompensationIncident> {
        let mut list: Vec<CompensationIncident> = self
            .lock()
            .values()
            .filter(|i| i.status != IncidentStatus::Resolved)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.created_at);
        list
    }

    /// Total incidents tracked (any status).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no incidents are tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
