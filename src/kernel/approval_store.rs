//! Persistent approval gate -- decisions survive kernel restarts.
//!
//! Pending approvals are mirrored to an [`ApprovalStore`]; on startup,
//! [`PersistentApprovalGate::hydrate_pending`] re-arms every row whose
//! decision is still NULL and whose TTL has not elapsed. Store I/O
//! failures never break the in-memory gate: the kernel degrades to
//! volatile semantics and logs a warning.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::approval::{ApprovalGate, ApprovalRouting, PendingApproval};
use crate::types::{ApprovalDecision, ApprovalRequest, ProposedToolCall, RiskClass};

/// Approval persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),
    /// Row contents did not deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// One persisted approval row.
#[derive(Debug, Clone)]
pub struct ApprovalRow {
    /// Request ID.
    pub id: Uuid,
    /// Tool the call targets.
    pub tool_name: String,
    /// Risk class at request time.
    pub risk_class: RiskClass,
    /// Full serialized call.
    pub call: ProposedToolCall,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// When the request auto-expires.
    pub expires_at: DateTime<Utc>,
    /// NULL while pending.
    pub decision: Option<ApprovalDecision>,
    /// Who decided.
    pub decided_by: Option<String>,
    /// When the decision landed.
    pub decided_at: Option<DateTime<Utc>>,
}

/// Persistence boundary for the approval gate.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a pending row; a duplicate id is a no-op.
    async fn insert_pending(&self, request: &ApprovalRequest) -> Result<(), StoreError>;

    /// Record a decision for a row that is still pending.
    ///
    /// Returns true when a row was updated; false when the id is unknown
    /// or already decided. An unknown id is inserted as an already-decided
    /// row so out-of-band decisions leave a trace.
    async fn record_decision(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Rows with `decision IS NULL AND expires_at > now`.
    async fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// One row by id, decided or not.
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRow>, StoreError>;
}

/// Fixed-width UTC timestamp so lexicographic TEXT comparison in SQL
/// matches chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{s}': {e}")))
}

/// Row tuple returned by SQLite queries for approvals.
type ApprovalRowTuple = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// SQLite-backed approval store.
pub struct SqliteApprovalStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteApprovalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteApprovalStore").finish()
    }
}

impl SqliteApprovalStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database and create the approvals table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the connection or schema
    /// creation fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the approvals table when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS autonomy_approvals (\
               id TEXT PRIMARY KEY,\
               tool_name TEXT NOT NULL,\
               risk_class TEXT NOT NULL,\
               call_payload TEXT NOT NULL,\
               created_at TEXT NOT NULL,\
               expires_at TEXT NOT NULL,\
               decision TEXT NULL,\
               decided_by TEXT NULL,\
               decided_at TEXT NULL\
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_from_tuple(row: ApprovalRowTuple) -> Result<ApprovalRow, StoreError> {
        let (id, tool_name, risk, payload, created, expires, decision, decided_by, decided_at) =
            row;
        Ok(ApprovalRow {
            id: Uuid::from_str(&id)
                .map_err(|e| StoreError::Serialization(format!("bad uuid '{id}': {e}")))?,
            tool_name,
            risk_class: RiskClass::from_str(&risk)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            call: serde_json::from_str(&payload)?,
            created_at: parse_ts(&created)?,
            expires_at: parse_ts(&expires)?,
            decision: decision
                .as_deref()
                .map(ApprovalDecision::from_str)
                .transpose()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            decided_by,
            decided_at: decided_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn insert_pending(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&request.call)?;
        sqlx::query(
            "INSERT INTO autonomy_approvals \
             (id, tool_name, risk_class, call_payload, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(request.id.to_string())
        .bind(&request.call.tool)
        .bind(request.risk_class.to_string())
        .bind(payload)
        .bind(fmt_ts(request.created_at))
        .bind(fmt_ts(request.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_decision(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE autonomy_approvals \
             SET decision = ?2, decided_by = ?3, decided_at = ?4 \
             WHERE id = ?1 AND decision IS NULL",
        )
        .bind(id.to_string())
        .bind(decision.to_string())
        .bind(decided_by)
        .bind(fmt_ts(decided_at))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(true);
        }

        // Unknown id: keep a trace of the out-of-band decision.
        sqlx::query(
            "INSERT INTO autonomy_approvals \
             (id, tool_name, risk_class, call_payload, created_at, expires_at, \
              decision, decided_by, decided_at) \
             VALUES (?1, 'unknown', 'read-only', '{}', ?2, ?2, ?3, ?4, ?2) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(fmt_ts(decided_at))
        .bind(decision.to_string())
        .bind(decided_by)
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    async fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows: Vec<ApprovalRowTuple> = sqlx::query_as(
            "SELECT id, tool_name, risk_class, call_payload, created_at, expires_at, \
                    decision, decided_by, decided_at \
             FROM autonomy_approvals \
             WHERE decision IS NULL AND expires_at > ?1 \
             ORDER BY created_at",
        )
        .bind(fmt_ts(now))
        .fetch_all(&self.pool)
        .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let row = Self::row_from_tuple(row)?;
            requests.push(ApprovalRequest {
                id: row.id,
                call: row.call,
                risk_class: row.risk_class,
                created_at: row.created_at,
                expires_at: row.expires_at,
            });
        }
        Ok(requests)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRow>, StoreError> {
        let row: Option<ApprovalRowTuple> = sqlx::query_as(
            "SELECT id, tool_name, risk_class, call_payload, created_at, expires_at, \
                    decision, decided_by, decided_at \
             FROM autonomy_approvals WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_from_tuple).transpose()
    }
}

/// Approval gate that mirrors every request and decision to a store.
pub struct PersistentApprovalGate {
    gate: ApprovalGate,
    store: Arc<dyn ApprovalStore>,
}

impl std::fmt::Debug for PersistentApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentApprovalGate")
            .field("gate", &self.gate)
            .finish()
    }
}

impl PersistentApprovalGate {
    /// Wrap an in-memory gate with a persistence mirror.
    pub fn new(gate: ApprovalGate, store: Arc<dyn ApprovalStore>) -> Self {
        Self { gate, store }
    }

    /// Re-populate the pending set from rows that survived a restart.
    ///
    /// Each hydrated request gets a timer for its remaining TTL. Returns
    /// the number of hydrated requests; store failures hydrate nothing.
    pub async fn hydrate_pending(&self) -> usize {
        let rows = match self.store.load_pending(Utc::now()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "approval hydration failed, starting empty");
                return 0;
            }
        };
        let count = rows.len();
        for request in rows {
            // Nobody awaits a hydrated request; drop the receiver and let
            // operators resolve (or the timer expire) it.
            let _pending = self.gate.insert_pending(request);
        }
        if count > 0 {
            info!(count, "hydrated pending approvals from store");
        }
        count
    }

    /// Resolve a request in memory and in the store.
    ///
    /// Unknown ids still persist the decision, so out-of-band resolutions
    /// (e.g. an operator deciding through a different replica) are
    /// recorded. Returns whether an in-memory waiter was resolved.
    pub async fn resolve(
        &self,
        id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<&str>,
    ) -> bool {
        let resolved = self.gate.resolve(id, decision, decided_by);
        if let Err(e) = self
            .store
            .record_decision(id, decision, decided_by, Utc::now())
            .await
        {
            warn!(approval_id = %id, error = %e, "failed to persist approval decision");
        }
        resolved
    }

    /// All requests currently pending in memory.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.gate.pending()
    }

    /// One pending request by id.
    pub fn pending_by_id(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.gate.pending_by_id(id)
    }

    /// Drop every pending request.
    pub fn dispose(&self) {
        self.gate.dispose();
    }
}

#[async_trait]
impl ApprovalRouting for PersistentApprovalGate {
    async fn request_approval(&self, call: &ProposedToolCall, risk: RiskClass) -> PendingApproval {
        let pending = self.gate.request_approval(call, risk).await;
        if let Some(request) = self.gate.pending_by_id(pending.id) {
            if let Err(e) = self.store.insert_pending(&request).await {
                warn!(
                    approval_id = %pending.id,
                    error = %e,
                    "failed to persist approval request, in-memory only"
                );
            }
        }
        pending
    }

    fn pending_count(&self) -> usize {
        self.gate.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NullBus;
    use crate::types::CallSource;
    use serde_json::json;
    use std::time::Duration;

    async fn store() -> Arc<SqliteApprovalStore> {
        Arc::new(
            SqliteApprovalStore::connect("sqlite::memory:")
                .await
                .expect("in-memory store"),
        )
    }

    fn test_call() -> ProposedToolCall {
        ProposedToolCall::new(
            "RUN_IN_TERMINAL",
            json!({"command": "rm -rf ./scratch"}),
            CallSource::Llm,
            "req-7",
        )
    }

    fn persistent_gate(store: Arc<SqliteApprovalStore>, secs: u64) -> PersistentApprovalGate {
        PersistentApprovalGate::new(
            ApprovalGate::new(Duration::from_secs(secs), Arc::new(NullBus)),
            store,
        )
    }

    // ── Store primitives ──

    #[tokio::test]
    async fn test_insert_and_load_pending() {
        let store = store().await;
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            call: test_call(),
            risk_class: RiskClass::Irreversible,
            created_at: now,
            expires_at: now.checked_add_signed(chrono::TimeDelta::seconds(300)).expect("ttl add"),
        };
        store.insert_pending(&request).await.expect("insert");

        let pending = store.load_pending(now).await.expect("load");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
        assert_eq!(pending[0].call.tool, "RUN_IN_TERMINAL");
    }

    #[tokio::test]
    async fn test_insert_duplicate_is_noop() {
        let store = store().await;
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            call: test_call(),
            risk_class: RiskClass::Irreversible,
            created_at: now,
            expires_at: now.checked_add_signed(chrono::TimeDelta::seconds(300)).expect("ttl add"),
        };
        store.insert_pending(&request).await.expect("first");
        store.insert_pending(&request).await.expect("second");
        assert_eq!(store.load_pending(now).await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_rows_not_hydrated() {
        let store = store().await;
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            call: test_call(),
            risk_class: RiskClass::Irreversible,
            created_at: now.checked_sub_signed(chrono::TimeDelta::seconds(600)).expect("ttl sub"),
            expires_at: now.checked_sub_signed(chrono::TimeDelta::seconds(300)).expect("ttl sub"),
        };
        store.insert_pending(&request).await.expect("insert");
        assert!(store.load_pending(now).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_record_decision_single_update() {
        let store = store().await;
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            call: test_call(),
            risk_class: RiskClass::Irreversible,
            created_at: now,
            expires_at: now.checked_add_signed(chrono::TimeDelta::seconds(300)).expect("ttl add"),
        };
        store.insert_pending(&request).await.expect("insert");

        let first = store
            .record_decision(request.id, ApprovalDecision::Denied, Some("alice"), now)
            .await
            .expect("decide");
        assert!(first, "first decision updates the row");

        let second = store
            .record_decision(request.id, ApprovalDecision::Approved, Some("bob"), now)
            .await
            .expect("decide again");
        assert!(!second, "decided rows are not updated again");

        let row = store.get(request.id).await.expect("get").expect("row");
        assert_eq!(row.decision, Some(ApprovalDecision::Denied));
        assert_eq!(row.decided_by.as_deref(), Some("alice"));

        // Decided rows never rehydrate.
        assert!(store.load_pending(now).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_out_of_band_decision_recorded() {
        let store = store().await;
        let ghost = Uuid::new_v4();
        let updated = store
            .record_decision(ghost, ApprovalDecision::Approved, Some("ops"), Utc::now())
            .await
            .expect("record");
        assert!(!updated, "no pending row matched");

        let row = store.get(ghost).await.expect("get").expect("trace row");
        assert_eq!(row.decision, Some(ApprovalDecision::Approved));
        assert_eq!(row.decided_by.as_deref(), Some("ops"));
    }

    // ── Persistent gate ──

    #[tokio::test]
    async fn test_request_persists_and_resolve_updates() {
        let store = store().await;
        let gate = persistent_gate(store.clone(), 300);

        let pending = gate
            .request_approval(&test_call(), RiskClass::Irreversible)
            .await;
        let row = store.get(pending.id).await.expect("get").expect("row");
        assert_eq!(row.decision, None, "pending rows have NULL decision");

        assert!(
            gate.resolve(pending.id, ApprovalDecision::Approved, Some("alice"))
                .await
        );
        let row = store.get(pending.id).await.expect("get").expect("row");
        assert_eq!(row.decision, Some(ApprovalDecision::Approved));

        let outcome = pending.receiver.await.expect("decision");
        assert_eq!(outcome.decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn test_hydration_restores_pending() {
        let store = store().await;

        // First "process": request approval, then crash (drop the gate).
        {
            let gate = persistent_gate(store.clone(), 300);
            let _pending = gate
                .request_approval(&test_call(), RiskClass::Irreversible)
                .await;
        }

        // Second "process": hydrate and find the request again.
        let gate = persistent_gate(store.clone(), 300);
        assert_eq!(gate.pending_count(), 0);
        let hydrated = gate.hydrate_pending().await;
        assert_eq!(hydrated, 1);
        assert_eq!(gate.pending_count(), 1);

        let request = gate.pending().pop().expect("hydrated request");
        assert_eq!(request.call.tool, "RUN_IN_TERMINAL");

        // The hydrated request can still be resolved.
        assert!(
            gate.resolve(request.id, ApprovalDecision::Denied, Some("ops"))
                .await
        );
        assert_eq!(gate.pending_count(), 0);
    }
}
