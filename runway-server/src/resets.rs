//! Preview database reset/seed coordinator.
//!
//! Puts a slot's dedicated preview database into a deterministic state before
//! a run starts editing, and records provenance for every attempt: applied,
//! rejected, failed, or dry-run. The slot→database contract is checked before
//! any driver call; a reset can never touch a database outside the
//! `app_preview_` namespace, least of all the control-plane store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info};

use runway_core::{assert_preview_slot_database, normalize_slot_id, slot_number};

use crate::config::Config;
use crate::drivers::DbResetDriver;
use crate::error::ApiError;
use crate::observability;
use crate::runs::get_run_or_not_found;
use crate::store::{AppendRunEvent, ControlStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    Seed,
    Snapshot,
}

impl ResetStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStrategy::Seed => "seed",
            ResetStrategy::Snapshot => "snapshot",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw {
            "seed" => Ok(ResetStrategy::Seed),
            "snapshot" => Ok(ResetStrategy::Snapshot),
            other => Err(ApiError::validation(format!(
                "unknown reset strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResetRequest {
    pub run_id: String,
    pub slot_id: String,
    pub strategy: ResetStrategy,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub reset_id: i64,
    pub run_id: String,
    pub slot_id: String,
    pub db_name: String,
    pub strategy: &'static str,
    pub reset_status: String,
    pub details: Value,
}

pub struct ResetCoordinator {
    store: Arc<ControlStore>,
    config: Arc<Config>,
    driver: Arc<dyn DbResetDriver>,
}

impl ResetCoordinator {
    pub fn new(
        store: Arc<ControlStore>,
        config: Arc<Config>,
        driver: Arc<dyn DbResetDriver>,
    ) -> Self {
        Self {
            store,
            config,
            driver,
        }
    }

    /// Reset and seed (or snapshot) the slot's preview database.
    ///
    /// Always persists a `PreviewDbReset` row and emits a
    /// `preview_db_reset_<status>` event, whatever happens. Rejections
    /// (unsafe target, missing version) happen before any SQL; driver
    /// failures leave the database wherever Postgres got to and are
    /// surfaced as `driver_failed`.
    pub async fn reset_and_seed(&self, request: &ResetRequest) -> Result<ResetOutcome, ApiError> {
        let slot_id = normalize_slot_id(&request.slot_id)?;
        if !self.config.slot_ids.contains(&slot_id) {
            return Err(ApiError::validation(format!(
                "slot '{}' is not in the configured pool",
                request.slot_id
            )));
        }
        self.store
            .with_tx(|tx| get_run_or_not_found(tx, &request.run_id).map(drop))?;

        let started_at = Utc::now();
        let number = slot_number(&slot_id)?;
        let db_name = self.config.preview_db_name(number);

        // The hard safety gate. Nothing below runs unless the configured
        // template resolves to exactly this slot's preview database.
        if let Err(contract_err) = assert_preview_slot_database(&slot_id, &db_name) {
            let details = json!({ "error": contract_err.to_string() });
            let reset_id = self.record(
                request,
                &slot_id,
                &db_name,
                "rejected",
                &details,
                started_at,
            )?;
            error!(
                run_id = %request.run_id,
                slot_id = %slot_id,
                db_name = %db_name,
                "preview DB reset rejected: {contract_err}"
            );
            return Err(ApiError::unsafe_database_target(format!(
                "reset {} rejected: {}",
                reset_id, contract_err
            )));
        }

        let sql_path = match self.resolve_source(request) {
            Ok(path) => path,
            Err(validation_err) => {
                let details = json!({ "error": validation_err.reason });
                self.record(request, &slot_id, &db_name, "rejected", &details, started_at)?;
                return Err(validation_err);
            }
        };

        if request.dry_run {
            let details = json!({
                "dry_run": true,
                "resolved_sql_path": sql_path.display().to_string(),
            });
            let reset_id = self.record(
                request,
                &slot_id,
                &db_name,
                "dry_run",
                &details,
                started_at,
            )?;
            return Ok(ResetOutcome {
                reset_id,
                run_id: request.run_id.clone(),
                slot_id,
                db_name,
                strategy: request.strategy.as_str(),
                reset_status: "dry_run".to_string(),
                details,
            });
        }

        let mut steps: Vec<Value> = Vec::new();

        if request.strategy == ResetStrategy::Seed {
            match self.driver.drop_and_recreate_public_schema(&db_name).await {
                Ok(()) => steps.push(json!({ "name": "drop_and_recreate_public_schema", "ok": true })),
                Err(err) => {
                    steps.push(json!({
                        "name": "drop_and_recreate_public_schema",
                        "ok": false,
                        "error": err.detail(),
                    }));
                    return self.fail(request, &slot_id, &db_name, steps, started_at, err);
                }
            }
        }

        match self.driver.apply_sql(&db_name, &sql_path).await {
            Ok(()) => steps.push(json!({
                "name": "apply_sql",
                "ok": true,
                "sql_path": sql_path.display().to_string(),
            })),
            Err(err) => {
                steps.push(json!({
                    "name": "apply_sql",
                    "ok": false,
                    "sql_path": sql_path.display().to_string(),
                    "error": err.detail(),
                }));
                return self.fail(request, &slot_id, &db_name, steps, started_at, err);
            }
        }

        let details = json!({ "steps": steps });
        let reset_id = self.record(request, &slot_id, &db_name, "applied", &details, started_at)?;
        info!(
            run_id = %request.run_id,
            slot_id = %slot_id,
            db_name = %db_name,
            strategy = request.strategy.as_str(),
            "preview DB reset applied"
        );

        Ok(ResetOutcome {
            reset_id,
            run_id: request.run_id.clone(),
            slot_id,
            db_name,
            strategy: request.strategy.as_str(),
            reset_status: "applied".to_string(),
            details,
        })
    }

    /// Reset attempts recorded for a run, oldest first.
    pub fn list_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<crate::store::PreviewDbResetRow>, ApiError> {
        self.store
            .with_tx(|tx| Ok(tx.list_preview_db_resets_for_run(run_id)?))
    }

    fn resolve_source(&self, request: &ResetRequest) -> Result<PathBuf, ApiError> {
        match request.strategy {
            ResetStrategy::Seed => {
                let version = request.seed_version.as_deref().ok_or_else(|| {
                    ApiError::validation("seed strategy requires seed_version")
                })?;
                Ok(self.config.seed_file_path(version))
            }
            ResetStrategy::Snapshot => {
                let version = request.snapshot_version.as_deref().ok_or_else(|| {
                    ApiError::validation("snapshot strategy requires snapshot_version")
                })?;
                Ok(self.config.snapshot_file_path(version))
            }
        }
    }

    fn fail(
        &self,
        request: &ResetRequest,
        slot_id: &str,
        db_name: &str,
        steps: Vec<Value>,
        started_at: chrono::DateTime<Utc>,
        err: crate::drivers::DriverError,
    ) -> Result<ResetOutcome, ApiError> {
        let details = json!({ "steps": steps, "error": err.detail() });
        let reset_id = self.record(request, slot_id, db_name, "failed", &details, started_at)?;
        error!(
            run_id = %request.run_id,
            slot_id,
            db_name,
            "preview DB reset failed: {err}"
        );
        if err.is_timeout() {
            Err(ApiError::timeout(format!("reset {} timed out: {}", reset_id, err.detail())))
        } else {
            Err(ApiError::driver_failed(format!(
                "reset {} failed: {}",
                reset_id,
                err.detail()
            )))
        }
    }

    /// Persist the provenance row and its event in one transaction.
    fn record(
        &self,
        request: &ResetRequest,
        slot_id: &str,
        db_name: &str,
        reset_status: &str,
        details: &Value,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<i64, ApiError> {
        let trace_id = observability::current_trace_id();
        self.store.with_tx(|tx| {
            let completed_at = Utc::now();
            let reset_id = tx.insert_preview_db_reset(
                &request.run_id,
                slot_id,
                db_name,
                request.strategy.as_str(),
                request.seed_version.as_deref(),
                request.snapshot_version.as_deref(),
                reset_status,
                details,
                started_at,
                Some(completed_at),
            )?;
            tx.append_run_event(
                AppendRunEvent::new(&request.run_id, &format!("preview_db_reset_{reset_status}"))
                    .payload(json!({
                        "reset_id": reset_id,
                        "slot_id": slot_id,
                        "db_name": db_name,
                        "strategy": request.strategy.as_str(),
                        "seed_version": request.seed_version,
                        "snapshot_version": request.snapshot_version,
                        "reset_status": reset_status,
                        "details": details,
                    }))
                    .audit("preview_db.reset")
                    .trace(trace_id.as_deref()),
                completed_at,
            )?;
            Ok(reset_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockDbResetDriver;
    use crate::error::ErrorKind;
    use crate::store::{NewRun, StoreError};

    struct Fixture {
        coordinator: ResetCoordinator,
        store: Arc<ControlStore>,
        driver: Arc<MockDbResetDriver>,
    }

    fn fixture_with_config(config: Config) -> Fixture {
        let store = Arc::new(ControlStore::open_in_memory().expect("store"));
        let config = Arc::new(config);
        store.ensure_slot_rows(&config.slot_ids).expect("seed slots");
        let driver = Arc::new(MockDbResetDriver::new());
        Fixture {
            coordinator: ResetCoordinator::new(store.clone(), config, driver.clone()),
            store,
            driver,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_config(Config::for_tests())
    }

    fn insert_run(store: &ControlStore, run_id: &str) {
        store
            .with_tx::<_, StoreError, _>(|tx| {
                tx.insert_run(
                    &NewRun {
                        id: run_id.to_string(),
                        title: format!("Run {run_id}"),
                        prompt: "prompt".to_string(),
                        route: None,
                        created_by: None,
                        parent_run_id: None,
                    },
                    Utc::now(),
                )
            })
            .expect("insert run");
    }

    fn seed_request(run_id: &str, slot_id: &str) -> ResetRequest {
        ResetRequest {
            run_id: run_id.to_string(),
            slot_id: slot_id.to_string(),
            strategy: ResetStrategy::Seed,
            seed_version: Some("v1".to_string()),
            snapshot_version: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_seed_reset_applies_and_records_provenance() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let outcome = fixture
            .coordinator
            .reset_and_seed(&seed_request("R1", "preview-1"))
            .await
            .unwrap();
        assert_eq!(outcome.reset_status, "applied");
        assert_eq!(outcome.db_name, "app_preview_1");

        let calls = fixture.driver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "drop_and_recreate:app_preview_1");
        assert!(calls[1].starts_with("apply_sql:app_preview_1:"));
        assert!(calls[1].ends_with("seeds/seed-v1.sql"));

        let rows = fixture.coordinator.list_for_run("R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reset_status, "applied");
        assert_eq!(rows[0].db_name, "app_preview_1");
    }

    #[tokio::test]
    async fn test_snapshot_reset_skips_schema_drop() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let outcome = fixture
            .coordinator
            .reset_and_seed(&ResetRequest {
                run_id: "R1".to_string(),
                slot_id: "preview-2".to_string(),
                strategy: ResetStrategy::Snapshot,
                seed_version: None,
                snapshot_version: Some("2024-06".to_string()),
                dry_run: false,
            })
            .await
            .unwrap();
        assert_eq!(outcome.reset_status, "applied");
        assert_eq!(outcome.db_name, "app_preview_2");

        let calls = fixture.driver.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("apply_sql:app_preview_2:"));
        assert!(calls[0].ends_with("snapshots/snapshot-2024-06.sql"));
    }

    #[tokio::test]
    async fn test_unsafe_database_target_is_rejected_before_any_sql() {
        let mut config = Config::for_tests();
        config.preview_db_name_template = "builder_control".to_string();
        let fixture = fixture_with_config(config);
        insert_run(&fixture.store, "R1");

        let err = fixture
            .coordinator
            .reset_and_seed(&seed_request("R1", "preview-1"))
            .await
            .expect_err("control-plane target must be rejected");
        assert_eq!(err.kind, ErrorKind::UnsafeDatabaseTarget);

        // No SQL was executed against any database.
        assert!(fixture.driver.calls().is_empty());

        // But the rejection left a provenance row and an event.
        let rows = fixture.coordinator.list_for_run("R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reset_status, "rejected");

        let events = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.list_run_events("R1", 100))
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "preview_db_reset_rejected"));
    }

    #[tokio::test]
    async fn test_cross_slot_template_is_rejected() {
        let mut config = Config::for_tests();
        // Always resolves to slot 1's database regardless of slot.
        config.preview_db_name_template = "app_preview_1".to_string();
        let fixture = fixture_with_config(config);
        insert_run(&fixture.store, "R1");

        let err = fixture
            .coordinator
            .reset_and_seed(&seed_request("R1", "preview-2"))
            .await
            .expect_err("cross-slot target must be rejected");
        assert_eq!(err.kind, ErrorKind::UnsafeDatabaseTarget);
        assert!(fixture.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_seed_requires_version() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let mut request = seed_request("R1", "preview-1");
        request.seed_version = None;
        let err = fixture
            .coordinator
            .reset_and_seed(&request)
            .await
            .expect_err("missing seed version must be rejected");
        assert_eq!(err.kind, ErrorKind::Validation);

        let rows = fixture.coordinator.list_for_run("R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reset_status, "rejected");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");

        let mut request = seed_request("R1", "preview-1");
        request.dry_run = true;
        let outcome = fixture.coordinator.reset_and_seed(&request).await.unwrap();
        assert_eq!(outcome.reset_status, "dry_run");
        assert!(fixture.driver.calls().is_empty());

        let rows = fixture.coordinator.list_for_run("R1").unwrap();
        assert_eq!(rows[0].reset_status, "dry_run");
        assert!(rows[0].details.as_ref().unwrap()["resolved_sql_path"]
            .as_str()
            .unwrap()
            .ends_with("seeds/seed-v1.sql"));
    }

    #[tokio::test]
    async fn test_driver_failure_records_failed_row() {
        let fixture = fixture();
        insert_run(&fixture.store, "R1");
        fixture.driver.set_fail_apply(true);

        let err = fixture
            .coordinator
            .reset_and_seed(&seed_request("R1", "preview-1"))
            .await
            .expect_err("driver failure must surface");
        assert_eq!(err.kind, ErrorKind::DriverFailed);

        let rows = fixture.coordinator.list_for_run("R1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reset_status, "failed");
        let steps = rows[0].details.as_ref().unwrap()["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["ok"], json!(true));
        assert_eq!(steps[1]["ok"], json!(false));

        let events = fixture
            .store
            .with_tx::<_, StoreError, _>(|tx| tx.list_run_events("R1", 100))
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "preview_db_reset_failed"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let fixture = fixture();
        let err = fixture
            .coordinator
            .reset_and_seed(&seed_request("ghost", "preview-1"))
            .await
            .expect_err("unknown run");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
