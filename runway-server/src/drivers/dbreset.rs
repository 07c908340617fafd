//! Preview-database reset driver backed by `psql`.
//!
//! The coordinator has already validated the target database name by the
//! time these run; this layer only executes. Connections always name the
//! database explicitly so a misconfigured default cannot redirect a reset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::{run_command, DbResetDriver, DriverError};

pub struct PsqlResetDriver {
    /// Working directory for psql invocations (the repo root, so relative
    /// seed paths in diagnostics stay readable).
    cwd: PathBuf,
    timeout: Duration,
}

impl PsqlResetDriver {
    pub fn new(cwd: PathBuf, timeout: Duration) -> Self {
        Self { cwd, timeout }
    }

    async fn psql(&self, db_name: &str, args: &[&str]) -> Result<(), DriverError> {
        let mut argv: Vec<String> = vec![
            "psql".to_string(),
            "--no-psqlrc".to_string(),
            "--set".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "--dbname".to_string(),
            db_name.to_string(),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));

        let result = run_command(&argv, &self.cwd, self.timeout, &[]).await?;
        if result.timed_out {
            return Err(DriverError::timeout(format!("psql against {db_name}")));
        }
        if !result.succeeded() {
            return Err(DriverError::failed(format!(
                "psql against {db_name} failed: {}",
                result.output.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DbResetDriver for PsqlResetDriver {
    async fn drop_and_recreate_public_schema(&self, db_name: &str) -> Result<(), DriverError> {
        self.psql(
            db_name,
            &[
                "--command",
                "DROP SCHEMA IF EXISTS public CASCADE; \
                 CREATE SCHEMA public; \
                 GRANT ALL ON SCHEMA public TO PUBLIC;",
            ],
        )
        .await
    }

    async fn apply_sql(&self, db_name: &str, sql_path: &Path) -> Result<(), DriverError> {
        if !sql_path.is_file() {
            return Err(DriverError::failed(format!(
                "sql file not found: {}",
                sql_path.display()
            )));
        }
        let path = sql_path.to_string_lossy();
        self.psql(db_name, &["--file", &path]).await
    }
}
