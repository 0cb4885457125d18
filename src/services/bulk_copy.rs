use crate::error::BulkCopyError;
use crate::models::{BackendId, StorageLocation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::process::Stdio;
use tracing::{debug, info};
use uuid::Uuid;

/// Environment variable through which the run-as identity reaches the job
pub const RUN_AS_ENV: &str = "BULK_COPY_RUN_AS";

/// Everything a delegated bulk-copy job needs to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkCopyRequest {
    pub job_id: Uuid,
    pub source_backend: BackendId,
    pub sources: Vec<StorageLocation>,
    pub destination: StorageLocation,
    pub overwrite: bool,
    pub run_as: Option<String>,
    pub settings: BTreeMap<String, String>,
}

/// A distributed copy engine the selector can hand large transfers to.
///
/// `run` resolves only once the job has finished; there is no timeout on
/// this side, the job owns its own lifecycle.
#[async_trait]
pub trait BulkCopyJob: Send + Sync {
    async fn run(&self, request: BulkCopyRequest) -> Result<(), BulkCopyError>;
}

/// Configuration of the external bulk-copy program
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkCopyConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
}

impl BulkCopyConfig {
    /// Read `REPL_BULK_COPY_PROGRAM` and the whitespace-separated
    /// `REPL_BULK_COPY_ARGS`
    pub fn from_env() -> Self {
        let program = env::var("REPL_BULK_COPY_PROGRAM")
            .ok()
            .filter(|p| !p.trim().is_empty());
        let args = env::var("REPL_BULK_COPY_ARGS")
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Self { program, args }
    }

    /// Build the job this configuration describes
    pub fn build_job(&self) -> Box<dyn BulkCopyJob> {
        match &self.program {
            Some(program) => Box::new(CommandBulkCopyJob::new(program.clone(), self.args.clone())),
            None => Box::new(DisabledBulkCopyJob),
        }
    }
}

/// Runs an external copy program such as `hadoop distcp`.
///
/// The command line is `program args... -Dkey=value... [-overwrite] sources... destination`.
#[derive(Debug, Clone)]
pub struct CommandBulkCopyJob {
    program: String,
    args: Vec<String>,
}

impl CommandBulkCopyJob {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_line(&self, request: &BulkCopyRequest) -> Vec<String> {
        let mut line = self.args.clone();
        line.extend(
            request
                .settings
                .iter()
                .map(|(key, value)| format!("-D{}={}", key, value)),
        );
        if request.overwrite {
            line.push("-overwrite".to_string());
        }
        line.extend(request.sources.iter().map(StorageLocation::to_uri));
        line.push(request.destination.to_uri());
        line
    }
}

#[async_trait]
impl BulkCopyJob for CommandBulkCopyJob {
    async fn run(&self, request: BulkCopyRequest) -> Result<(), BulkCopyError> {
        let args = self.command_line(&request);
        info!(
            "Launching bulk copy job {}: {} {}",
            request.job_id,
            self.program,
            args.join(" ")
        );

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(user) = &request.run_as {
            command.env(RUN_AS_ENV, user);
        }

        let output = command.output().await.map_err(|source| BulkCopyError::Launch {
            program: self.program.clone(),
            source,
        })?;

        debug!(
            "Bulk copy job {} output: {}",
            request.job_id,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        if !output.status.success() {
            return Err(BulkCopyError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Bulk copy job {} completed", request.job_id);
        Ok(())
    }
}

/// Used when no bulk-copy program is configured; every delegation fails
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBulkCopyJob;

#[async_trait]
impl BulkCopyJob for DisabledBulkCopyJob {
    async fn run(&self, request: BulkCopyRequest) -> Result<(), BulkCopyError> {
        Err(BulkCopyError::Rejected(format!(
            "no bulk copy program configured for job {} (set REPL_BULK_COPY_PROGRAM)",
            request.job_id
        )))
    }
}
