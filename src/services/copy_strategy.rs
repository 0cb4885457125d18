use crate::backend::{Backend, BackendRegistry};
use crate::error::{BackendError, ReplError, ReplResult};
use crate::models::{BackendId, ContentSummary, StorageLocation};
use crate::services::bulk_copy::{BulkCopyJob, BulkCopyRequest};
use crate::utils::{copy_tree, TransferStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Thresholds and identity used to choose between direct and delegated copies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyPolicyConfig {
    /// Largest aggregate byte size still copied in-process
    pub max_copy_size: u64,
    /// Largest aggregate file count still copied in-process
    pub max_file_count: u64,
    /// Always copy in-process; keeps tests independent of a bulk-copy service
    pub always_local: bool,
    /// Identity the delegated job runs as
    pub run_as: Option<String>,
    /// A bulk job cannot split a single file, so optionally never delegate
    /// a group holding exactly one file, whatever its size
    pub direct_single_file: bool,
    /// Extra settings forwarded to every delegated job
    pub job_settings: BTreeMap<String, String>,
}

impl Default for CopyPolicyConfig {
    fn default() -> Self {
        Self {
            max_copy_size: 32 * 1024 * 1024,
            max_file_count: 10_000,
            always_local: false,
            run_as: None,
            direct_single_file: false,
            job_settings: BTreeMap::new(),
        }
    }
}

impl CopyPolicyConfig {
    /// Defaults overridden by `REPL_COPY_MAX_SIZE`, `REPL_COPY_MAX_FILES`,
    /// `REPL_IN_TEST`, `REPL_BULK_COPY_RUN_AS`, `REPL_COPY_DIRECT_SINGLE_FILE`
    /// and `REPL_BULK_COPY_SETTINGS` (`key=value` pairs separated by commas)
    pub fn from_env() -> ReplResult<Self> {
        let mut config = Self::default();

        if let Some(value) = env_var("REPL_COPY_MAX_SIZE") {
            config.max_copy_size = parse_number("REPL_COPY_MAX_SIZE", &value)?;
        }
        if let Some(value) = env_var("REPL_COPY_MAX_FILES") {
            config.max_file_count = parse_number("REPL_COPY_MAX_FILES", &value)?;
        }
        if let Some(value) = env_var("REPL_IN_TEST") {
            config.always_local = parse_flag(&value);
        }
        if let Some(value) = env_var("REPL_COPY_DIRECT_SINGLE_FILE") {
            config.direct_single_file = parse_flag(&value);
        }
        config.run_as = env_var("REPL_BULK_COPY_RUN_AS");
        if let Some(value) = env_var("REPL_BULK_COPY_SETTINGS") {
            config.job_settings = parse_settings(&value)?;
        }

        Ok(config)
    }

    /// Whether an aggregate this large must be handed to a bulk-copy job.
    /// Reaching a maximum exactly is still within bounds.
    pub fn limit_reached(&self, size: u64, file_count: u64) -> bool {
        let too_large = size > self.max_copy_size && !(self.direct_single_file && file_count <= 1);
        too_large || file_count > self.max_file_count
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(name: &str, value: &str) -> ReplResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ReplError::InvalidArgument(format!("{} must be a number, got '{}'", name, value)))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_settings(value: &str) -> ReplResult<BTreeMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ReplError::InvalidArgument(format!("invalid job setting '{}'", pair)))
        })
        .collect()
}

/// Sources owned by one backend, in input order
pub struct SourceGroup {
    backend: Arc<dyn Backend>,
    locations: Vec<StorageLocation>,
}

impl SourceGroup {
    pub fn backend_id(&self) -> &BackendId {
        self.backend.id()
    }

    pub fn locations(&self) -> &[StorageLocation] {
        &self.locations
    }
}

impl fmt::Debug for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceGroup")
            .field("backend", self.backend_id())
            .field("locations", &self.locations)
            .finish()
    }
}

/// How one source group was copied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CopyMethod {
    Direct { files: u64, bytes: u64 },
    Delegated { job_id: Uuid },
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupOutcome {
    pub backend: BackendId,
    pub sources: usize,
    pub method: CopyMethod,
}

/// Report of one `copy` invocation
#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub destination: String,
    pub groups: Vec<GroupOutcome>,
}

impl CopyReport {
    pub fn direct_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.method, CopyMethod::Direct { .. }))
            .count()
    }

    pub fn delegated_groups(&self) -> usize {
        self.groups.len() - self.direct_groups()
    }
}

/// Copies sources to a destination, per backend choosing between an
/// in-process copy and a delegated bulk-copy job
pub struct CopyStrategySelector {
    config: CopyPolicyConfig,
    registry: Arc<BackendRegistry>,
    bulk_copy: Arc<dyn BulkCopyJob>,
}

impl CopyStrategySelector {
    pub fn new(
        config: CopyPolicyConfig,
        registry: Arc<BackendRegistry>,
        bulk_copy: Arc<dyn BulkCopyJob>,
    ) -> Self {
        Self {
            config,
            registry,
            bulk_copy,
        }
    }

    pub fn config(&self) -> &CopyPolicyConfig {
        &self.config
    }

    /// Copy every source (file or directory tree) into `destination`.
    ///
    /// Any failure aborts the whole invocation; nothing is retried here.
    pub async fn copy(
        &self,
        destination: &StorageLocation,
        sources: &[StorageLocation],
    ) -> ReplResult<CopyReport> {
        if sources.is_empty() {
            return Err(ReplError::InvalidArgument(
                "at least one source location is required".to_string(),
            ));
        }

        let destination_backend = self.registry.resolve(destination)?;
        let groups = self.group_by_backend(sources)?;
        info!(
            "Copying {} source(s) from {} backend(s) to {}",
            sources.len(),
            groups.len(),
            destination
        );

        let mut outcomes = Vec::with_capacity(groups.len());
        for group in groups {
            let method = if self
                .should_copy_directly(destination_backend.id(), &group)
                .await?
            {
                let stats = self
                    .copy_directly(&group, destination_backend.as_ref(), destination)
                    .await?;
                CopyMethod::Direct {
                    files: stats.files,
                    bytes: stats.bytes,
                }
            } else {
                let job_id = self.delegate(&group, destination).await?;
                CopyMethod::Delegated { job_id }
            };

            outcomes.push(GroupOutcome {
                backend: group.backend_id().clone(),
                sources: group.locations.len(),
                method,
            });
        }

        Ok(CopyReport {
            destination: destination.to_uri(),
            groups: outcomes,
        })
    }

    /// Partition sources by backend identity, keeping first-seen order.
    /// Each distinct backend is resolved once.
    pub fn group_by_backend(&self, sources: &[StorageLocation]) -> ReplResult<Vec<SourceGroup>> {
        let mut index: HashMap<BackendId, usize> = HashMap::new();
        let mut groups: Vec<SourceGroup> = Vec::new();

        for source in sources {
            match index.get(source.backend()) {
                Some(&idx) => groups[idx].locations.push(source.clone()),
                None => {
                    let backend = self.registry.resolve(source)?;
                    index.insert(source.backend().clone(), groups.len());
                    groups.push(SourceGroup {
                        backend,
                        locations: vec![source.clone()],
                    });
                }
            }
        }

        Ok(groups)
    }

    /// Decide whether `group` is copied in-process (`true`) or delegated
    pub async fn should_copy_directly(
        &self,
        destination_backend: &BackendId,
        group: &SourceGroup,
    ) -> ReplResult<bool> {
        if self.config.always_local {
            return Ok(true);
        }

        let source_backend = group.backend_id();
        if source_backend == destination_backend
            || source_backend.is_local()
            || destination_backend.is_local()
        {
            return Ok(true);
        }

        // Copying across two remote backends: measure what would be moved
        let mut total = ContentSummary::default();
        for location in &group.locations {
            let summary = group
                .backend
                .content_summary(location)
                .await
                .map_err(|source| ReplError::PolicyEvaluation {
                    backend: source_backend.clone(),
                    path: location.path().to_string(),
                    source,
                })?;
            total.length = total.length.saturating_add(summary.length);
            total.file_count = total.file_count.saturating_add(summary.file_count);

            if self.config.limit_reached(total.length, total.file_count) {
                info!("Source is {} bytes. (MAX: {})", total.length, self.config.max_copy_size);
                info!(
                    "Source is {} files. (MAX: {})",
                    total.file_count, self.config.max_file_count
                );
                info!("Going to launch a bulk copy job for {}", source_backend);
                return Ok(false);
            }
        }

        debug!(
            "Copying {} bytes in {} files from {} directly",
            total.length, total.file_count, source_backend
        );
        Ok(true)
    }

    async fn copy_directly(
        &self,
        group: &SourceGroup,
        destination_backend: &dyn Backend,
        destination: &StorageLocation,
    ) -> ReplResult<TransferStats> {
        let copy_error = |source_uri: String, source: BackendError| ReplError::CopyExecution {
            source_uri,
            destination: destination.to_uri(),
            source,
        };

        let destination_state = match destination_backend.stat(destination).await {
            Ok(entry) => Some(entry.is_dir),
            Err(BackendError::NotFound { .. }) => None,
            Err(e) => return Err(copy_error(group.locations[0].to_uri(), e)),
        };

        let single_source = group.locations.len() == 1;
        match destination_state {
            Some(false) if !single_source => {
                return Err(ReplError::InvalidArgument(format!(
                    "copying {} sources requires {} to be a directory",
                    group.locations.len(),
                    destination
                )));
            }
            None if !single_source => destination_backend
                .mkdirs(destination)
                .await
                .map_err(|e| copy_error(group.locations[0].to_uri(), e))?,
            _ => {}
        }

        let mut targets = Vec::with_capacity(group.locations.len());
        for source in &group.locations {
            // A lone source lands on the destination itself unless that is an
            // existing directory; otherwise it goes below it under its own name
            let target = if single_source && destination_state != Some(true) {
                destination.clone()
            } else {
                let name = source.file_name().ok_or_else(|| {
                    ReplError::InvalidArgument(format!("cannot copy backend root {}", source))
                })?;
                destination.join(name)
            };

            // Overwriting would truncate the source before it is read
            if target.relative_to(source).is_some() {
                return Err(ReplError::InvalidArgument(format!(
                    "cannot copy {} to itself or to its subdirectory {}",
                    source, target
                )));
            }
            targets.push(target);
        }

        let mut stats = TransferStats::default();
        for (source, target) in group.locations.iter().zip(&targets) {
            let copied = copy_tree(
                group.backend.as_ref(),
                source,
                destination_backend,
                target,
                true,
            )
            .await
            .map_err(|e| copy_error(source.to_uri(), e))?;
            stats.merge(copied);
        }

        info!(
            "Copied {} files ({} bytes) from {} to {}",
            stats.files,
            stats.bytes,
            group.backend_id(),
            destination
        );
        Ok(stats)
    }

    async fn delegate(&self, group: &SourceGroup, destination: &StorageLocation) -> ReplResult<Uuid> {
        let request = BulkCopyRequest {
            job_id: Uuid::new_v4(),
            source_backend: group.backend_id().clone(),
            sources: group.locations.clone(),
            destination: destination.clone(),
            overwrite: true,
            run_as: self.config.run_as.clone(),
            settings: self.config.job_settings.clone(),
        };
        let job_id = request.job_id;

        self.bulk_copy
            .run(request)
            .await
            .map_err(|source| ReplError::BulkCopy {
                job_id,
                backend: group.backend_id().clone(),
                destination: destination.to_uri(),
                source,
            })?;

        Ok(job_id)
    }
}
