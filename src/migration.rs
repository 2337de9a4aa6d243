use crate::inventory::{HostHandle, TrackedVm, VmHandle};
use crate::{ChurnError, Result, log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// One migration attempt, built fresh each cycle and consumed once.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub task_id: String,
    pub vm: Arc<TrackedVm>,
    pub source: Option<HostHandle>,
    pub destination: HostHandle,
}

impl MigrationTask {
    pub fn new(vm: Arc<TrackedVm>, source: Option<HostHandle>, destination: HostHandle) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            vm,
            source,
            destination,
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.vm.handle.name
    }

    fn source_label(&self) -> String {
        self.source
            .as_ref()
            .map(|host| host.name.clone())
            .unwrap_or_else(|| "unknown host".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoEligibleTarget,
    PoweredOff,
    Stopping,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoEligibleTarget => write!(f, "no eligible target host"),
            SkipReason::PoweredOff => write!(f, "VM is powered off"),
            SkipReason::Stopping => write!(f, "stop requested before the migration started"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Succeeded,
    Failed(MigrationError),
    Skipped(SkipReason),
}

/// Per-task migration failures. Everything except `Unclassified` leaves the VM
/// on its source host and lets the run continue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("VM is already being migrated")]
    AlreadyMigrating,

    #[error("Insufficient resources on destination: {0}")]
    InsufficientResources(String),

    #[error("Connectivity fault: {0}")]
    Connectivity(String),

    #[error("Destination incompatible: {0}")]
    Incompatible(String),

    #[error("Migration did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Migration rejected: {0}")]
    Rejected(String),

    #[error("Unclassified engine failure: {0}")]
    Unclassified(String),
}

impl MigrationError {
    /// Map an engine error message onto a failure class.
    pub fn classify(message: &str) -> Self {
        let text = message.trim();
        let lower = text.to_lowercase();

        if lower.contains("another migration job")
            || (lower.contains("already") && (lower.contains("migrat") || lower.contains("job")))
        {
            MigrationError::AlreadyMigrating
        } else if lower.contains("cannot allocate memory")
            || lower.contains("insufficient")
            || lower.contains("out of memory")
            || lower.contains("no space left")
        {
            MigrationError::InsufficientResources(text.to_string())
        } else if lower.contains("unable to connect")
            || lower.contains("connection refused")
            || lower.contains("no route to host")
            || lower.contains("connection reset")
            || lower.contains("failed to connect")
            || lower.contains("timed out")
        {
            MigrationError::Connectivity(text.to_string())
        } else if lower.contains("unsupported configuration")
            || lower.contains("incompatible")
            || lower.contains("cpu doesn't match")
            || lower.contains("guest cpu")
            || lower.contains("not supported")
        {
            MigrationError::Incompatible(text.to_string())
        } else {
            MigrationError::Rejected(text.to_string())
        }
    }
}

/// Performs live migrations on behalf of a worker.
#[async_trait]
pub trait MigrationEngine: Send + Sync {
    /// Move `vm` to `destination`, returning once the engine reports completion.
    /// `source` is a best-effort hint and may be absent.
    async fn migrate(
        &self,
        vm: &VmHandle,
        source: Option<&HostHandle>,
        destination: &HostHandle,
    ) -> std::result::Result<(), MigrationError>;

    /// Abort an in-progress migration after the worker gave up waiting.
    async fn abort(
        &self,
        _vm: &VmHandle,
        _source: Option<&HostHandle>,
    ) -> std::result::Result<(), MigrationError> {
        Ok(())
    }
}

/// Executes a single task against the engine and records the result.
///
/// No retry happens inside a cycle. An optional timeout bounds how long a
/// worker slot can be held by a single engine call.
#[derive(Clone)]
pub struct MigrationWorker {
    engine: Arc<dyn MigrationEngine>,
    timeout: Option<Duration>,
}

impl MigrationWorker {
    pub fn new(engine: Arc<dyn MigrationEngine>, timeout: Option<Duration>) -> Self {
        Self { engine, timeout }
    }

    pub async fn execute(&self, task: MigrationTask) -> Result<MigrationOutcome> {
        log_info!(
            "Migrating VM {} from {} to {} (task {})",
            task.vm_name(),
            task.source_label(),
            task.destination.name,
            task.task_id
        );

        let started = Instant::now();
        let result = self.run_engine(&task).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                task.vm.set_cached_host(Some(task.destination.clone()));
                log_info!(
                    "VM {} migrated to {} in {:.1}s",
                    task.vm_name(),
                    task.destination.name,
                    elapsed.as_secs_f64()
                );
                Ok(MigrationOutcome::Succeeded)
            }
            Err(MigrationError::Unclassified(reason)) => {
                log_error!(
                    "Migration of VM {} to {} failed unexpectedly: {}",
                    task.vm_name(),
                    task.destination.name,
                    reason
                );
                Err(ChurnError::Engine(reason))
            }
            Err(err) => {
                // Placement is uncertain after a failure; re-query next cycle.
                task.vm.set_cached_host(None);
                log_warn!(
                    "Migration of VM {} to {} failed after {:.1}s: {}",
                    task.vm_name(),
                    task.destination.name,
                    elapsed.as_secs_f64(),
                    err
                );
                Ok(MigrationOutcome::Failed(err))
            }
        }
    }

    async fn run_engine(&self, task: &MigrationTask) -> std::result::Result<(), MigrationError> {
        let call = self
            .engine
            .migrate(&task.vm.handle, task.source.as_ref(), &task.destination);

        let Some(limit) = self.timeout else {
            return call.await;
        };

        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                log_debug!("Aborting migration task {} after {:?}", task.task_id, limit);
                if let Err(err) = self
                    .engine
                    .abort(&task.vm.handle, task.source.as_ref())
                    .await
                {
                    log_warn!("Could not abort migration of VM {}: {}", task.vm_name(), err);
                }
                Err(MigrationError::TimedOut(limit))
            }
        }
    }
}
