//! Perpetual random placement churn.
//!
//! The scheduler walks `Idle -> BuildingCycle -> Draining -> Sleeping ->
//! BuildingCycle -> ... -> Stopped`. Stop requests are only observed between
//! those phases and at worker admission, so a migration that has started is
//! always allowed to finish.

use crate::config::RunSettings;
use crate::gate::ConcurrencyGate;
use crate::inventory::{HostHandle, Inventory, TrackedVm};
use crate::migration::{
    MigrationEngine, MigrationOutcome, MigrationTask, MigrationWorker, SkipReason,
};
use crate::picker::TargetPicker;
use crate::{ChurnError, Result, log_debug, log_error, log_info, log_trace};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, sleep};

/// One-shot cooperative stop flag shared by the scheduler and signal handlers.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually set the flag.
    pub fn request(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a run needs, fixed at startup apart from the stop flag and the
/// per-VM host cache.
#[derive(Debug)]
pub struct RunState {
    pub vms: Vec<Arc<TrackedVm>>,
    pub hosts: Vec<HostHandle>,
    pub settings: RunSettings,
    pub stop: StopSignal,
}

impl RunState {
    pub fn new(
        vms: Vec<Arc<TrackedVm>>,
        hosts: Vec<HostHandle>,
        settings: RunSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            vms,
            hosts,
            settings,
            stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    BuildingCycle,
    Draining,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            submitted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    pub fn record(&mut self, outcome: &MigrationOutcome) {
        match outcome {
            MigrationOutcome::Succeeded => self.succeeded += 1,
            MigrationOutcome::Failed(_) => self.failed += 1,
            MigrationOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn outcomes(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
        self.skipped += report.skipped;
    }
}

pub struct CycleScheduler {
    run: Arc<RunState>,
    inventory: Arc<dyn Inventory>,
    worker: MigrationWorker,
    gate: ConcurrencyGate,
    picker: TargetPicker,
    state: SchedulerState,
    cycles_completed: u64,
}

impl CycleScheduler {
    pub fn new(
        run: Arc<RunState>,
        inventory: Arc<dyn Inventory>,
        engine: Arc<dyn MigrationEngine>,
    ) -> Self {
        let gate = ConcurrencyGate::new(run.settings.workers, run.vms.len());
        let worker = MigrationWorker::new(engine, run.settings.migration_timeout);
        log_debug!("Migration pool sized to {} workers", gate.capacity());

        Self {
            run,
            inventory,
            worker,
            gate,
            picker: TargetPicker::new(),
            state: SchedulerState::Idle,
            cycles_completed: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Run cycles until stopped. Returns totals over every completed cycle.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        log_info!(
            "Starting migration churn over {} VMs and {} hosts with {} workers",
            self.run.vms.len(),
            self.run.hosts.len(),
            self.gate.capacity()
        );

        while !self.run.stop.is_requested() {
            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(err) => {
                    self.transition(SchedulerState::Stopped);
                    return Err(err);
                }
            };
            summary.absorb(&report);

            if self.run.stop.is_requested() {
                break;
            }

            if let Some(limit) = self.run.settings.max_cycles {
                if self.cycles_completed >= limit {
                    log_info!("Reached cycle limit of {}, stopping", limit);
                    self.run.stop.request();
                    break;
                }
            }

            self.transition(SchedulerState::Sleeping);
            if !self.pause().await {
                break;
            }
        }

        self.transition(SchedulerState::Stopped);
        log_info!(
            "Stopped after {} cycles: {} succeeded, {} failed, {} skipped",
            summary.cycles,
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Build and fully drain one cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let cycle = self.cycles_completed + 1;
        let started = Instant::now();
        let mut report = CycleReport::new(cycle);

        self.transition(SchedulerState::BuildingCycle);
        let tasks = self.build_cycle(&mut report).await?;

        self.transition(SchedulerState::Draining);
        self.drain(tasks, &mut report).await?;

        report.elapsed = started.elapsed();
        self.cycles_completed = cycle;
        log_info!(
            "Cycle {} finished in {:.1}s: {} succeeded, {} failed, {} skipped",
            report.cycle,
            report.elapsed.as_secs_f64(),
            report.succeeded,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    /// An inventory error ends the run: migrating with an unknown placement is
    /// not safe.
    async fn build_cycle(&self, report: &mut CycleReport) -> Result<Vec<MigrationTask>> {
        let mut tasks = Vec::with_capacity(self.run.vms.len());

        for vm in &self.run.vms {
            let status = self.inventory.vm_status(&vm.handle).await.map_err(|err| {
                log_error!("Could not query placement of VM {}: {}", vm.handle.name, err);
                match err {
                    ChurnError::Inventory(_) => err,
                    other => ChurnError::Inventory(other.to_string()),
                }
            })?;

            if !status.power.is_migratable() {
                self.skip(vm, SkipReason::PoweredOff, report);
                continue;
            }

            let source = match status.host {
                Some(host) => {
                    vm.set_cached_host(Some(host.clone()));
                    Some(host)
                }
                None => vm.cached_host(),
            };

            match self.picker.pick(source.as_ref(), &self.run.hosts) {
                Ok(destination) => {
                    log_trace!("VM {} will move to {}", vm.handle.name, destination.name);
                    tasks.push(MigrationTask::new(vm.clone(), source, destination));
                }
                Err(_) => self.skip(vm, SkipReason::NoEligibleTarget, report),
            }
        }

        Ok(tasks)
    }

    async fn drain(&self, tasks: Vec<MigrationTask>, report: &mut CycleReport) -> Result<()> {
        let mut running = JoinSet::new();

        for task in tasks {
            let permit = tokio::select! {
                biased;
                _ = self.run.stop.wait() => None,
                permit = self.gate.admit() => Some(permit?),
            };

            let Some(permit) = permit else {
                self.skip(&task.vm, SkipReason::Stopping, report);
                continue;
            };

            report.submitted += 1;
            let worker = self.worker.clone();
            running.spawn(async move {
                let outcome = worker.execute(task).await;
                drop(permit);
                outcome
            });
        }

        let mut fatal: Option<ChurnError> = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(err)) => {
                    fatal.get_or_insert(err);
                }
                Err(err) => {
                    fatal.get_or_insert(ChurnError::Worker(err.to_string()));
                }
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sleep for the configured interval. Returns `false` if stopped meanwhile.
    async fn pause(&self) -> bool {
        let interval = self.run.settings.interval;
        if interval.is_zero() {
            return !self.run.stop.is_requested();
        }

        log_debug!("Sleeping {}s before the next cycle", interval.as_secs());
        tokio::select! {
            _ = sleep(interval) => !self.run.stop.is_requested(),
            _ = self.run.stop.wait() => false,
        }
    }

    fn skip(&self, vm: &TrackedVm, reason: SkipReason, report: &mut CycleReport) {
        log_info!("Skipping VM {}: {}", vm.handle.name, reason);
        report.record(&MigrationOutcome::Skipped(reason));
    }

    fn transition(&mut self, next: SchedulerState) {
        if self.state != next {
            log_trace!("Scheduler {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_signal_is_one_shot() {
        let stop = StopSignal::new();
        assert!(!stop.is_requested());
        assert!(stop.request());
        assert!(!stop.request());
        assert!(stop.is_requested());
        stop.wait().await;
    }

    #[tokio::test]
    async fn test_stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        tokio::task::yield_now().await;
        stop.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_cycle_report_counts() {
        let mut report = CycleReport::new(1);
        report.record(&MigrationOutcome::Succeeded);
        report.record(&MigrationOutcome::Skipped(SkipReason::NoEligibleTarget));
        report.record(&MigrationOutcome::Failed(
            crate::migration::MigrationError::AlreadyMigrating,
        ));
        assert_eq!(report.outcomes(), 3);
        assert_eq!((report.succeeded, report.failed, report.skipped), (1, 1, 1));
    }
}
