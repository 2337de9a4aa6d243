// In-memory cluster shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use churn::config::RunSettings;
use churn::inventory::{PowerState, VmStatus};
use churn::{
    HostHandle, Inventory, MigrationEngine, MigrationError, RunState, StopSignal, TrackedVm,
    VmHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    End(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub vm: String,
    pub source: Option<String>,
    pub destination: String,
}

struct FakeVm {
    host: String,
    power: PowerState,
}

pub struct FakeCluster {
    hosts: Vec<String>,
    vms: Mutex<HashMap<String, FakeVm>>,
    failures: Mutex<HashMap<String, MigrationError>>,
    status_error: Mutex<Option<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    events: Mutex<Vec<Event>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeCluster {
    /// `vms` pairs a VM name with the host it starts on.
    pub fn new(hosts: &[&str], vms: &[(&str, &str)]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            vms: Mutex::new(
                vms.iter()
                    .map(|(vm, host)| {
                        (
                            vm.to_string(),
                            FakeVm {
                                host: host.to_string(),
                                power: PowerState::Running,
                            },
                        )
                    })
                    .collect(),
            ),
            failures: Mutex::new(HashMap::new()),
            status_error: Mutex::new(None),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail(&self, vm: &str, error: MigrationError) {
        self.failures.lock().unwrap().insert(vm.to_string(), error);
    }

    /// Make every placement query fail until cleared.
    pub fn fail_status(&self, reason: &str) {
        *self.status_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn power_off(&self, vm: &str) {
        if let Some(state) = self.vms.lock().unwrap().get_mut(vm) {
            state.power = PowerState::PoweredOff;
        }
    }

    pub fn host_of(&self, vm: &str) -> Option<String> {
        self.vms.lock().unwrap().get(vm).map(|state| state.host.clone())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn migrate_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn host(name: &str) -> HostHandle {
        HostHandle::new(format!("host-{}", name), name)
    }

    pub fn vm(name: &str) -> VmHandle {
        VmHandle::new(format!("uuid-{}", name), name)
    }
}

#[async_trait]
impl Inventory for FakeCluster {
    async fn resolve_vm(&self, name: &str) -> churn::Result<Option<VmHandle>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .contains_key(name)
            .then(|| FakeCluster::vm(name)))
    }

    async fn resolve_host(&self, name: &str) -> churn::Result<Option<HostHandle>> {
        Ok(self
            .hosts
            .iter()
            .find(|host| host.as_str() == name)
            .map(|host| FakeCluster::host(host)))
    }

    async fn vm_status(&self, vm: &VmHandle) -> churn::Result<VmStatus> {
        if let Some(reason) = self.status_error.lock().unwrap().clone() {
            return Err(churn::ChurnError::Inventory(reason));
        }
        let vms = self.vms.lock().unwrap();
        Ok(match vms.get(&vm.name) {
            Some(state) => VmStatus {
                host: Some(FakeCluster::host(&state.host)),
                power: state.power,
            },
            None => VmStatus::unknown(),
        })
    }
}

#[async_trait]
impl MigrationEngine for FakeCluster {
    async fn migrate(
        &self,
        vm: &VmHandle,
        source: Option<&HostHandle>,
        destination: &HostHandle,
    ) -> Result<(), MigrationError> {
        self.calls.lock().unwrap().push(Call {
            vm: vm.name.clone(),
            source: source.map(|host| host.name.clone()),
            destination: destination.name.clone(),
        });
        self.events.lock().unwrap().push(Event::Start(vm.name.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::End(vm.name.clone()));

        if let Some(error) = self.failures.lock().unwrap().get(&vm.name) {
            return Err(error.clone());
        }

        if let Some(state) = self.vms.lock().unwrap().get_mut(&vm.name) {
            state.host = destination.name.clone();
        }
        Ok(())
    }
}

pub fn settings(workers: usize, interval: Duration, max_cycles: Option<u64>) -> RunSettings {
    RunSettings {
        interval,
        workers,
        max_cycles,
        migration_timeout: None,
    }
}

pub fn run_state(vms: &[&str], hosts: &[&str], settings: RunSettings) -> Arc<RunState> {
    Arc::new(RunState::new(
        vms.iter()
            .map(|name| Arc::new(TrackedVm::new(FakeCluster::vm(name))))
            .collect(),
        hosts.iter().map(|name| FakeCluster::host(name)).collect(),
        settings,
        StopSignal::new(),
    ))
}
