use crate::{Result, log_debug, log_info, log_warn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Vm,
    Host,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Vm => write!(f, "VM"),
            EntityKind::Host => write!(f, "host"),
        }
    }
}

/// Execution host as reported by the inventory. Equality is by `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostHandle {
    pub id: String,
    pub name: String,
}

impl HostHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl PartialEq for HostHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HostHandle {}

impl std::hash::Hash for HostHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Workload as reported by the inventory. Equality is by `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHandle {
    pub id: String,
    pub name: String,
}

impl VmHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl PartialEq for VmHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VmHandle {}

impl std::hash::Hash for VmHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A resolved VM together with its last known host.
///
/// Within a cycle only the worker migrating this VM writes the cached host.
#[derive(Debug)]
pub struct TrackedVm {
    pub handle: VmHandle,
    current_host: Mutex<Option<HostHandle>>,
}

impl TrackedVm {
    pub fn new(handle: VmHandle) -> Self {
        Self {
            handle,
            current_host: Mutex::new(None),
        }
    }

    pub fn cached_host(&self) -> Option<HostHandle> {
        self.current_host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_cached_host(&self, host: Option<HostHandle>) {
        *self
            .current_host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = host;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Paused,
    PoweredOff,
    Unknown,
}

impl PowerState {
    /// Whether a live migration can be attempted in this state.
    pub fn is_migratable(&self) -> bool {
        !matches!(self, PowerState::PoweredOff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    pub host: Option<HostHandle>,
    pub power: PowerState,
}

impl VmStatus {
    pub fn unknown() -> Self {
        Self {
            host: None,
            power: PowerState::Unknown,
        }
    }
}

/// Name lookup and placement queries against the management endpoint.
///
/// `Ok(None)` from a resolve call means "no such entity"; `Err` is reserved for
/// failures of the inventory itself.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn resolve_vm(&self, name: &str) -> Result<Option<VmHandle>>;

    async fn resolve_host(&self, name: &str) -> Result<Option<HostHandle>>;

    /// Where the VM currently lives and whether it is powered on.
    async fn vm_status(&self, vm: &VmHandle) -> Result<VmStatus>;

    async fn current_host(&self, vm: &VmHandle) -> Result<Option<HostHandle>> {
        Ok(self.vm_status(vm).await?.host)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub resolved: Vec<T>,
    pub unresolved: Vec<String>,
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Self {
            resolved: Vec::new(),
            unresolved: Vec::new(),
        }
    }
}

/// Resolves name lists into handles once at startup.
///
/// Names that appear more than once are looked up once; the resulting set is
/// the same as resolving each occurrence independently.
pub struct NameResolver {
    inventory: Arc<dyn Inventory>,
}

impl NameResolver {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    pub async fn resolve_vms(&self, names: &[String]) -> Result<Resolution<VmHandle>> {
        self.resolve_all(names, EntityKind::Vm, move |name| async move {
            self.inventory.resolve_vm(&name).await
        })
        .await
    }

    pub async fn resolve_hosts(&self, names: &[String]) -> Result<Resolution<HostHandle>> {
        self.resolve_all(names, EntityKind::Host, move |name| async move {
            self.inventory.resolve_host(&name).await
        })
        .await
    }

    async fn resolve_all<T, F, Fut>(
        &self,
        names: &[String],
        kind: EntityKind,
        lookup: F,
    ) -> Result<Resolution<T>>
    where
        T: Clone + PartialEq,
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>>,
    {
        let mut resolution = Resolution::default();
        let mut seen: HashMap<&str, bool> = HashMap::new();

        for name in names {
            if let Some(&found) = seen.get(name.as_str()) {
                log_debug!("{} {} listed more than once", kind, name);
                if !found {
                    resolution.unresolved.push(name.clone());
                }
                continue;
            }

            log_debug!("Looking up {} {}", kind, name);
            match lookup(name.clone()).await? {
                Some(handle) => {
                    let found = resolution.resolved.contains(&handle);
                    if found {
                        log_debug!("{} {} resolves to an entity already listed", kind, name);
                    } else {
                        resolution.resolved.push(handle);
                    }
                    seen.insert(name.as_str(), true);
                }
                None => {
                    log_warn!("{} {} does not exist, skipping this {}", kind, name, kind);
                    resolution.unresolved.push(name.clone());
                    seen.insert(name.as_str(), false);
                }
            }
        }

        log_info!(
            "Resolved {} of {} {} names",
            resolution.resolved.len(),
            names.len(),
            kind
        );
        Ok(resolution)
    }
}
