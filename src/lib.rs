pub mod config;
pub mod error;
pub mod gate;
pub mod input;
pub mod inventory;
pub mod libvirt;
pub mod logger;
pub mod migration;
pub mod picker;
pub mod scheduler;
pub mod shutdown;

pub use error::ChurnError;
pub use inventory::{HostHandle, Inventory, NameResolver, TrackedVm, VmHandle};
pub use migration::{MigrationEngine, MigrationError, MigrationOutcome, MigrationTask};
pub use scheduler::{CycleReport, CycleScheduler, RunState, StopSignal};

pub type Result<T> = std::result::Result<T, ChurnError>;
