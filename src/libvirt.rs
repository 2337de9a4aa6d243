//! `virsh`-backed inventory and migration engine.
//!
//! Every host in the host list runs its own libvirt daemon. A VM is located by
//! asking each known daemon (plus the management endpoint) about its domain.

use crate::config::{MigrationTuning, Transport};
use crate::inventory::{HostHandle, Inventory, PowerState, VmHandle, VmStatus};
use crate::migration::{MigrationEngine, MigrationError};
use crate::{ChurnError, Result, log_debug, log_error, log_info, log_trace};
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tokio::process::Command;

const VIRSH: &str = "virsh";
const AUTH_CREDENTIALS: &str = "churn";

/// How to reach a libvirt daemon on a named host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibvirtEndpoint {
    pub transport: Transport,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub verify_tls: bool,
}

impl LibvirtEndpoint {
    pub fn uri(&self, host: &str) -> String {
        let mut uri = format!("qemu+{}://", self.transport.as_str());
        if let Some(user) = &self.user {
            uri.push_str(user);
            uri.push('@');
        }
        uri.push_str(host);
        if let Some(port) = self.port {
            uri.push_str(&format!(":{}", port));
        }
        uri.push_str("/system");
        if self.transport == Transport::Tls && !self.verify_tls {
            uri.push_str("?no_verify=1");
        }
        uri
    }
}

fn write_auth_file(user: &str, password: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "[credentials-{}]", AUTH_CREDENTIALS)?;
    writeln!(file, "authname={}", user)?;
    writeln!(file, "password={}", password)?;
    writeln!(file)?;
    writeln!(file, "[auth-libvirt-default]")?;
    writeln!(file, "credentials={}", AUTH_CREDENTIALS)?;
    file.flush()?;
    Ok(file)
}

pub fn parse_domstate(state: &str) -> PowerState {
    match state.trim() {
        "running" | "idle" | "blocked" | "in shutdown" => PowerState::Running,
        "paused" => PowerState::Paused,
        "shut off" | "crashed" => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

pub struct VirshCluster {
    program: PathBuf,
    server: String,
    endpoint: LibvirtEndpoint,
    tuning: MigrationTuning,
    auth_file: Option<NamedTempFile>,
    hosts: RwLock<Vec<HostHandle>>,
}

impl VirshCluster {
    pub fn new(
        server: impl Into<String>,
        endpoint: LibvirtEndpoint,
        tuning: MigrationTuning,
        password: Option<&str>,
    ) -> Result<Self> {
        let auth_file = match (&endpoint.user, password) {
            (Some(user), Some(password)) if endpoint.transport != Transport::Ssh => {
                Some(write_auth_file(user, password)?)
            }
            (_, Some(_)) => {
                log_debug!("Password not used with the {} transport", endpoint.transport.as_str());
                None
            }
            _ => None,
        };

        Ok(Self {
            program: PathBuf::from(VIRSH),
            server: server.into(),
            endpoint,
            tuning,
            auth_file,
            hosts: RwLock::new(Vec::new()),
        })
    }

    /// Use a different `virsh` binary than the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn endpoint_uri(&self) -> String {
        self.endpoint.uri(&self.server)
    }

    /// Verify the management endpoint answers with the supplied credentials.
    pub async fn connect(&self) -> Result<()> {
        let uri = self.endpoint_uri();
        log_info!("Connecting to {}", uri);

        let output = self
            .virsh(&uri, &["version"])
            .await
            .map_err(|err| ChurnError::Connection {
                endpoint: uri.clone(),
                reason: format!("failed to run {}: {}", VIRSH, err),
            })?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_error!("Could not connect to {}: {}", uri, reason);
            return Err(ChurnError::Connection {
                endpoint: uri,
                reason,
            });
        }

        log_debug!("Connected to {}", uri);
        Ok(())
    }

    /// Children get their own process group so a terminal Ctrl-C reaches only
    /// churn. Stopping goes through `StopSignal`, never through the children.
    fn command(&self, uri: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-q")
            .arg("-c")
            .arg(uri)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(auth) = &self.auth_file {
            cmd.env("LIBVIRT_AUTH_FILE", auth.path());
        }
        cmd
    }

    async fn virsh(&self, uri: &str, args: &[&str]) -> std::io::Result<Output> {
        log_trace!("{} -c {} {}", self.program.display(), uri, args.join(" "));
        self.command(uri).args(args).output().await
    }

    /// Daemons to search for a domain: the listed hosts, then the endpoint.
    fn search_targets(&self) -> Vec<(Option<HostHandle>, String)> {
        let hosts = self
            .hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let endpoint_listed = hosts.iter().any(|host| host.name == self.server);
        let mut targets: Vec<(Option<HostHandle>, String)> = hosts
            .into_iter()
            .map(|host| {
                let uri = self.endpoint.uri(&host.name);
                (Some(host), uri)
            })
            .collect();
        if !endpoint_listed {
            targets.push((None, self.endpoint_uri()));
        }
        targets
    }

    fn migrate_args(&self, vm: &VmHandle, destination_uri: &str) -> Vec<String> {
        let mut args: Vec<String> = ["migrate", "--live", "--persistent", "--undefinesource"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();

        if self.tuning.auto_converge {
            args.push("--auto-converge".to_string());
        }
        if self.tuning.compress {
            args.push("--compressed".to_string());
        }
        if self.tuning.parallel_connections > 1 {
            args.push("--parallel".to_string());
            args.push("--parallel-connections".to_string());
            args.push(self.tuning.parallel_connections.to_string());
        }
        if let Some(mbps) = self.tuning.bandwidth_limit_mbps {
            // virsh takes MiB/s.
            args.push("--bandwidth".to_string());
            args.push((mbps / 8).max(1).to_string());
        }

        args.push(vm.id.clone());
        args.push(destination_uri.to_string());
        args
    }

    async fn source_uri(
        &self,
        vm: &VmHandle,
        source: Option<&HostHandle>,
    ) -> std::result::Result<String, MigrationError> {
        if let Some(host) = source {
            return Ok(self.endpoint.uri(&host.name));
        }

        let status = self
            .vm_status(vm)
            .await
            .map_err(|err| MigrationError::Unclassified(err.to_string()))?;
        Ok(match status.host {
            Some(host) => self.endpoint.uri(&host.name),
            None => self.endpoint_uri(),
        })
    }
}

#[async_trait]
impl Inventory for VirshCluster {
    async fn resolve_vm(&self, name: &str) -> Result<Option<VmHandle>> {
        for (_, uri) in self.search_targets() {
            let output = self
                .virsh(&uri, &["domuuid", name])
                .await
                .map_err(|err| ChurnError::Inventory(format!("failed to run {}: {}", VIRSH, err)))?;

            if output.status.success() {
                let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !uuid.is_empty() {
                    log_debug!("Found VM {} ({}) via {}", name, uuid, uri);
                    return Ok(Some(VmHandle::new(uuid, name)));
                }
            }
        }

        Ok(None)
    }

    async fn resolve_host(&self, name: &str) -> Result<Option<HostHandle>> {
        let uri = self.endpoint.uri(name);
        let output = self
            .virsh(&uri, &["hostname"])
            .await
            .map_err(|err| ChurnError::Inventory(format!("failed to run {}: {}", VIRSH, err)))?;

        if !output.status.success() {
            log_debug!(
                "Host {} did not answer: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let id = if reported.is_empty() {
            name.to_string()
        } else {
            reported
        };
        let host = HostHandle::new(id, name);
        log_debug!("Found host {} ({})", host.name, host.id);

        let mut hosts = self
            .hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !hosts.contains(&host) {
            hosts.push(host.clone());
        }
        Ok(Some(host))
    }

    async fn vm_status(&self, vm: &VmHandle) -> Result<VmStatus> {
        let mut inactive: Option<VmStatus> = None;

        for (host, uri) in self.search_targets() {
            let output = self
                .virsh(&uri, &["domstate", &vm.id])
                .await
                .map_err(|err| ChurnError::Inventory(format!("failed to run {}: {}", VIRSH, err)))?;

            if !output.status.success() {
                continue;
            }

            let power = parse_domstate(&String::from_utf8_lossy(&output.stdout));
            let status = VmStatus { host, power };
            if power == PowerState::PoweredOff {
                inactive.get_or_insert(status);
            } else {
                return Ok(status);
            }
        }

        Ok(inactive.unwrap_or_else(VmStatus::unknown))
    }
}

#[async_trait]
impl MigrationEngine for VirshCluster {
    async fn migrate(
        &self,
        vm: &VmHandle,
        source: Option<&HostHandle>,
        destination: &HostHandle,
    ) -> std::result::Result<(), MigrationError> {
        let source_uri = self.source_uri(vm, source).await?;
        let destination_uri = self.endpoint.uri(&destination.name);
        let args = self.migrate_args(vm, &destination_uri);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.virsh(&source_uri, &args).await.map_err(|err| {
            log_error!("Failed to start migration of VM {}: {}", vm.name, err);
            MigrationError::Unclassified(format!("failed to run {}: {}", VIRSH, err))
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(MigrationError::classify(&String::from_utf8_lossy(
                &output.stderr,
            )))
        }
    }

    async fn abort(
        &self,
        vm: &VmHandle,
        source: Option<&HostHandle>,
    ) -> std::result::Result<(), MigrationError> {
        let source_uri = self.source_uri(vm, source).await?;
        let output = self
            .virsh(&source_uri, &["domjobabort", &vm.id])
            .await
            .map_err(|err| MigrationError::Unclassified(format!("failed to run {}: {}", VIRSH, err)))?;

        if output.status.success() {
            log_info!("Migration job for VM {} aborted", vm.name);
            Ok(())
        } else {
            Err(MigrationError::classify(&String::from_utf8_lossy(
                &output.stderr,
            )))
        }
    }
}
