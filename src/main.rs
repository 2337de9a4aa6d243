use anyhow::Context;
use churn::{
    CycleScheduler, NameResolver, RunState, StopSignal, TrackedVm,
    config::{ChurnConfig, RunOverrides, Transport},
    input,
    inventory::EntityKind,
    libvirt::{LibvirtEndpoint, VirshCluster},
    log_debug, log_error, log_info, log_warn,
    logger::{self, Verbosity},
    shutdown,
};
use clap::{Parser, ValueEnum};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "churn")]
#[command(
    about = "Randomly live-migrate each VM from a list to a random host from a list, until stopped"
)]
struct Cli {
    /// Management endpoint (libvirt daemon) to connect to
    #[arg(short = 'H', long = "host")]
    server: Option<String>,

    /// Username for the management endpoint
    #[arg(short, long)]
    user: Option<String>,

    /// Password; prompted for at runtime when omitted
    #[arg(short, long, env = "CHURN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Port to connect to (defaults to the transport's standard port)
    #[arg(short = 'o', long)]
    port: Option<u16>,

    /// File with the list of VMs to migrate
    #[arg(short = 'V', long = "vms")]
    vm_file: PathBuf,

    /// File with the list of target hosts to migrate to
    #[arg(short = 't', long = "targets")]
    host_file: PathBuf,

    /// Seconds to wait after a cycle finished before starting the next (default 30)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Number of simultaneous migrations (default 1)
    #[arg(short = 'T', long = "threads", alias = "workers")]
    workers: Option<usize>,

    /// Disable TLS certificate verification on connect
    #[arg(short = 'S', long = "disable-ssl-certificate-verification")]
    no_verify: bool,

    /// Connection transport
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Stop after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Give up on a single migration after this many seconds
    #[arg(long = "migration-timeout", value_name = "SECS")]
    migration_timeout: Option<u64>,

    /// File to log to (default stdout)
    #[arg(short, long = "log-file")]
    log_file: Option<PathBuf>,

    /// Configuration file (default ~/.config/churn/config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Tls,
    Ssh,
    Tcp,
}

impl From<TransportArg> for Transport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Tls => Transport::Tls,
            TransportArg::Ssh => Transport::Ssh,
            TransportArg::Tcp => Transport::Tcp,
        }
    }
}

/// Keeps terminal echo off until dropped. A no-op when the fd is not a terminal.
struct EchoOff<'a> {
    fd: BorrowedFd<'a>,
    saved: Option<Termios>,
}

impl<'a> EchoOff<'a> {
    fn new(fd: BorrowedFd<'a>) -> Self {
        let saved = termios::tcgetattr(fd).ok();
        if let Some(saved) = &saved {
            let mut quiet = saved.clone();
            quiet.local_flags.remove(LocalFlags::ECHO);
            if let Err(err) = termios::tcsetattr(fd, SetArg::TCSANOW, &quiet) {
                log_debug!("Could not disable terminal echo: {}", err);
            }
        }
        Self { fd, saved }
    }
}

impl Drop for EchoOff<'_> {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            if let Err(err) = termios::tcsetattr(self.fd, SetArg::TCSANOW, saved) {
                log_warn!("Could not restore terminal echo: {}", err);
            }
        }
    }
}

fn prompt_password(server: &str, user: &str) -> io::Result<String> {
    log_debug!("No command line password received, requesting password from user");
    print!("Enter password for {} for user {}: ", server, user);
    io::stdout().flush()?;

    let stdin = io::stdin();
    let mut input = String::new();
    {
        let _echo = EchoOff::new(stdin.as_fd());
        stdin.read_line(&mut input)?;
    }
    println!();
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ChurnConfig::load(cli.config.as_deref())?;
    let settings = config.run_settings(&RunOverrides {
        interval_seconds: cli.interval,
        workers: cli.workers,
        max_cycles: cli.cycles,
        migration_timeout_seconds: cli.migration_timeout,
    })?;

    let server = cli
        .server
        .or_else(|| config.endpoint.server.clone())
        .context("no management endpoint given (--host)")?;
    let user = cli
        .user
        .or_else(|| config.endpoint.user.clone())
        .context("no username given (--user)")?;

    let vm_names = input::load_names(&cli.vm_file, EntityKind::Vm)?;
    let host_names = input::load_names(&cli.host_file, EntityKind::Host)?;

    let transport = cli
        .transport
        .map(Transport::from)
        .unwrap_or(config.endpoint.transport);
    let password = match cli.password {
        Some(password) => Some(password),
        None if transport != Transport::Ssh => Some(prompt_password(&server, &user)?),
        None => None,
    };

    let endpoint = LibvirtEndpoint {
        transport,
        user: Some(user),
        port: cli.port.or(config.endpoint.port),
        verify_tls: config.endpoint.verify_tls && !cli.no_verify,
    };
    if !endpoint.verify_tls {
        log_debug!("Disabling TLS certificate verification");
    }

    let cluster = Arc::new(VirshCluster::new(
        server,
        endpoint,
        config.migration.clone(),
        password.as_deref(),
    )?);
    cluster.connect().await?;

    let resolver = NameResolver::new(cluster.clone());
    let hosts = resolver.resolve_hosts(&host_names).await?;
    let vms = resolver.resolve_vms(&vm_names).await?;

    if vms.resolved.is_empty() {
        log_warn!("None of the listed VMs exist, every cycle will be empty");
    }
    if hosts.resolved.len() < 2 {
        log_warn!(
            "Only {} target hosts resolved, VMs already on them will be skipped",
            hosts.resolved.len()
        );
    }

    let stop = StopSignal::new();
    let run = Arc::new(RunState::new(
        vms.resolved
            .into_iter()
            .map(|vm| Arc::new(TrackedVm::new(vm)))
            .collect(),
        hosts.resolved,
        settings,
        stop.clone(),
    ));

    let listener = shutdown::spawn_stop_listener(stop.clone());
    let mut scheduler = CycleScheduler::new(run, cluster.clone(), cluster);
    let result = scheduler.run().await;

    stop.request();
    if let Err(err) = listener.await {
        log_debug!("Stop listener ended abnormally: {}", err);
    }

    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbosity = Verbosity::from_flags(cli.verbose, cli.debug);
    if let Err(err) = logger::init_logger(verbosity, cli.log_file.as_deref()) {
        eprintln!("Failed to initialise logging: {}", err);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => {
            log_info!("Finished all tasks");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log_error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
