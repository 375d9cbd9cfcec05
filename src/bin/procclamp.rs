use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use procclamp::common::{AuditLog, ConfigStore, SupervisorClientProxy, ipc, logging};
use procclamp::service::privilege::Privilege;
use procclamp::service::status::StatusSnapshot;
use procclamp::service::{
    CpuSelector, MutationPolicy, Priority, ProcessInspector, ProcfsInspector, StatusEvent,
    Supervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
#[command(name = "procclamp", version, about = "Keep named processes on a short leash")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise in the foreground until interrupted
    Run(PolicyArgs),
    /// Run a single check and exit
    Once(PolicyArgs),
    /// Show host and configuration details
    Info,
    /// Inspect or edit the target list
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Ask the system daemon to start supervising
    Start {
        #[command(flatten)]
        policy: PolicyArgs,

        #[command(flatten)]
        bus: BusArgs,
    },
    /// Ask the system daemon to stop supervising
    Stop(BusArgs),
    /// Show the latest outcomes reported by the system daemon
    Status(BusArgs),
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// idle, below_normal, normal, above_normal or high
    #[arg(short, long, default_value = "idle")]
    priority: Priority,

    /// "all", a core index such as "CPU 3", or "last"
    #[arg(long, default_value = "last")]
    cpu: CpuSelector,

    /// Print status events as JSON lines
    #[arg(long)]
    json: bool,
}

impl PolicyArgs {
    fn policy(&self) -> MutationPolicy {
        MutationPolicy::new(self.priority, self.cpu)
    }
}

#[derive(Args, Debug)]
struct BusArgs {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long)]
    session: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current target list and interval
    Show,
    /// Replace the target list
    Set {
        /// Process name to supervise, may be repeated
        #[arg(short = 'p', long = "process", required = true)]
        processes: Vec<String>,

        /// Seconds between checks, keeps the current value when omitted
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let store = match &cli.config {
        Some(path) => ConfigStore::load(path),
        None => ConfigStore::load_default()?,
    };
    let store = Arc::new(store);

    match cli.command {
        Commands::Run(args) => run(store, &args).await,
        Commands::Once(args) => once(store, &args),
        Commands::Info => info(&store),
        Commands::Config { action } => configure(&store, action),
        Commands::Start { policy, bus } => remote_start(&policy, &bus).await,
        Commands::Stop(bus) => remote_stop(&bus).await,
        Commands::Status(bus) => remote_status(&bus).await,
    }
}

fn build_supervisor(store: Arc<ConfigStore>, json: bool) -> Supervisor {
    let audit = AuditLog::default_path()
        .map(AuditLog::new)
        .unwrap_or_else(AuditLog::disabled);

    let supervisor = Supervisor::new(Arc::new(ProcfsInspector::new()), store, audit);
    supervisor.set_observer(move |event| print_event(event, json));
    supervisor
}

fn print_event(event: &StatusEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to encode status event: {}", e),
        }
        return;
    }

    let pid = event
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    let marker = if event.outcome.is_failure() { "!" } else { " " };
    println!("{} {:<28} {:>8}  {}", marker, event.name, pid, event.outcome);
}

fn warn_if_unprivileged(policy: &MutationPolicy) {
    if !Privilege::is_root() && policy.priority > Priority::Normal {
        warn!(
            "Raising priority to {} usually requires root, expect priority_failed",
            policy.priority
        );
    }
}

async fn run(store: Arc<ConfigStore>, args: &PolicyArgs) -> Result<()> {
    let policy = args.policy();
    warn_if_unprivileged(&policy);

    let supervisor = build_supervisor(store, args.json);
    supervisor.start(policy);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }

    supervisor.stop().await;
    Ok(())
}

fn once(store: Arc<ConfigStore>, args: &PolicyArgs) -> Result<()> {
    let policy = args.policy();
    warn_if_unprivileged(&policy);

    let supervisor = build_supervisor(store, args.json);
    supervisor.set_policy(policy);
    supervisor.run_cycle();
    Ok(())
}

fn info(store: &ConfigStore) -> Result<()> {
    let inspector = ProcfsInspector::new();
    let settings = store.reload();

    println!("CPU cores:       {}", inspector.core_count());
    println!("Default core:    {}", inspector.last_core_index());
    println!("Check interval:  {}s", settings.interval);
    println!("Config file:     {}", store.path().display());
    match AuditLog::default_path() {
        Some(path) => println!("Log file:        {}", path.display()),
        None => println!("Log file:        (disabled)"),
    }
    println!("Running as root: {}", Privilege::is_root());

    if settings.processes.is_empty() {
        println!("No processes configured");
    }
    for (i, name) in settings.processes.iter().enumerate() {
        println!("Process {}:       {}", i + 1, name);
    }

    Ok(())
}

fn configure(store: &ConfigStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = store.reload();
            let rendered =
                toml::to_string_pretty(&settings).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        ConfigAction::Set {
            processes,
            interval,
        } => {
            let interval = interval.unwrap_or_else(|| store.reload().interval);
            if !store.update(&processes, interval) {
                anyhow::bail!("Failed to save configuration to {}", store.path().display());
            }
            info!("Configuration saved");
        }
    }

    Ok(())
}

async fn client(bus: &BusArgs) -> Result<SupervisorClientProxy<'static>> {
    let conn = ipc::connect(bus.session)
        .await
        .context("Failed to connect to D-Bus")?;
    let proxy = SupervisorClientProxy::new(&conn)
        .await
        .context("Failed to reach procclamp-sys, is the daemon running?")?;
    Ok(proxy)
}

async fn remote_start(policy: &PolicyArgs, bus: &BusArgs) -> Result<()> {
    let proxy = client(bus).await?;
    let started = proxy
        .start(policy.priority.as_str(), &policy.cpu.to_string())
        .await?;

    if started {
        info!("Daemon started supervising");
    } else {
        info!("Daemon was already supervising");
    }
    Ok(())
}

async fn remote_stop(bus: &BusArgs) -> Result<()> {
    let proxy = client(bus).await?;
    if proxy.stop().await? {
        info!("Daemon stopped supervising");
    } else {
        info!("Daemon was not supervising");
    }
    Ok(())
}

async fn remote_status(bus: &BusArgs) -> Result<()> {
    let proxy = client(bus).await?;
    let running = proxy.is_running().await?;
    let snapshot: StatusSnapshot =
        serde_json::from_str(&proxy.status().await?).context("Malformed status reply")?;

    println!("Supervising: {}", if running { "yes" } else { "no" });
    for process in &snapshot.processes {
        println!(
            "{:<28} {:>8}  {}",
            process.name, process.pid, process.outcome
        );
    }
    for (name, outcome) in &snapshot.names {
        if !snapshot.processes.iter().any(|p| &p.name == name) {
            println!("{:<28} {:>8}  {}", name, "-", outcome);
        }
    }

    Ok(())
}
