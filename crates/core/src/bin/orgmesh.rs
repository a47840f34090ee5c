use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use orgmesh::{
    config::{self, ConfigPathsArgs},
    registry::PeerStatus,
    signaling::memory::MemoryRelayHub,
    store::{FileBackend, MemoryBackend, PeerStore},
    transport::in_memory::InMemoryNetwork,
    types::{LocalIdentity, OrganizationId, PeerId, Role},
    Node, NodeConfig, NodeHandle,
};
use tokio::time::MissedTickBehavior;

#[derive(Parser, Debug)]
#[command(name = "orgmesh", version, about = "Organization mesh maintenance and simulation")]
struct Cli {
    /// Log level: off, error, warn, info, debug or trace.
    #[arg(long, global = true, env = "ORGMESH_LOG_LEVEL")]
    log_level: Option<tracing::level_filters::LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect or reset the persisted state of an organization.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Run an admin and a few clients over an in-memory network.
    Simulate(SimulateArgs),
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Print the stored state as JSON.
    Show(StateArgs),
    /// Delete the stored state.
    Clear(StateArgs),
}

#[derive(clap::Args, Debug)]
struct StateArgs {
    #[arg(long)]
    org: String,

    #[command(flatten)]
    paths: ConfigPathsArgs,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Stop the admin for a while to show relay election and demotion.
    #[arg(long)]
    admin_outage: bool,

    /// Seconds after startup the admin goes away.
    #[arg(long, default_value_t = 10)]
    outage_after: u64,

    /// Seconds the admin stays away.
    #[arg(long, default_value_t = 30)]
    outage_for: u64,
}

const SIMULATED_ORG: &str = "simulation";
const ADMIN: &str = "admin";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    config::set_logger(cli.log_level);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli.command))
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::State { action } => match action {
            StateAction::Show(args) => show_state(args).await,
            StateAction::Clear(args) => clear_state(args).await,
        },
        Command::Simulate(args) => simulate(args).await,
    }
}

fn file_store(args: &StateArgs) -> anyhow::Result<PeerStore<FileBackend>> {
    Ok(PeerStore::new(FileBackend::new(args.paths.data_dir()?)))
}

async fn show_state(args: StateArgs) -> anyhow::Result<()> {
    let store = file_store(&args)?;
    let org = OrganizationId::new(args.org);
    match store.load(&org).await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("no stored state for {org}"),
    }
    Ok(())
}

async fn clear_state(args: StateArgs) -> anyhow::Result<()> {
    let store = file_store(&args)?;
    let org = OrganizationId::new(args.org);
    store
        .clear(&org)
        .await
        .with_context(|| format!("clearing stored state of {org}"))?;
    println!("cleared stored state for {org}");
    Ok(())
}

struct Simulation {
    network: InMemoryNetwork,
    hub: MemoryRelayHub,
    admin_store: PeerStore<MemoryBackend>,
}

impl Simulation {
    fn identity(id: &PeerId, role: Role) -> LocalIdentity {
        LocalIdentity {
            id: id.clone(),
            name: id.to_string(),
            organization_id: OrganizationId::new(SIMULATED_ORG),
            organization_name: "Simulation".to_owned(),
            role,
        }
    }

    fn start(&self, id: PeerId, role: Role, store: PeerStore<MemoryBackend>) -> NodeHandle {
        let (transport, events) = self.network.endpoint(id.clone());
        let config = NodeConfig {
            admin_id: Some(PeerId::new(ADMIN)),
            ..NodeConfig::default()
        };
        let node = Node::new(Self::identity(&id, role), config, transport, events, store)
            .with_relay(self.hub.connector());
        let handle = node.start();
        tokio::spawn(log_events(handle.clone()));
        handle
    }

    fn start_admin(&self) -> NodeHandle {
        self.start(PeerId::new(ADMIN), Role::Admin, self.admin_store.clone())
    }
}

async fn log_events(handle: NodeHandle) {
    let node = handle.identity().id.clone();
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => tracing::info!(%node, ?event, "Node event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%node, skipped, "Event log lagging");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn report(admin: Option<&NodeHandle>, clients: &[NodeHandle]) {
    for handle in admin.into_iter().chain(clients) {
        let connected = handle
            .peers()
            .iter()
            .filter(|p| p.status == PeerStatus::Connected)
            .count();
        match handle.mesh_state().await {
            Ok(mesh) => tracing::info!(
                node = %handle.identity().id,
                connected,
                phase = ?mesh.phase,
                relay = ?mesh.state.temporary_relay_id,
                "Mesh status"
            ),
            Err(error) => tracing::warn!(node = %handle.identity().id, %error, "Node not answering"),
        }
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let sim = Simulation {
        network: InMemoryNetwork::new(),
        hub: MemoryRelayHub::new(),
        admin_store: PeerStore::new(MemoryBackend::new()),
    };
    let mut admin = Some(sim.start_admin());
    let clients: Vec<NodeHandle> = (1..=args.clients)
        .map(|n| {
            sim.start(
                PeerId::new(format!("client-{n:02}")),
                Role::Client,
                PeerStore::new(MemoryBackend::new()),
            )
        })
        .collect();
    tracing::info!(clients = args.clients, "Simulation running, press Ctrl-C to stop");

    let mut status = tokio::time::interval(Duration::from_secs(5));
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let outage_start = tokio::time::sleep(Duration::from_secs(args.outage_after));
    let outage_end = tokio::time::sleep(Duration::from_secs(args.outage_after + args.outage_for));
    tokio::pin!(outage_start, outage_end);
    let mut outage_started = !args.admin_outage;
    let mut outage_over = !args.admin_outage;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping simulation");
                break;
            }
            _ = status.tick() => report(admin.as_ref(), &clients).await,
            _ = &mut outage_start, if !outage_started => {
                outage_started = true;
                if let Some(handle) = admin.take() {
                    tracing::info!(seconds = args.outage_for, "Taking the admin offline");
                    handle.shutdown().await?;
                }
            }
            _ = &mut outage_end, if !outage_over => {
                outage_over = true;
                tracing::info!("Bringing the admin back");
                admin = Some(sim.start_admin());
            }
        }
    }

    for handle in admin.iter().chain(&clients) {
        if let Err(error) = handle.shutdown().await {
            tracing::debug!(node = %handle.identity().id, %error, "Node already stopped");
        }
    }
    Ok(())
}
