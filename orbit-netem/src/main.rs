use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use orbit_netem::addr::{self, NodeId};
use orbit_netem::control::{self, Directive};
use orbit_netem::peering::{self, HostInfo, PeeringConfig, PeeringService};
use orbit_netem::probe::{self, Probe};
use orbit_netem::shaping::{MachineId, ShapingEngine};
use orbit_netem_common::{KeyField, ShaperControl, ShaperStats, edt};

#[derive(Parser)]
#[command(name = "orbit-netem")]
#[command(about = "Constellation network emulation agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the WireGuard mesh and install routes read from stdin
    Mesh(MeshCommand),
    /// Shape machine traffic with settings read from stdin
    Shape(ShapeCommand),
}

#[derive(Args)]
struct MeshCommand {
    /// Node id of this host on the mesh (0-253)
    #[arg(long)]
    id: NodeId,
    /// JSON document mapping every host id to `{addr, public_key}`. Read from
    /// the first stdin line when omitted.
    #[arg(long, value_name = "FILE")]
    peers: Option<PathBuf>,
    /// Mesh interface name
    #[arg(long, default_value = peering::DEFAULT_INTERFACE)]
    interface: String,
    /// WireGuard listen port
    #[arg(long, default_value_t = peering::DEFAULT_PORT)]
    port: u16,
    /// Where the generated private key is written
    #[arg(long, value_name = "PATH", default_value = peering::DEFAULT_KEY_PATH)]
    key_path: PathBuf,
    /// Prefix length of this host's mesh v4 address
    #[arg(long, default_value_t = peering::DEFAULT_MASK)]
    mask: u8,
    /// First address of the mesh v4 range
    #[arg(long, default_value_t = addr::DEFAULT_MESH_BASE)]
    base: Ipv4Addr,
    /// Echo requests per latency probe
    #[arg(long, default_value_t = probe::DEFAULT_PROBE_COUNT)]
    probe_count: u32,
    /// Seconds to wait for each echo reply
    #[arg(long, default_value_t = probe::DEFAULT_PROBE_TIMEOUT.as_secs())]
    probe_timeout_secs: u64,
}

#[derive(Args)]
struct ShapeCommand {
    /// Machine to shape and its interface, `<group>-<id>=<iface>`. Repeatable.
    #[arg(long = "machine", value_name = "MACHINE=IFACE", value_parser = parse_machine, required = true)]
    machines: Vec<(MachineId, String)>,
    /// Packets that would wait longer than this are dropped
    #[arg(long, value_name = "MILLIS", default_value_t = edt::TIME_HORIZON_NS / 1_000_000)]
    horizon_ms: u64,
    /// Packets that wait longer than this are marked congestion-experienced
    #[arg(long, value_name = "MILLIS", default_value_t = edt::CE_THRESHOLD_NS / 1_000_000)]
    ce_threshold_ms: u64,
    /// Header address that selects the shaping entry
    #[arg(long, value_enum, default_value_t = KeyArg::Destination)]
    key: KeyArg,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum KeyArg {
    Destination,
    Source,
}

impl From<KeyArg> for KeyField {
    fn from(value: KeyArg) -> Self {
        match value {
            KeyArg::Destination => KeyField::Destination,
            KeyArg::Source => KeyField::Source,
        }
    }
}

fn parse_machine(s: &str) -> Result<(MachineId, String), String> {
    let (machine, iface) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <group>-<id>=<iface>, got '{s}'"))?;
    if iface.is_empty() {
        return Err(format!("missing interface for machine '{machine}'"));
    }
    let machine = machine.parse().map_err(|err| format!("{err}"))?;
    Ok((machine, iface.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("orbit-netem error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Mesh(cmd)) => run_mesh(cmd).await?,
        Some(Commands::Shape(cmd)) => run_shape(cmd).await?,
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

async fn run_mesh(cmd: MeshCommand) -> Result<()> {
    let config = PeeringConfig {
        mask: cmd.mask,
        key_path: cmd.key_path,
        interface: cmd.interface,
        port: cmd.port,
        base: cmd.base,
        probe: Probe {
            count: cmd.probe_count.max(1),
            timeout: Duration::from_secs(cmd.probe_timeout_secs.max(1)),
        },
    };
    let service = PeeringService::new(config)
        .await
        .context("failed to start peering service")?;
    let registration = service
        .register(cmd.id)
        .await
        .with_context(|| format!("failed to register host {}", cmd.id))?;
    println!(
        "{}",
        json!({
            "id": cmd.id.get(),
            "public_key": registration.public_key,
            "listen_addr": registration.listen_addr,
        })
    );

    let mut control = ControlStream::stdin();
    let peers = match cmd.peers {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => match control.next_line().await? {
            Some(line) => line,
            None => return leave_mesh(&service).await,
        },
    };
    let remotes: BTreeMap<NodeId, HostInfo> =
        serde_json::from_str(&peers).context("malformed peers document")?;

    if let Err(err) = service.init_peering(remotes).await {
        leave_mesh(&service).await.ok();
        return Err(err).context("failed to peer with the mesh");
    }

    while let Some(directive) = control.next().await? {
        match directive {
            Directive::Route { subnet, host } => {
                if let Err(err) = service.route(subnet, host).await {
                    tracing::warn!(%subnet, %host, kind = ?err.kind(), error = ?err, "route failed");
                }
            }
            other => tracing::warn!(?other, "not a mesh directive; ignored"),
        }
    }

    leave_mesh(&service).await
}

async fn leave_mesh(service: &PeeringService) -> Result<()> {
    service.stop().await.context("failed to remove mesh interface")
}

async fn run_shape(cmd: ShapeCommand) -> Result<()> {
    let control_block = ShaperControl {
        horizon_ns: cmd.horizon_ms.saturating_mul(1_000_000),
        ce_threshold_ns: cmd.ce_threshold_ms.saturating_mul(1_000_000),
        key_field: KeyField::from(cmd.key) as u8,
        ..ShaperControl::default()
    };
    if control_block.ce_threshold_ns >= control_block.horizon_ns {
        bail!("congestion threshold must be below the drop horizon");
    }

    let engine = ShapingEngine::new(control_block);
    for (machine, iface) in &cmd.machines {
        if let Err(err) = engine.register(*machine, iface).await {
            engine.stop().await.ok();
            return Err(err).with_context(|| format!("failed to shape {machine} on {iface}"));
        }
    }

    let mut control = ControlStream::stdin();
    while let Some(directive) = control.next().await? {
        let result = match directive {
            Directive::Bandwidth {
                machine,
                subnet,
                kbps,
            } => engine.set_bandwidth(machine, subnet, kbps),
            Directive::Latency {
                machine,
                subnet,
                us,
            } => engine.set_latency(machine, subnet, us),
            Directive::Block { machine, subnet } => engine.block_link(machine, subnet),
            Directive::Unblock { machine, subnet } => engine.unblock_link(machine, subnet),
            Directive::Stats { machine } => engine
                .stats(machine)
                .map(|stats| println!("{}", stats_json(machine, &stats))),
            Directive::Route { .. } => {
                tracing::warn!(?directive, "not a shaping directive; ignored");
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(?directive, kind = ?err.kind(), error = ?err, "directive failed");
        }
    }

    engine.stop().await.context("failed to remove shaping")
}

fn stats_json(machine: MachineId, stats: &ShaperStats) -> serde_json::Value {
    json!({
        "machine": machine.to_string(),
        "shaped": stats.shaped,
        "passed": stats.passed,
        "dropped_blocked": stats.dropped_blocked,
        "dropped_horizon": stats.dropped_horizon,
        "ce_marked": stats.ce_marked,
        "contended": stats.contended,
    })
}

/// Control lines from stdin until EOF or Ctrl+C.
struct ControlStream {
    lines: Lines<BufReader<Stdin>>,
    line: usize,
}

impl ControlStream {
    fn stdin() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            line: 0,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        tokio::select! {
            line = self.lines.next_line() => {
                self.line += 1;
                line.context("failed to read stdin")
            }
            res = signal::ctrl_c() => {
                res.context("failed to wait for shutdown signal")?;
                tracing::info!("interrupted; shutting down");
                Ok(None)
            }
        }
    }

    /// Malformed lines are reported and skipped.
    async fn next(&mut self) -> Result<Option<Directive>> {
        while let Some(text) = self.next_line().await? {
            match control::parse_line(self.line, &text) {
                Ok(Some(directive)) => return Ok(Some(directive)),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "ignoring control line"),
            }
        }
        Ok(None)
    }
}
