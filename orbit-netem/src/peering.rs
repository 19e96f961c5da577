//! Any-to-any WireGuard mesh between hosts.
//!
//! Every host runs one [`PeeringService`]. After [`PeeringService::register`]
//! brings up the local interface, [`PeeringService::init_peering`] installs a
//! WireGuard peer for every other host and measures the one-way latency to it.
//! [`PeeringService::route`] then points emulated-machine subnets at the host
//! that owns them, in both address families.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::{
    ErrorKind,
    addr::{self, AddrError, Ipv4Subnet, MeshAddress, NodeId, OWN_V6_PREFIX_LEN},
    command::{self, Command, CommandRunner, Runner},
    keys::KeyPair,
    probe::{Probe, ProbeError},
};

pub const DEFAULT_INTERFACE: &str = "wg0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_KEY_PATH: &str = "/celestial/wgkey";
pub const DEFAULT_MASK: u8 = 26;

#[derive(Debug, thiserror::Error)]
pub enum PeeringError {
    #[error("`{0}` is not available on this host")]
    ToolUnavailable(String),
    #[error("host is not registered on the mesh yet")]
    NotRegistered,
    #[error("host is already registered as {0}")]
    AlreadyRegistered(NodeId),
    #[error("no peer for host {0}")]
    UnknownHost(NodeId),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("failed to write private key to {}", path.display())]
    Key {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure {interface}")]
    Interface {
        interface: String,
        #[source]
        source: command::Error,
    },
    #[error("failed to configure peer for host {host}")]
    Peer {
        host: NodeId,
        #[source]
        source: command::Error,
    },
    #[error("failed to probe host {host}")]
    Probe {
        host: NodeId,
        #[source]
        source: ProbeError,
    },
}

impl PeeringError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeeringError::ToolUnavailable(_) | PeeringError::Key { .. } => ErrorKind::Resource,
            PeeringError::NotRegistered
            | PeeringError::AlreadyRegistered(_)
            | PeeringError::UnknownHost(_)
            | PeeringError::Addr(_) => ErrorKind::Configuration,
            PeeringError::Interface { source, .. } | PeeringError::Peer { source, .. } => {
                source.kind()
            }
            PeeringError::Probe { source, .. } => source.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeeringError>;

#[derive(Debug, Clone)]
pub struct PeeringConfig {
    /// Prefix length of the own mesh v4 address.
    pub mask: u8,
    pub key_path: PathBuf,
    pub interface: String,
    pub port: u16,
    pub base: Ipv4Addr,
    pub probe: Probe,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            mask: DEFAULT_MASK,
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            interface: DEFAULT_INTERFACE.to_string(),
            port: DEFAULT_PORT,
            base: addr::DEFAULT_MESH_BASE,
            probe: Probe::default(),
        }
    }
}

/// What a remote host needs to know to peer with us.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostInfo {
    /// Underlay address WireGuard talks to.
    pub addr: SocketAddr,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub public_key: String,
    pub listen_addr: String,
}

#[derive(Debug)]
struct Peer {
    public_key: String,
    endpoint: SocketAddr,
    mesh: MeshAddress,
    latency_us: u64,
    /// Held across the `wg set` that publishes it, so concurrent routes to
    /// one host cannot publish an older list after a newer one.
    allowed: tokio::sync::Mutex<BTreeSet<Ipv4Subnet>>,
}

pub struct PeeringService<R: CommandRunner = Runner> {
    config: PeeringConfig,
    runner: R,
    keys: KeyPair,
    id: RwLock<Option<NodeId>>,
    peers: RwLock<BTreeMap<NodeId, Arc<Peer>>>,
}

impl PeeringService<Runner> {
    pub async fn new(config: PeeringConfig) -> Result<Self> {
        Self::with_runner(config, Runner).await
    }
}

impl<R: CommandRunner> PeeringService<R> {
    pub async fn with_runner(config: PeeringConfig, runner: R) -> Result<Self> {
        match runner.run(&Command::new("wg").arg("--version")).await {
            Ok(_) => {}
            Err(command::Error::NotFound(tool)) => return Err(PeeringError::ToolUnavailable(tool)),
            Err(source) => {
                return Err(PeeringError::Interface {
                    interface: config.interface.clone(),
                    source,
                })
            }
        }

        // Leftover from an earlier run.
        let stale = Command::new("ip").args(["link", "del"]).arg(&config.interface);
        if let Err(err) = runner.run(&stale).await {
            tracing::debug!(%err, interface = %config.interface, "no stale interface removed");
        }

        let keys = KeyPair::generate();
        keys.persist(&config.key_path)
            .map_err(|source| PeeringError::Key {
                path: config.key_path.clone(),
                source,
            })?;
        tracing::info!(public_key = %keys.public_key(), "generated mesh key pair");

        Ok(Self {
            config,
            runner,
            keys,
            id: RwLock::new(None),
            peers: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn public_key(&self) -> String {
        self.keys.public_key()
    }

    pub fn host_id(&self) -> Option<NodeId> {
        *self.id.read()
    }

    pub fn config(&self) -> &PeeringConfig {
        &self.config
    }

    /// Brings up the mesh interface with the addresses derived from `host`.
    ///
    /// A failure part way leaves the interface behind; [`PeeringService::stop`]
    /// removes it.
    pub async fn register(&self, host: NodeId) -> Result<Registration> {
        if let Some(id) = self.host_id() {
            return Err(PeeringError::AlreadyRegistered(id));
        }
        let own = addr::mesh_address(self.config.base, host);
        let iface = &self.config.interface;

        let steps = [
            Command::new("ip")
                .args(["link", "add"])
                .arg(iface)
                .args(["type", "wireguard"]),
            Command::new("ip")
                .args(["addr", "add"])
                .arg(format!("{}/{}", own.v4, self.config.mask))
                .arg("dev")
                .arg(iface),
            Command::new("ip")
                .args(["-6", "addr", "add"])
                .arg(format!("{}/{}", own.v6, OWN_V6_PREFIX_LEN))
                .arg("dev")
                .arg(iface),
            Command::new("wg")
                .arg("set")
                .arg(iface)
                .arg("private-key")
                .arg(self.config.key_path.display())
                .arg("listen-port")
                .arg(self.config.port),
            Command::new("ip").args(["link", "set"]).arg(iface).arg("up"),
        ];
        for step in &steps {
            self.interface_cmd(step).await?;
        }

        *self.id.write() = Some(host);
        tracing::info!(%host, v4 = %own.v4, v6 = %own.v6, %iface, "registered on mesh");

        Ok(Registration {
            public_key: self.public_key(),
            listen_addr: format!(":{}", self.config.port),
        })
    }

    /// Peers with every host in `remotes` except this one.
    ///
    /// Either every remote is installed and probed, or none of the peers
    /// added by this call survive and the first error is returned.
    pub async fn init_peering(&self, remotes: BTreeMap<NodeId, HostInfo>) -> Result<()> {
        let own = self.host_id().ok_or(PeeringError::NotRegistered)?;
        let known: BTreeSet<NodeId> = self.peers.read().keys().copied().collect();

        let mut installed: Vec<(NodeId, HostInfo, BTreeSet<Ipv4Subnet>)> = Vec::new();
        for (host, info) in remotes.into_iter().filter(|(host, _)| *host != own) {
            let mesh = addr::mesh_address(self.config.base, host);
            // A known host keeps the subnets already routed to it.
            let existing = self.peers.read().get(&host).cloned();
            let routed = match existing {
                Some(peer) => peer.allowed.lock().await.clone(),
                None => BTreeSet::new(),
            };
            let install = async {
                let cmd = Command::new("wg")
                    .arg("set")
                    .arg(&self.config.interface)
                    .arg("peer")
                    .arg(&info.public_key)
                    .arg("allowed-ips")
                    .arg(allowed_ips(&mesh, &routed)?.join(","))
                    .arg("endpoint")
                    .arg(info.addr);
                self.runner
                    .run(&cmd)
                    .await
                    .map(drop)
                    .map_err(|source| PeeringError::Peer { host, source })
            };
            if let Err(err) = install.await {
                self.remove_peers(installed.iter().filter(|(h, ..)| !known.contains(h)))
                    .await;
                return Err(err);
            }
            installed.push((host, info, routed));
        }

        let probes = installed.iter().map(|(host, info, _)| async move {
            self.config
                .probe
                .one_way_latency_us(&self.runner, info.addr.ip())
                .await
                .map_err(|source| PeeringError::Probe {
                    host: *host,
                    source,
                })
        });
        let latencies = match try_join_all(probes).await {
            Ok(latencies) => latencies,
            Err(err) => {
                self.remove_peers(installed.iter().filter(|(h, ..)| !known.contains(h)))
                    .await;
                return Err(err);
            }
        };

        let mut peers = self.peers.write();
        for ((host, info, routed), latency_us) in installed.into_iter().zip(latencies) {
            tracing::info!(%host, endpoint = %info.addr, latency_us, routed = routed.len(), "peer ready");
            peers.insert(
                host,
                Arc::new(Peer {
                    mesh: addr::mesh_address(self.config.base, host),
                    public_key: info.public_key,
                    endpoint: info.addr,
                    latency_us,
                    allowed: tokio::sync::Mutex::new(routed),
                }),
            );
        }
        Ok(())
    }

    async fn remove_peers<'a>(
        &self,
        peers: impl Iterator<Item = &'a (NodeId, HostInfo, BTreeSet<Ipv4Subnet>)>,
    ) {
        for (host, info, _) in peers {
            let cmd = Command::new("wg")
                .arg("set")
                .arg(&self.config.interface)
                .arg("peer")
                .arg(&info.public_key)
                .arg("remove");
            if let Err(err) = self.runner.run(&cmd).await {
                tracing::warn!(%host, %err, "failed to roll back peer");
            }
        }
    }

    /// Sends traffic for `subnet` to `host` over the mesh.
    ///
    /// Routing the same subnet twice changes nothing.
    pub async fn route(&self, subnet: Ipv4Subnet, host: NodeId) -> Result<()> {
        let peer = self
            .peers
            .read()
            .get(&host)
            .cloned()
            .ok_or(PeeringError::UnknownHost(host))?;
        let mirrored = subnet.mesh_v6()?;

        {
            let mut allowed = peer.allowed.lock().await;
            let mut next = allowed.clone();
            next.insert(subnet);
            let ips = allowed_ips(&peer.mesh, &next)?;
            let cmd = Command::new("wg")
                .arg("set")
                .arg(&self.config.interface)
                .arg("peer")
                .arg(&peer.public_key)
                .arg("allowed-ips")
                .arg(ips.join(","));
            self.runner
                .run(&cmd)
                .await
                .map_err(|source| PeeringError::Peer { host, source })?;
            *allowed = next;
        }

        let iface = &self.config.interface;
        self.replace_route(
            Command::new("ip").args(["route", "del"]).arg(subnet),
            Command::new("ip")
                .args(["route", "add"])
                .arg(subnet)
                .arg("via")
                .arg(peer.mesh.v4)
                .arg("dev")
                .arg(iface),
        )
        .await?;
        for v6 in mirrored {
            self.replace_route(
                Command::new("ip").args(["-6", "route", "del"]).arg(v6),
                Command::new("ip")
                    .args(["-6", "route", "add"])
                    .arg(v6)
                    .arg("via")
                    .arg(peer.mesh.v6)
                    .arg("dev")
                    .arg(iface),
            )
            .await?;
        }

        tracing::debug!(%subnet, %host, "route installed");
        Ok(())
    }

    async fn replace_route(&self, del: Command, add: Command) -> Result<()> {
        if let Err(err) = self.runner.run(&del).await {
            tracing::debug!(%err, "no previous route");
        }
        self.interface_cmd(&add).await
    }

    /// One-way latency to `host` measured when peering, in microseconds.
    pub fn peer_latency(&self, host: NodeId) -> Result<u64> {
        self.peers
            .read()
            .get(&host)
            .map(|peer| peer.latency_us)
            .ok_or(PeeringError::UnknownHost(host))
    }

    pub fn peer_endpoint(&self, host: NodeId) -> Option<SocketAddr> {
        self.peers.read().get(&host).map(|peer| peer.endpoint)
    }

    /// Removes the mesh interface and with it every peer and route.
    pub async fn stop(&self) -> Result<()> {
        let cmd = Command::new("ip")
            .args(["link", "del"])
            .arg(&self.config.interface);
        self.interface_cmd(&cmd).await?;
        self.peers.write().clear();
        *self.id.write() = None;
        tracing::info!(interface = %self.config.interface, "left mesh");
        Ok(())
    }

    async fn interface_cmd(&self, cmd: &Command) -> Result<()> {
        self.runner
            .run(cmd)
            .await
            .map(drop)
            .map_err(|source| PeeringError::Interface {
                interface: self.config.interface.clone(),
                source,
            })
    }
}

/// The peer's own addresses followed by every routed subnet and its v6
/// mirror, each once.
fn allowed_ips(mesh: &MeshAddress, subnets: &BTreeSet<Ipv4Subnet>) -> Result<Vec<String>> {
    let mut ips = vec![format!("{}/32", mesh.v4), format!("{}/128", mesh.v6)];
    let mut push = |entry: String| {
        if !ips.contains(&entry) {
            ips.push(entry);
        }
    };
    for subnet in subnets {
        push(subnet.to_string());
        for v6 in subnet.mesh_v6()? {
            push(v6.to_string());
        }
    }
    Ok(ips)
}
