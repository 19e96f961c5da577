//! Per-destination bandwidth and latency for emulated machines.
//!
//! Each registered machine gets its own copy of the tc program on its
//! interface. The engine keeps the control-plane view of every shaped subnet
//! and writes one entry per concrete address into the kernel maps, keyed by
//! the four-octet address and by its sixteen-octet mesh twin.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use async_trait::async_trait;
use orbit_netem_common::{HandleKbpsDelay, SHAPING_MAP_ENTRIES, ShaperControl, ShaperStats};
use parking_lot::{Mutex, RwLock};

use crate::{
    ErrorKind,
    addr::{Ipv4Subnet, embed_v4},
    ebpf_loader::EbpfBackend,
    tc::AttachError,
};

#[derive(Debug, thiserror::Error)]
pub enum ShapingError {
    #[error("machine {0} is not registered")]
    UnknownMachine(MachineId),
    #[error("machine {0} is already registered")]
    AlreadyRegistered(MachineId),
    #[error("subnet {subnet} has more addresses than the shaping maps hold ({max})")]
    SubnetTooLarge { subnet: Ipv4Subnet, max: u32 },
    #[error("shaping maps of machine {machine} have room for {free} more addresses, {subnet} needs {needed}")]
    MapFull {
        machine: MachineId,
        subnet: Ipv4Subnet,
        needed: usize,
        free: usize,
    },
    #[error("the shaping program was not built into this binary")]
    ProgramUnavailable,
    #[error("failed to load the shaping program")]
    Load(#[source] aya::EbpfError),
    #[error("map {0} missing from the shaping program")]
    MissingMap(&'static str),
    #[error("program {0} missing from the shaping object")]
    MissingProgram(&'static str),
    #[error("map {name} operation failed")]
    Map {
        name: &'static str,
        #[source]
        source: aya::maps::MapError,
    },
    #[error(transparent)]
    Attach(#[from] AttachError),
}

impl ShapingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShapingError::UnknownMachine(_)
            | ShapingError::AlreadyRegistered(_)
            | ShapingError::SubnetTooLarge { .. }
            | ShapingError::MapFull { .. } => ErrorKind::Configuration,
            ShapingError::ProgramUnavailable
            | ShapingError::Load(_)
            | ShapingError::MissingMap(_)
            | ShapingError::MissingProgram(_) => ErrorKind::Resource,
            ShapingError::Map { .. } => ErrorKind::KernelState,
            ShapingError::Attach(err) => err.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShapingError>;

/// An emulated machine, `group-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId {
    pub group: u8,
    pub id: u32,
}

impl MachineId {
    pub const fn new(group: u8, id: u32) -> Self {
        Self { group, id }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed machine id '{0}', expected <group>-<id>")]
pub struct MachineIdError(String);

impl FromStr for MachineId {
    type Err = MachineIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || MachineIdError(s.to_string());
        let (group, id) = s.trim().split_once('-').ok_or_else(malformed)?;
        Ok(Self {
            group: group.parse().map_err(|_| malformed())?,
            id: id.parse().map_err(|_| malformed())?,
        })
    }
}

/// What the control plane asked for on one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkEntry {
    pub configured: HandleKbpsDelay,
    pub blocked: bool,
}

impl LinkEntry {
    /// The value the kernel sees.
    pub fn effective(&self) -> HandleKbpsDelay {
        if self.blocked {
            HandleKbpsDelay {
                throttle_rate_kbps: 0,
                ..self.configured
            }
        } else {
            self.configured
        }
    }
}

/// One loaded and attached copy of the shaping program.
#[async_trait]
pub trait ShapingProgram: Send + Sized + 'static {
    fn put_v4(&mut self, addr: Ipv4Addr, entry: HandleKbpsDelay) -> Result<()>;
    fn put_v6(&mut self, addr: Ipv6Addr, entry: HandleKbpsDelay) -> Result<()>;
    /// Removing an address that has no entry succeeds.
    fn remove_v4(&mut self, addr: Ipv4Addr) -> Result<()>;
    fn remove_v6(&mut self, addr: Ipv6Addr) -> Result<()>;
    /// Counters summed over all CPUs.
    fn stats(&self) -> Result<ShaperStats>;
    /// Detaches the program and removes the qdiscs it installed.
    async fn close(self) -> Result<()>;
}

#[async_trait]
pub trait ShapingBackend: Send + Sync + 'static {
    type Program: ShapingProgram;

    async fn load(&self, iface: &str, control: ShaperControl) -> Result<Self::Program>;
}

struct Machine<P> {
    iface: String,
    program: P,
    links: BTreeMap<Ipv4Subnet, LinkEntry>,
    /// Every address in the kernel maps and the entry it holds there. The
    /// v6 map holds the same entries under the embedded addresses.
    written: HashMap<Ipv4Addr, HandleKbpsDelay>,
}

impl<P: ShapingProgram> Machine<P> {
    /// Addresses of `subnet` that would take a new slot in the maps.
    fn fresh(&self, subnet: Ipv4Subnet) -> usize {
        subnet
            .addresses()
            .filter(|addr| !self.written.contains_key(addr))
            .count()
    }

    /// Writes `entry` for every address of `subnet`. On failure the
    /// addresses touched so far get their previous entry back.
    fn write(&mut self, subnet: Ipv4Subnet, entry: HandleKbpsDelay) -> Result<()> {
        for (done, addr) in subnet.addresses().enumerate() {
            if let Err(err) = self.put(addr, entry) {
                self.restore(subnet.addresses().take(done + 1));
                return Err(err);
            }
        }
        self.written.extend(subnet.addresses().map(|addr| (addr, entry)));
        Ok(())
    }

    fn put(&mut self, addr: Ipv4Addr, entry: HandleKbpsDelay) -> Result<()> {
        self.program.put_v4(addr, entry)?;
        self.program.put_v6(embed_v4(addr), entry)
    }

    fn restore(&mut self, addrs: impl Iterator<Item = Ipv4Addr>) {
        for addr in addrs {
            let restored = match self.written.get(&addr).copied() {
                Some(previous) => self.put(addr, previous),
                None => self
                    .program
                    .remove_v4(addr)
                    .and_then(|()| self.program.remove_v6(embed_v4(addr))),
            };
            if let Err(err) = restored {
                tracing::warn!(iface = %self.iface, %addr, %err, "failed to restore shaping entry");
            }
        }
    }
}

pub struct ShapingEngine<B: ShapingBackend = EbpfBackend> {
    backend: B,
    control: ShaperControl,
    machines: RwLock<HashMap<MachineId, Mutex<Machine<B::Program>>>>,
}

impl ShapingEngine<EbpfBackend> {
    pub fn new(control: ShaperControl) -> Self {
        Self::with_backend(EbpfBackend, control)
    }
}

impl<B: ShapingBackend> ShapingEngine<B> {
    pub fn with_backend(backend: B, control: ShaperControl) -> Self {
        Self {
            backend,
            control,
            machines: RwLock::new(HashMap::new()),
        }
    }

    /// Loads and attaches a shaping program on `iface` for `machine`.
    pub async fn register(&self, machine: MachineId, iface: &str) -> Result<()> {
        if self.machines.read().contains_key(&machine) {
            return Err(ShapingError::AlreadyRegistered(machine));
        }

        let program = self.backend.load(iface, self.control).await?;

        let raced = {
            let mut machines = self.machines.write();
            match machines.entry(machine) {
                Entry::Occupied(_) => Some(program),
                Entry::Vacant(slot) => {
                    slot.insert(Mutex::new(Machine {
                        iface: iface.to_string(),
                        program,
                        links: BTreeMap::new(),
                        written: HashMap::new(),
                    }));
                    None
                }
            }
        };
        if let Some(program) = raced {
            if let Err(err) = program.close().await {
                tracing::warn!(%machine, iface, %err, "failed to release duplicate program");
            }
            return Err(ShapingError::AlreadyRegistered(machine));
        }

        tracing::info!(%machine, iface, "machine registered for shaping");
        Ok(())
    }

    /// Sets the rate towards every address of `subnet`. Zero drops all
    /// traffic. While the link is blocked only the remembered rate changes.
    pub fn set_bandwidth(&self, machine: MachineId, subnet: Ipv4Subnet, kbps: u32) -> Result<()> {
        self.update(machine, subnet, |link| link.configured.throttle_rate_kbps = kbps)
    }

    pub fn set_latency(&self, machine: MachineId, subnet: Ipv4Subnet, us: u32) -> Result<()> {
        self.update(machine, subnet, |link| link.configured.delay_us = us)
    }

    pub fn block_link(&self, machine: MachineId, subnet: Ipv4Subnet) -> Result<()> {
        self.update(machine, subnet, |link| link.blocked = true)
    }

    pub fn unblock_link(&self, machine: MachineId, subnet: Ipv4Subnet) -> Result<()> {
        self.update(machine, subnet, |link| link.blocked = false)
    }

    fn update(
        &self,
        machine: MachineId,
        subnet: Ipv4Subnet,
        apply: impl FnOnce(&mut LinkEntry),
    ) -> Result<()> {
        if subnet.len() > SHAPING_MAP_ENTRIES as u64 {
            return Err(ShapingError::SubnetTooLarge {
                subnet,
                max: SHAPING_MAP_ENTRIES,
            });
        }

        let machines = self.machines.read();
        let mut state = machines
            .get(&machine)
            .ok_or(ShapingError::UnknownMachine(machine))?
            .lock();

        let needed = state.fresh(subnet);
        let free = (SHAPING_MAP_ENTRIES as usize).saturating_sub(state.written.len());
        if needed > free {
            return Err(ShapingError::MapFull {
                machine,
                subnet,
                needed,
                free,
            });
        }

        let mut link = state.links.get(&subnet).copied().unwrap_or_default();
        apply(&mut link);
        let entry = link.effective();
        state.write(subnet, entry)?;
        state.links.insert(subnet, link);

        tracing::debug!(
            %machine,
            iface = %state.iface,
            %subnet,
            rate_kbps = entry.throttle_rate_kbps,
            delay_us = entry.delay_us,
            blocked = link.blocked,
            "shaping entry written"
        );
        Ok(())
    }

    pub fn entry(&self, machine: MachineId, subnet: Ipv4Subnet) -> Result<Option<LinkEntry>> {
        let machines = self.machines.read();
        let state = machines
            .get(&machine)
            .ok_or(ShapingError::UnknownMachine(machine))?
            .lock();
        Ok(state.links.get(&subnet).copied())
    }

    pub fn stats(&self, machine: MachineId) -> Result<ShaperStats> {
        let machines = self.machines.read();
        let state = machines
            .get(&machine)
            .ok_or(ShapingError::UnknownMachine(machine))?
            .lock();
        state.program.stats()
    }

    pub fn machines(&self) -> Vec<MachineId> {
        let mut ids: Vec<_> = self.machines.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Releases every machine's kernel resources. All machines are tried;
    /// the first failure is returned.
    pub async fn stop(&self) -> Result<()> {
        let machines: Vec<_> = self.machines.write().drain().collect();

        let mut first_err = None;
        for (id, machine) in machines {
            let Machine { iface, program, .. } = machine.into_inner();
            match program.close().await {
                Ok(()) => tracing::info!(machine = %id, %iface, "shaping removed"),
                Err(err) => {
                    tracing::warn!(machine = %id, %iface, %err, "failed to remove shaping");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! Map-less stand-in for the kernel program.

    use std::sync::Arc;

    use super::*;

    #[derive(Debug, Default)]
    pub struct State {
        pub control: Option<ShaperControl>,
        pub v4: HashMap<Ipv4Addr, HandleKbpsDelay>,
        pub v6: HashMap<Ipv6Addr, HandleKbpsDelay>,
        pub stats: ShaperStats,
        pub closed: bool,
        /// Inserting a new v4 key past this many entries fails.
        pub v4_capacity: Option<usize>,
    }

    /// Loads fail on interfaces named `missing*`; closes fail on `stuck*`.
    #[derive(Clone, Default)]
    pub struct MemoryBackend {
        pub loaded: Arc<Mutex<HashMap<String, Arc<Mutex<State>>>>>,
    }

    impl MemoryBackend {
        pub fn state(&self, iface: &str) -> Arc<Mutex<State>> {
            self.loaded.lock()[iface].clone()
        }
    }

    pub struct MemoryProgram {
        iface: String,
        state: Arc<Mutex<State>>,
    }

    #[async_trait]
    impl ShapingBackend for MemoryBackend {
        type Program = MemoryProgram;

        async fn load(&self, iface: &str, control: ShaperControl) -> Result<MemoryProgram> {
            if iface.starts_with("missing") {
                return Err(ShapingError::Attach(crate::tc::interface_index(iface).unwrap_err()));
            }
            let state = Arc::new(Mutex::new(State {
                control: Some(control),
                ..State::default()
            }));
            self.loaded.lock().insert(iface.to_string(), state.clone());
            Ok(MemoryProgram {
                iface: iface.to_string(),
                state,
            })
        }
    }

    #[async_trait]
    impl ShapingProgram for MemoryProgram {
        fn put_v4(&mut self, addr: Ipv4Addr, entry: HandleKbpsDelay) -> Result<()> {
            let mut state = self.state.lock();
            let len = state.v4.len();
            let capacity = state.v4_capacity;
            match capacity {
                Some(max) if len >= max && !state.v4.contains_key(&addr) => {
                    Err(ShapingError::Map {
                        name: orbit_netem_common::MAP_IPV4_SHAPING,
                        source: aya::maps::MapError::OutOfBounds {
                            index: len as u32,
                            max_entries: max as u32,
                        },
                    })
                }
                _ => {
                    state.v4.insert(addr, entry);
                    Ok(())
                }
            }
        }

        fn put_v6(&mut self, addr: Ipv6Addr, entry: HandleKbpsDelay) -> Result<()> {
            self.state.lock().v6.insert(addr, entry);
            Ok(())
        }

        fn remove_v4(&mut self, addr: Ipv4Addr) -> Result<()> {
            self.state.lock().v4.remove(&addr);
            Ok(())
        }

        fn remove_v6(&mut self, addr: Ipv6Addr) -> Result<()> {
            self.state.lock().v6.remove(&addr);
            Ok(())
        }

        fn stats(&self) -> Result<ShaperStats> {
            Ok(self.state.lock().stats)
        }

        async fn close(self) -> Result<()> {
            self.state.lock().closed = true;
            if self.iface.starts_with("stuck") {
                return Err(ShapingError::MissingMap("stuck"));
            }
            Ok(())
        }
    }
}
