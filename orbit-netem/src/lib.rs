//! Network emulation for satellite constellation testbeds.
//!
//! Two engines run on every host: [`peering::PeeringService`] keeps a
//! WireGuard mesh to all other hosts and routes machine subnets over it, and
//! [`shaping::ShapingEngine`] enforces per-destination bandwidth and latency
//! with an earliest-departure-time tc program.

pub mod addr;
pub mod command;
pub mod control;
pub mod ebpf_loader;
pub mod keys;
pub mod peering;
pub mod probe;
pub mod shaping;
pub mod tc;

/// Coarse classification of every library error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input: malformed subnet, id out of range, unknown host or machine.
    Configuration,
    /// Something this host lacks: a tool, an interface, the kernel program.
    Resource,
    /// An external call that may succeed when retried.
    TransientExternal,
    /// Kernel objects in an unexpected state, such as a qdisc that already
    /// exists or a map write that was refused.
    KernelState,
}
