#![cfg_attr(not(test), no_std)]

// Types shared between the shaping engine and the tc classifier.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub mod edt;

pub const MAP_IPV4_SHAPING: &str = "IP_HANDLE_KBPS_DELAY";
pub const MAP_IPV6_SHAPING: &str = "IPV6_HANDLE_KBPS_DELAY";
pub const MAP_IPV4_FLOWS: &str = "IPV4_FLOW_MAP";
pub const MAP_IPV6_FLOWS: &str = "IPV6_FLOW_MAP";
pub const MAP_CONTROL: &str = "SHAPER_CONTROL";
pub const MAP_STATS: &str = "SHAPER_STATS";
pub const TC_PROGRAM: &str = "tc_edt";

pub const SHAPING_MAP_ENTRIES: u32 = 65535;
pub const FLOW_MAP_ENTRIES: u32 = 65535;
pub const CONTROL_SLOT_RUNTIME: u32 = 0;

pub const DEFAULT_BANDWIDTH_KBPS: u32 = 1_000_000;
pub const DEFAULT_LATENCY_US: u32 = 0;

/// Shaping parameters for one destination address. Mirrors the kernel map
/// value byte for byte.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HandleKbpsDelay {
    /// 0 drops everything.
    pub throttle_rate_kbps: u32,
    pub delay_us: u32,
}

impl Default for HandleKbpsDelay {
    fn default() -> Self {
        Self {
            throttle_rate_kbps: DEFAULT_BANDWIDTH_KBPS,
            delay_us: DEFAULT_LATENCY_US,
        }
    }
}

/// Which address in the network header selects the shaping entry.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyField {
    Destination = 0,
    Source = 1,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShaperControl {
    pub horizon_ns: u64,
    pub ce_threshold_ns: u64,
    /// A [`KeyField`] discriminant.
    pub key_field: u8,
    pub reserved: [u8; 7],
}

impl Default for ShaperControl {
    fn default() -> Self {
        Self {
            horizon_ns: edt::TIME_HORIZON_NS,
            ce_threshold_ns: edt::CE_THRESHOLD_NS,
            key_field: KeyField::Destination as u8,
            reserved: [0; 7],
        }
    }
}

impl ShaperControl {
    pub fn limits(&self) -> edt::Limits {
        edt::Limits {
            horizon_ns: self.horizon_ns,
            ce_threshold_ns: self.ce_threshold_ns,
        }
    }

    pub fn match_source(&self) -> bool {
        self.key_field == KeyField::Source as u8
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ShaperStats {
    pub shaped: u64,
    pub passed: u64,
    pub dropped_blocked: u64,
    pub dropped_horizon: u64,
    pub ce_marked: u64,
    /// Packets whose departure slot was appended after losing every
    /// compare-exchange to other CPUs.
    pub contended: u64,
}

impl ShaperStats {
    pub fn merge(&mut self, other: &Self) {
        self.shaped = self.shaped.wrapping_add(other.shaped);
        self.passed = self.passed.wrapping_add(other.passed);
        self.dropped_blocked = self.dropped_blocked.wrapping_add(other.dropped_blocked);
        self.dropped_horizon = self.dropped_horizon.wrapping_add(other.dropped_horizon);
        self.ce_marked = self.ce_marked.wrapping_add(other.ce_marked);
        self.contended = self.contended.wrapping_add(other.contended);
    }
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{HandleKbpsDelay, ShaperControl, ShaperStats};
    use aya::Pod;

    unsafe impl Pod for HandleKbpsDelay {}
    unsafe impl Pod for ShaperControl {}
    unsafe impl Pod for ShaperStats {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shaping_entry_layout_matches_kernel_struct() {
        assert_eq!(core::mem::size_of::<HandleKbpsDelay>(), 8);
        assert_eq!(core::mem::align_of::<HandleKbpsDelay>(), 4);
    }

    #[test]
    fn control_defaults_key_on_destination() {
        let control = ShaperControl::default();
        assert!(!control.match_source());
        assert_eq!(control.limits().horizon_ns, 2_000_000_000);
        assert!(control.limits().ce_threshold_ns < control.limits().horizon_ns);
    }

    #[test]
    fn merge_accumulates_every_counter() {
        let mut total = ShaperStats::default();
        let cpu = ShaperStats {
            shaped: 3,
            passed: 2,
            dropped_blocked: 1,
            dropped_horizon: 4,
            ce_marked: 5,
            contended: 6,
        };
        total.merge(&cpu);
        total.merge(&cpu);
        assert_eq!(total.shaped, 6);
        assert_eq!(total.passed, 4);
        assert_eq!(total.dropped_blocked, 2);
        assert_eq!(total.dropped_horizon, 8);
        assert_eq!(total.ce_marked, 10);
        assert_eq!(total.contended, 12);
    }
}
