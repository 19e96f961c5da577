#![no_std]
#![no_main]

// EDT shaper attached to the egress hook of an emulated machine's interface.
//
// Map layouts (all keys are addresses in network byte order):
//   IP_HANDLE_KBPS_DELAY    u32      -> HandleKbpsDelay   written by user space
//   IPV6_HANDLE_KBPS_DELAY  [u8; 16] -> HandleKbpsDelay   written by user space
//   IPV4_FLOW_MAP           u32      -> u64 last departure (ns)
//   IPV6_FLOW_MAP           [u8; 16] -> u64 last departure (ns)
//   SHAPER_CONTROL          [0]      -> ShaperControl     written once at load
//   SHAPER_STATS            per-cpu  -> ShaperStats

use core::sync::atomic::AtomicU64;

use aya_ebpf::bindings::{BPF_NOEXIST, TC_ACT_OK, TC_ACT_SHOT};
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::helpers::gen::bpf_skb_ecn_set_ce;
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::{Array, HashMap, PerCpuArray};
use aya_ebpf::programs::TcContext;
use orbit_netem_common::edt::{self, DropReason, Verdict};
use orbit_netem_common::{
    CONTROL_SLOT_RUNTIME, FLOW_MAP_ENTRIES, HandleKbpsDelay, SHAPING_MAP_ENTRIES, ShaperControl,
    ShaperStats,
};

const ETH_HDR_SIZE: usize = 14;
const IPV4_MIN_HEADER_BYTES: usize = 20;
const IPV6_HEADER_BYTES: usize = 40;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

#[map(name = "IP_HANDLE_KBPS_DELAY")]
static IP_HANDLE_KBPS_DELAY: HashMap<u32, HandleKbpsDelay> =
    HashMap::<u32, HandleKbpsDelay>::with_max_entries(SHAPING_MAP_ENTRIES, 0);

#[map(name = "IPV6_HANDLE_KBPS_DELAY")]
static IPV6_HANDLE_KBPS_DELAY: HashMap<[u8; 16], HandleKbpsDelay> =
    HashMap::<[u8; 16], HandleKbpsDelay>::with_max_entries(SHAPING_MAP_ENTRIES, 0);

#[map(name = "IPV4_FLOW_MAP")]
static IPV4_FLOW_MAP: HashMap<u32, u64> =
    HashMap::<u32, u64>::with_max_entries(FLOW_MAP_ENTRIES, 0);

#[map(name = "IPV6_FLOW_MAP")]
static IPV6_FLOW_MAP: HashMap<[u8; 16], u64> =
    HashMap::<[u8; 16], u64>::with_max_entries(FLOW_MAP_ENTRIES, 0);

#[map(name = "SHAPER_CONTROL")]
static SHAPER_CONTROL: Array<ShaperControl> = Array::<ShaperControl>::with_max_entries(1, 0);

#[map(name = "SHAPER_STATS")]
static SHAPER_STATS: PerCpuArray<ShaperStats> = PerCpuArray::<ShaperStats>::with_max_entries(1, 0);

#[classifier]
pub fn tc_edt(ctx: TcContext) -> i32 {
    let data = ctx.data() as *const u8;
    let data_end = ctx.data_end() as *const u8;

    if unsafe { data.add(ETH_HDR_SIZE) } > data_end {
        return TC_ACT_OK;
    }

    const H_PROTO_OFFSET: usize = 12;
    let h_proto = unsafe {
        let p = data.add(H_PROTO_OFFSET) as *const u16;
        u16::from_be(core::ptr::read_unaligned(p))
    };

    let control = control();

    match h_proto {
        ETH_P_IP => shape_ipv4(&ctx, data, data_end, &control),
        ETH_P_IPV6 => shape_ipv6(&ctx, data, data_end, &control),
        _ => TC_ACT_OK,
    }
}

fn shape_ipv4(ctx: &TcContext, data: *const u8, data_end: *const u8, control: &ShaperControl) -> i32 {
    if unsafe { data.add(ETH_HDR_SIZE + IPV4_MIN_HEADER_BYTES) } > data_end {
        return TC_ACT_OK;
    }

    let ip_start = unsafe { data.add(ETH_HDR_SIZE) };
    if unsafe { *ip_start } >> 4 != 4 {
        return TC_ACT_OK;
    }

    let proto = unsafe { *ip_start.add(9) };
    if !matches!(proto, PROTO_ICMP | PROTO_TCP | PROTO_UDP) {
        return TC_ACT_OK;
    }

    // Left in network byte order: user space keys the maps the same way.
    let offset = if control.match_source() { 12 } else { 16 };
    let key = unsafe { core::ptr::read_unaligned(ip_start.add(offset) as *const u32) };

    let Some(entry) = (unsafe { IP_HANDLE_KBPS_DELAY.get(&key) }) else {
        record(|s| s.passed += 1);
        return TC_ACT_OK;
    };
    let entry = *entry;

    let ret = throttle(ctx, &IPV4_FLOW_MAP, &key, entry.throttle_rate_kbps, control);
    if ret != TC_ACT_OK {
        return ret;
    }
    inject_delay(ctx, entry.delay_us)
}

fn shape_ipv6(ctx: &TcContext, data: *const u8, data_end: *const u8, control: &ShaperControl) -> i32 {
    if unsafe { data.add(ETH_HDR_SIZE + IPV6_HEADER_BYTES) } > data_end {
        return TC_ACT_OK;
    }

    let ip_start = unsafe { data.add(ETH_HDR_SIZE) };
    let next_header = unsafe { *ip_start.add(6) };
    if !matches!(next_header, PROTO_ICMPV6 | PROTO_TCP | PROTO_UDP) {
        return TC_ACT_OK;
    }

    let offset = if control.match_source() { 8 } else { 24 };
    let key = unsafe { core::ptr::read_unaligned(ip_start.add(offset) as *const [u8; 16]) };

    let Some(entry) = (unsafe { IPV6_HANDLE_KBPS_DELAY.get(&key) }) else {
        record(|s| s.passed += 1);
        return TC_ACT_OK;
    };
    let entry = *entry;

    let ret = throttle(ctx, &IPV6_FLOW_MAP, &key, entry.throttle_rate_kbps, control);
    if ret != TC_ACT_OK {
        return ret;
    }
    inject_delay(ctx, entry.delay_us)
}

/// Bandwidth stage. The flow's last departure is shared by every CPU and
/// advanced through [`edt::reserve`].
fn throttle<K>(
    ctx: &TcContext,
    flows: &HashMap<K, u64>,
    key: &K,
    rate_kbps: u32,
    control: &ShaperControl,
) -> i32 {
    let limits = control.limits();
    let len = ctx.len();
    let now = unsafe { bpf_ktime_get_ns() };
    let skb_tstamp = unsafe { (*ctx.skb.skb).tstamp };

    if flows.get_ptr_mut(key).is_none() {
        let verdict = edt::schedule(now, skb_tstamp, None, len, rate_kbps, &limits);
        let Verdict::Send { departure, .. } = verdict else {
            return finish(ctx, verdict);
        };
        // Another CPU may have created the entry in the meantime, in which
        // case the slot is reserved against its departure below. A full map
        // leaves the flow without history.
        if flows.insert(key, &departure, BPF_NOEXIST as u64).is_ok() {
            return finish(ctx, verdict);
        }
        if flows.get_ptr_mut(key).is_none() {
            return finish(ctx, verdict);
        }
    }

    let Some(ptr) = flows.get_ptr_mut(key) else {
        return TC_ACT_OK;
    };
    let last_departure = unsafe { AtomicU64::from_ptr(ptr) };
    let reservation = edt::reserve(last_departure, now, skb_tstamp, len, rate_kbps, &limits);
    if reservation.contended {
        record(|s| s.contended += 1);
    }
    finish(ctx, reservation.verdict)
}

fn finish(ctx: &TcContext, verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Drop(DropReason::Blocked) => {
            record(|s| s.dropped_blocked += 1);
            TC_ACT_SHOT
        }
        Verdict::Drop(DropReason::Horizon) => {
            record(|s| s.dropped_horizon += 1);
            TC_ACT_SHOT
        }
        Verdict::Send {
            departure,
            congested,
        } => {
            if congested {
                unsafe { bpf_skb_ecn_set_ce(ctx.skb.skb as *mut _) };
                record(|s| s.ce_marked += 1);
            }
            unsafe { (*ctx.skb.skb).tstamp = departure };
            record(|s| s.shaped += 1);
            TC_ACT_OK
        }
    }
}

/// Latency stage.
fn inject_delay(ctx: &TcContext, delay_us: u32) -> i32 {
    let now = unsafe { bpf_ktime_get_ns() };
    unsafe {
        let skb = ctx.skb.skb;
        (*skb).tstamp = edt::inject_delay((*skb).tstamp, now, delay_us);
    }
    TC_ACT_OK
}

fn control() -> ShaperControl {
    match SHAPER_CONTROL.get(CONTROL_SLOT_RUNTIME) {
        Some(control) => *control,
        None => ShaperControl::default(),
    }
}

fn record(update: impl FnOnce(&mut ShaperStats)) {
    if let Some(ptr) = SHAPER_STATS.get_ptr_mut(CONTROL_SLOT_RUNTIME) {
        update(unsafe { &mut *ptr });
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
