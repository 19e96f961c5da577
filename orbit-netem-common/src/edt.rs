//! Earliest-departure-time arithmetic used by the tc classifier.
//!
//! The classifier never queues packets itself. It stamps `skb->tstamp` with the
//! earliest time the packet may leave and lets the `fq` qdisc hold it until
//! then. Everything here is pure so the same code runs in the kernel program
//! and in host-side tests.

use core::sync::atomic::{AtomicU64, Ordering};

pub const NS_PER_SEC: u64 = 1_000_000_000;
pub const NS_PER_US: u64 = 1_000;

/// Packets that would have to wait longer than this are dropped.
pub const TIME_HORIZON_NS: u64 = 2_000 * 1_000 * 1_000;
/// Packets that have to wait longer than this are marked CE.
pub const CE_THRESHOLD_NS: u64 = 5 * 1_000 * 1_000;

/// Compare-exchange attempts on a flow before its slot is appended instead.
pub const RESERVE_ATTEMPTS: u32 = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Limits {
    pub horizon_ns: u64,
    pub ce_threshold_ns: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            horizon_ns: TIME_HORIZON_NS,
            ce_threshold_ns: CE_THRESHOLD_NS,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The destination has a throttle rate of zero.
    Blocked,
    /// The backlog for the destination exceeds the horizon.
    Horizon,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Drop(DropReason),
    /// Forward with `departure` as the packet timestamp. `departure` is also
    /// the new last-departure value for the flow.
    Send { departure: u64, congested: bool },
}

/// Time needed to serialize `len` bytes at `rate_kbps` kbit/s, in ns.
///
/// `rate_kbps` must be non-zero.
pub fn transmit_time_ns(len: u32, rate_kbps: u32) -> u64 {
    (len as u64) * 8 * NS_PER_SEC / ((rate_kbps as u64) * 1000)
}

/// Bandwidth stage for one packet.
///
/// `last` is the flow's previous departure, `None` when the destination has no
/// history yet.
pub fn schedule(
    now: u64,
    skb_tstamp: u64,
    last: Option<u64>,
    len: u32,
    rate_kbps: u32,
    limits: &Limits,
) -> Verdict {
    if rate_kbps == 0 {
        return Verdict::Drop(DropReason::Blocked);
    }

    let tstamp = if skb_tstamp < now { now } else { skb_tstamp };

    let next = match last {
        Some(last) => last.saturating_add(transmit_time_ns(len, rate_kbps)),
        None => 0,
    };

    if next <= tstamp {
        return Verdict::Send {
            departure: tstamp,
            congested: false,
        };
    }

    let gap = next - now;
    if gap >= limits.horizon_ns {
        return Verdict::Drop(DropReason::Horizon);
    }

    Verdict::Send {
        departure: next,
        congested: gap >= limits.ce_threshold_ns,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reservation {
    pub verdict: Verdict,
    /// Every compare-exchange was lost and the slot was appended with an
    /// atomic add.
    pub contended: bool,
}

/// Bandwidth stage against a flow's shared last-departure word.
///
/// The new departure is published with a compare-exchange so packets to one
/// destination on different CPUs each get their own slot. After
/// [`RESERVE_ATTEMPTS`] lost races the slot is appended to whatever was
/// reserved last, which always succeeds. Only the verdict itself drops a
/// packet.
pub fn reserve(
    last_departure: &AtomicU64,
    now: u64,
    skb_tstamp: u64,
    len: u32,
    rate_kbps: u32,
    limits: &Limits,
) -> Reservation {
    for _ in 0..RESERVE_ATTEMPTS {
        let last = last_departure.load(Ordering::Relaxed);
        let verdict = schedule(now, skb_tstamp, Some(last), len, rate_kbps, limits);
        let Verdict::Send { departure, .. } = verdict else {
            return Reservation {
                verdict,
                contended: false,
            };
        };
        if last_departure
            .compare_exchange(last, departure, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Reservation {
                verdict,
                contended: false,
            };
        }
    }

    Reservation {
        verdict: append(last_departure, now, skb_tstamp, len, rate_kbps, limits),
        contended: true,
    }
}

/// Takes the slot one transmit time after the last reserved departure.
///
/// A flow that went idle in the meantime departs at `now` but keeps the
/// shorter reservation, so the next packet may leave early by at most one
/// transmit time.
fn append(
    last_departure: &AtomicU64,
    now: u64,
    skb_tstamp: u64,
    len: u32,
    rate_kbps: u32,
    limits: &Limits,
) -> Verdict {
    if rate_kbps == 0 {
        return Verdict::Drop(DropReason::Blocked);
    }
    let tx = transmit_time_ns(len, rate_kbps);
    let last = last_departure.fetch_add(tx, Ordering::AcqRel);
    let verdict = schedule(now, skb_tstamp, Some(last), len, rate_kbps, limits);
    if let Verdict::Drop(_) = verdict {
        last_departure.fetch_sub(tx, Ordering::AcqRel);
    }
    verdict
}

/// Latency stage: push the timestamp out by the fixed extra delay.
pub fn inject_delay(tstamp: u64, now: u64, delay_us: u32) -> u64 {
    let delay_ns = (delay_us as u64) * NS_PER_US;
    if tstamp == 0 {
        now.saturating_add(delay_ns)
    } else {
        tstamp.saturating_add(delay_ns)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const NOW: u64 = 1_000 * NS_PER_SEC;

    /// Host-side stand-in for the per-destination flow table.
    #[derive(Default)]
    struct Flows(HashMap<u32, u64>);

    impl Flows {
        fn send(&mut self, dst: u32, now: u64, len: u32, rate: u32) -> Verdict {
            let verdict = schedule(now, 0, self.0.get(&dst).copied(), len, rate, &Limits::default());
            if let Verdict::Send { departure, .. } = verdict {
                self.0.insert(dst, departure);
            }
            verdict
        }
    }

    #[test]
    fn transmit_time_uses_bits() {
        // 1250 bytes = 10_000 bits; at 1000 kbit/s that is 10 ms.
        assert_eq!(transmit_time_ns(1250, 1000), 10_000_000);
        assert_eq!(transmit_time_ns(1500, 1_000_000), 12_000);
    }

    #[test]
    fn zero_rate_drops_regardless_of_history() {
        assert_eq!(
            schedule(NOW, 0, None, 64, 0, &Limits::default()),
            Verdict::Drop(DropReason::Blocked)
        );
        assert_eq!(
            schedule(NOW, NOW + 5, Some(NOW), 64, 0, &Limits::default()),
            Verdict::Drop(DropReason::Blocked)
        );
    }

    #[test]
    fn first_packet_departs_now() {
        assert_eq!(
            schedule(NOW, 0, None, 1500, 1000, &Limits::default()),
            Verdict::Send {
                departure: NOW,
                congested: false
            }
        );
    }

    #[test]
    fn burst_is_spaced_by_transmit_time() {
        let mut flows = Flows::default();
        let tx = transmit_time_ns(1250, 100_000);
        assert_eq!(tx, 100_000);

        let mut previous = None;
        for k in 0..60u64 {
            let Verdict::Send {
                departure,
                congested,
            } = flows.send(7, NOW, 1250, 100_000)
            else {
                panic!("packet {k} dropped");
            };
            assert_eq!(departure, NOW + k * tx);
            if let Some(previous) = previous {
                assert!(departure > previous);
            }
            // 5 ms of backlog is reached at the 50th packet.
            assert_eq!(congested, k >= 50, "packet {k}");
            previous = Some(departure);
        }
    }

    #[test]
    fn backlog_past_horizon_is_dropped() {
        let mut flows = Flows::default();
        // 10 ms per packet, so packet 200 would wait exactly 2 s.
        for k in 0..200 {
            assert!(
                matches!(flows.send(1, NOW, 1250, 1000), Verdict::Send { .. }),
                "packet {k}"
            );
        }
        assert_eq!(
            flows.send(1, NOW, 1250, 1000),
            Verdict::Drop(DropReason::Horizon)
        );
        // Dropped packets do not advance the flow, so later ones drop too.
        assert_eq!(
            flows.send(1, NOW, 1250, 1000),
            Verdict::Drop(DropReason::Horizon)
        );
        // Once the clock catches up the flow sends again.
        assert!(matches!(
            flows.send(1, NOW + NS_PER_SEC, 1250, 1000),
            Verdict::Send { .. }
        ));
    }

    #[test]
    fn flows_are_independent_per_destination() {
        let mut flows = Flows::default();
        for _ in 0..10 {
            flows.send(1, NOW, 1250, 1000);
        }
        assert_eq!(
            flows.send(2, NOW, 1250, 1000),
            Verdict::Send {
                departure: NOW,
                congested: false
            }
        );
    }

    #[test]
    fn idle_flow_restarts_at_now() {
        let last = NOW - NS_PER_SEC;
        assert_eq!(
            schedule(NOW, 0, Some(last), 1500, 1000, &Limits::default()),
            Verdict::Send {
                departure: NOW,
                congested: false
            }
        );
    }

    #[test]
    fn later_skb_timestamp_is_kept() {
        let stamped = NOW + 3_000;
        assert_eq!(
            schedule(NOW, stamped, None, 1500, 1000, &Limits::default()),
            Verdict::Send {
                departure: stamped,
                congested: false
            }
        );
    }

    #[test]
    fn departures_never_go_backwards() {
        let mut flows = Flows::default();
        let mut last = 0;
        for step in 0..100u64 {
            let now = NOW + step * 7_000;
            if let Verdict::Send { departure, .. } = flows.send(9, now, 900, 50_000) {
                assert!(departure >= last);
                last = departure;
            }
        }
    }

    #[test]
    fn concurrent_reservations_get_distinct_spaced_slots() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 200;
        // 100 us per packet; 1600 packets stay well inside the horizon.
        let tx = transmit_time_ns(1250, 100_000);
        let flow = AtomicU64::new(NOW - tx);
        let limits = Limits::default();

        let mut departures: Vec<u64> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| match reserve(&flow, NOW, 0, 1250, 100_000, &limits).verdict {
                                Verdict::Send { departure, .. } => departure,
                                Verdict::Drop(reason) => panic!("dropped: {reason:?}"),
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        departures.sort_unstable();
        let expected: Vec<u64> = (0..THREADS * PER_THREAD).map(|k| NOW + k * tx).collect();
        assert_eq!(departures, expected);
        assert_eq!(flow.load(Ordering::Relaxed), NOW + (THREADS * PER_THREAD - 1) * tx);
    }

    #[test]
    fn uncontended_reservation_matches_schedule() {
        let flow = AtomicU64::new(NOW);
        let limits = Limits::default();
        let reservation = reserve(&flow, NOW, 0, 1250, 1000, &limits);
        assert_eq!(
            reservation,
            Reservation {
                verdict: Verdict::Send {
                    departure: NOW + 10_000_000,
                    congested: true,
                },
                contended: false,
            }
        );
        assert_eq!(flow.load(Ordering::Relaxed), NOW + 10_000_000);

        let blocked = reserve(&flow, NOW, 0, 1250, 0, &limits);
        assert_eq!(blocked.verdict, Verdict::Drop(DropReason::Blocked));
        assert_eq!(flow.load(Ordering::Relaxed), NOW + 10_000_000);
    }

    #[test]
    fn appended_slot_follows_the_last_reservation() {
        let tx = transmit_time_ns(1250, 100_000);
        let flow = AtomicU64::new(NOW + 5 * tx);
        assert_eq!(
            append(&flow, NOW, 0, 1250, 100_000, &Limits::default()),
            Verdict::Send {
                departure: NOW + 6 * tx,
                congested: false,
            }
        );
        assert_eq!(flow.load(Ordering::Relaxed), NOW + 6 * tx);
    }

    #[test]
    fn appended_slot_past_horizon_is_given_back() {
        let limits = Limits::default();
        let busy = NOW + limits.horizon_ns;
        let flow = AtomicU64::new(busy);
        assert_eq!(
            append(&flow, NOW, 0, 1250, 1000, &limits),
            Verdict::Drop(DropReason::Horizon)
        );
        assert_eq!(flow.load(Ordering::Relaxed), busy);
        assert_eq!(
            append(&flow, NOW, 0, 1250, 0, &limits),
            Verdict::Drop(DropReason::Blocked)
        );
        assert_eq!(flow.load(Ordering::Relaxed), busy);
    }

    #[test]
    fn delay_initialises_unset_timestamp() {
        assert_eq!(inject_delay(0, NOW, 250), NOW + 250_000);
        assert_eq!(inject_delay(NOW + 10, NOW, 250), NOW + 10 + 250_000);
        assert_eq!(inject_delay(NOW, NOW, 0), NOW);
    }
}
