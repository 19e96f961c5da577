use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use aya::maps::{Array, HashMap, Map, MapData, MapError, PerCpuArray};
use aya::programs::tc::{
    NlOptions, SchedClassifier, SchedClassifierLinkId, TcAttachOptions, TcAttachType,
};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};

use orbit_netem_common::{
    CONTROL_SLOT_RUNTIME, HandleKbpsDelay, MAP_CONTROL, MAP_IPV4_SHAPING, MAP_IPV6_SHAPING,
    MAP_STATS, ShaperControl, ShaperStats, TC_PROGRAM,
};

use crate::shaping::{Result, ShapingBackend, ShapingError, ShapingProgram};
use crate::tc::{self, AttachError, Netlink, Qdisc};

/// Empty unless built with the `ebpf` feature.
const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/orbit-netem"));

const TC_PRIORITY: u16 = 1;
const TC_HANDLE: u32 = 1;

/// Loads the tc program from the object embedded at build time.
#[derive(Debug, Default, Clone, Copy)]
pub struct EbpfBackend;

#[async_trait]
impl ShapingBackend for EbpfBackend {
    type Program = EbpfProgram;

    async fn load(&self, iface: &str, control: ShaperControl) -> Result<EbpfProgram> {
        if EBPF_BYTES.is_empty() {
            return Err(ShapingError::ProgramUnavailable);
        }
        let if_index = tc::interface_index(iface)?;

        let mut bpf = EbpfLoader::new()
            .load(EBPF_BYTES)
            .map_err(ShapingError::Load)?;
        write_control_config(&mut bpf, control)?;

        let v4 = HashMap::try_from(take_map(&mut bpf, MAP_IPV4_SHAPING)?).map_err(|source| {
            ShapingError::Map {
                name: MAP_IPV4_SHAPING,
                source,
            }
        })?;
        let v6 = HashMap::try_from(take_map(&mut bpf, MAP_IPV6_SHAPING)?).map_err(|source| {
            ShapingError::Map {
                name: MAP_IPV6_SHAPING,
                source,
            }
        })?;
        let stats = PerCpuArray::try_from(take_map(&mut bpf, MAP_STATS)?).map_err(|source| {
            ShapingError::Map {
                name: MAP_STATS,
                source,
            }
        })?;

        let netlink = Netlink::connect()?;
        tc::add_clsact(iface)?;
        let mut program = EbpfProgram {
            bpf,
            link: None,
            iface: iface.to_string(),
            if_index,
            netlink,
            v4,
            v6,
            stats,
        };

        if let Err(err) = program.netlink.add_qdisc(iface, if_index, Qdisc::Fq).await {
            if let Err(cleanup) = program
                .netlink
                .delete_qdisc(iface, if_index, Qdisc::Clsact)
                .await
            {
                tracing::warn!(iface, %cleanup, "failed to remove clsact after fq error");
            }
            return Err(err.into());
        }
        match attach_tc(&mut program.bpf, iface) {
            Ok(link) => program.link = Some(link),
            Err(err) => {
                if let Err(cleanup) = program.close().await {
                    tracing::warn!(iface, %cleanup, "failed to clean up after attach error");
                }
                return Err(err);
            }
        }

        tracing::info!(iface, if_index, "shaping program attached to egress");
        Ok(program)
    }
}

fn take_map(bpf: &mut Ebpf, name: &'static str) -> Result<Map> {
    bpf.take_map(name).ok_or(ShapingError::MissingMap(name))
}

fn write_control_config(bpf: &mut Ebpf, control: ShaperControl) -> Result<()> {
    let map = bpf
        .map_mut(MAP_CONTROL)
        .ok_or(ShapingError::MissingMap(MAP_CONTROL))?;
    let mut array = Array::<_, ShaperControl>::try_from(map).map_err(|source| ShapingError::Map {
        name: MAP_CONTROL,
        source,
    })?;
    array
        .set(CONTROL_SLOT_RUNTIME, control, 0)
        .map_err(|source| ShapingError::Map {
            name: MAP_CONTROL,
            source,
        })
}

fn classifier<'a>(bpf: &'a mut Ebpf, iface: &str) -> Result<&'a mut SchedClassifier> {
    bpf.program_mut(TC_PROGRAM)
        .ok_or(ShapingError::MissingProgram(TC_PROGRAM))?
        .try_into()
        .map_err(|source| {
            AttachError::Program {
                iface: iface.to_string(),
                action: "find",
                source,
            }
            .into()
        })
}

fn attach_tc(bpf: &mut Ebpf, iface: &str) -> Result<SchedClassifierLinkId> {
    let program = classifier(bpf, iface)?;
    program.load().map_err(|source| AttachError::Program {
        iface: iface.to_string(),
        action: "load",
        source,
    })?;
    let options = TcAttachOptions::Netlink(NlOptions {
        priority: TC_PRIORITY,
        handle: TC_HANDLE,
    });
    let link = program
        .attach_with_options(iface, TcAttachType::Egress, options)
        .map_err(|source| AttachError::Program {
            iface: iface.to_string(),
            action: "attach",
            source,
        })?;
    Ok(link)
}

/// Map keys are the raw header bytes, which is how the classifier reads them.
fn ipv4_key(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// Deleting a key that is not in the map is not an error.
fn ignore_missing(result: std::result::Result<(), MapError>) -> std::result::Result<(), MapError> {
    match result {
        Err(MapError::KeyNotFound) => Ok(()),
        Err(MapError::SyscallError(err)) if err.io_error.raw_os_error() == Some(libc::ENOENT) => {
            Ok(())
        }
        other => other,
    }
}

fn sum_stats<'a, I>(values: I) -> ShaperStats
where
    I: IntoIterator<Item = &'a ShaperStats>,
{
    let mut total = ShaperStats::default();
    for v in values {
        total.merge(v);
    }
    total
}

/// The tc program attached to one interface, with handles on its maps.
pub struct EbpfProgram {
    bpf: Ebpf,
    link: Option<SchedClassifierLinkId>,
    iface: String,
    if_index: u32,
    netlink: Netlink,
    v4: HashMap<MapData, u32, HandleKbpsDelay>,
    v6: HashMap<MapData, [u8; 16], HandleKbpsDelay>,
    stats: PerCpuArray<MapData, ShaperStats>,
}

#[async_trait]
impl ShapingProgram for EbpfProgram {
    fn put_v4(&mut self, addr: Ipv4Addr, entry: HandleKbpsDelay) -> Result<()> {
        tracing::debug!(iface = %self.iface, %addr, ?entry, "map write");
        self.v4
            .insert(ipv4_key(addr), entry, 0)
            .map_err(|source| ShapingError::Map {
                name: MAP_IPV4_SHAPING,
                source,
            })
    }

    fn put_v6(&mut self, addr: Ipv6Addr, entry: HandleKbpsDelay) -> Result<()> {
        tracing::debug!(iface = %self.iface, %addr, ?entry, "map write");
        self.v6
            .insert(addr.octets(), entry, 0)
            .map_err(|source| ShapingError::Map {
                name: MAP_IPV6_SHAPING,
                source,
            })
    }

    fn remove_v4(&mut self, addr: Ipv4Addr) -> Result<()> {
        tracing::debug!(iface = %self.iface, %addr, "map delete");
        ignore_missing(self.v4.remove(&ipv4_key(addr))).map_err(|source| ShapingError::Map {
            name: MAP_IPV4_SHAPING,
            source,
        })
    }

    fn remove_v6(&mut self, addr: Ipv6Addr) -> Result<()> {
        tracing::debug!(iface = %self.iface, %addr, "map delete");
        ignore_missing(self.v6.remove(&addr.octets())).map_err(|source| ShapingError::Map {
            name: MAP_IPV6_SHAPING,
            source,
        })
    }

    fn stats(&self) -> Result<ShaperStats> {
        let per_cpu = self
            .stats
            .get(&CONTROL_SLOT_RUNTIME, 0)
            .map_err(|source| ShapingError::Map {
                name: MAP_STATS,
                source,
            })?;
        Ok(sum_stats(per_cpu.iter()))
    }

    async fn close(mut self) -> Result<()> {
        let mut first_err: Option<ShapingError> = None;

        if let Some(link) = self.link.take() {
            let detached = classifier(&mut self.bpf, &self.iface).and_then(|program| {
                program.detach(link).map_err(|source| {
                    AttachError::Program {
                        iface: self.iface.clone(),
                        action: "detach",
                        source,
                    }
                    .into()
                })
            });
            if let Err(err) = detached {
                first_err.get_or_insert(err);
            }
        }

        for qdisc in [Qdisc::Fq, Qdisc::Clsact] {
            if let Err(err) = self
                .netlink
                .delete_qdisc(&self.iface, self.if_index, qdisc)
                .await
            {
                first_err.get_or_insert(err.into());
            }
        }

        tracing::debug!(iface = %self.iface, "shaping program closed");
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_stats_accumulates_multiple_cpus() {
        let cpus = vec![
            ShaperStats {
                shaped: 100,
                passed: 2,
                ..ShaperStats::default()
            },
            ShaperStats {
                shaped: 50,
                passed: 1,
                dropped_horizon: 4,
                ..ShaperStats::default()
            },
        ];
        let total = sum_stats(cpus.iter());
        assert_eq!(total.shaped, 150);
        assert_eq!(total.passed, 3);
        assert_eq!(total.dropped_horizon, 4);
        assert_eq!(total.ce_marked, 0);
    }

    #[test]
    fn sum_stats_of_no_cpus_is_zero() {
        assert_eq!(sum_stats(std::iter::empty()), ShaperStats::default());
    }

    #[test]
    fn ipv4_key_keeps_header_byte_order() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(ipv4_key(addr).to_ne_bytes(), [10, 0, 0, 1]);
    }

    #[test]
    fn deleting_an_absent_key_succeeds() {
        assert!(ignore_missing(Err(MapError::KeyNotFound)).is_ok());
        assert!(ignore_missing(Ok(())).is_ok());
        assert!(matches!(
            ignore_missing(Err(MapError::OutOfBounds {
                index: 3,
                max_entries: 1,
            })),
            Err(MapError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn missing_object_is_reported_as_unavailable() {
        if !EBPF_BYTES.is_empty() {
            return;
        }
        let err = EbpfBackend
            .load("lo", ShaperControl::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ShapingError::ProgramUnavailable));
        assert_eq!(err.kind(), crate::ErrorKind::Resource);
    }
}
