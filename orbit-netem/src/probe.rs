//! One-way latency estimation with `ping`.

use std::{net::IpAddr, time::Duration};

use crate::command::{self, Command, CommandRunner};

pub const DEFAULT_PROBE_COUNT: u32 = 5;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack on top of `count * timeout` before the probe is abandoned.
const OUTER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probing {addr} failed")]
    Command {
        addr: IpAddr,
        #[source]
        source: command::Error,
    },
    #[error("no replies from {addr}")]
    NoReplies { addr: IpAddr },
    #[error("probing {addr} did not finish within {after:?}")]
    TimedOut { addr: IpAddr, after: Duration },
    #[error("could not find a round-trip summary in ping output for {addr}")]
    Unparsable { addr: IpAddr, output: String },
}

impl ProbeError {
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            ProbeError::Command { source, .. } => source.kind(),
            _ => crate::ErrorKind::TransientExternal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub count: u32,
    /// Per probe.
    pub timeout: Duration,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            count: DEFAULT_PROBE_COUNT,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl Probe {
    fn command(&self, addr: IpAddr) -> Command {
        let timeout_s = self.timeout.as_secs().max(1);
        Command::new("ping")
            .args(["-n", "-q"])
            .arg("-c")
            .arg(self.count)
            .arg("-W")
            .arg(timeout_s)
            .arg("-w")
            .arg(self.count as u64 * timeout_s)
            .arg(addr)
    }

    /// Upper bound on how long [`Probe::one_way_latency_us`] may take.
    pub fn deadline(&self) -> Duration {
        self.timeout * self.count + OUTER_GRACE
    }

    /// Half the average round-trip time to `addr`, in microseconds.
    pub async fn one_way_latency_us<R>(&self, runner: &R, addr: IpAddr) -> Result<u64, ProbeError>
    where
        R: CommandRunner + ?Sized,
    {
        let cmd = self.command(addr);
        let after = self.deadline();
        let output = match tokio::time::timeout(after, runner.run(&cmd)).await {
            Err(_) => return Err(ProbeError::TimedOut { addr, after }),
            Ok(Err(command::Error::NonZero { output, .. })) if no_replies(&output.stdout) => {
                return Err(ProbeError::NoReplies { addr })
            }
            Ok(Err(source)) => return Err(ProbeError::Command { addr, source }),
            Ok(Ok(output)) => output,
        };

        let avg_ns = parse_avg_rtt_ns(&output.stdout).ok_or_else(|| ProbeError::Unparsable {
            addr,
            output: output.stdout.clone(),
        })?;
        let latency_us = avg_ns / 1_000 / 2;
        tracing::info!(%addr, latency_us, "measured one-way latency");
        Ok(latency_us)
    }
}

fn no_replies(stdout: &str) -> bool {
    stdout.contains(" 0 received") || stdout.contains(" 0 packets received")
}

/// Average RTT from a `min/avg/max` summary line, in nanoseconds.
///
/// iputils: `rtt min/avg/max/mdev = 0.045/0.052/0.061/0.006 ms`
/// busybox: `round-trip min/avg/max = 0.083/0.083/0.083 ms`
fn parse_avg_rtt_ns(stdout: &str) -> Option<u64> {
    let line = stdout.lines().find(|l| l.contains("min/avg/max"))?;
    let (_, values) = line.split_once('=')?;
    let mut parts = values.split_whitespace();
    let avg: f64 = parts.next()?.split('/').nth(1)?.parse().ok()?;
    let scale = match parts.next().unwrap_or("ms") {
        "s" => 1e9,
        "ms" => 1e6,
        "us" | "µs" => 1e3,
        "ns" => 1.0,
        _ => return None,
    };
    if !avg.is_finite() || avg < 0.0 {
        return None;
    }
    Some((avg * scale).round() as u64)
}
