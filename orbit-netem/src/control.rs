//! Line-oriented control protocol read by the agents.
//!
//! ```text
//! route <v4-subnet> <host-id>
//! bandwidth <machine> <v4-subnet> <kbps>
//! latency <machine> <v4-subnet> <us>
//! block <machine> <v4-subnet>
//! unblock <machine> <v4-subnet>
//! stats <machine>
//! ```
//!
//! `#` starts a comment. Blank lines are ignored.

use std::str::FromStr;

use crate::{
    ErrorKind,
    addr::{Ipv4Subnet, NodeId},
    shaping::MachineId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Route { subnet: Ipv4Subnet, host: NodeId },
    Bandwidth { machine: MachineId, subnet: Ipv4Subnet, kbps: u32 },
    Latency { machine: MachineId, subnet: Ipv4Subnet, us: u32 },
    Block { machine: MachineId, subnet: Ipv4Subnet },
    Unblock { machine: MachineId, subnet: Ipv4Subnet },
    Stats { machine: MachineId },
}

impl Directive {
    /// Whether the mesh agent handles this directive rather than the shaper.
    pub fn is_mesh(&self) -> bool {
        matches!(self, Directive::Route { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("`{command}` is missing <{argument}>")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("invalid <{argument}> '{token}'")]
    InvalidValue {
        argument: &'static str,
        token: String,
    },
    #[error("unexpected trailing token '{0}'")]
    TrailingToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

struct Args<'a> {
    command: &'static str,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn next<T: FromStr>(&mut self, argument: &'static str) -> Result<T, ParseErrorKind> {
        let token = self.tokens.next().ok_or(ParseErrorKind::MissingArgument {
            command: self.command,
            argument,
        })?;
        token.parse().map_err(|_| ParseErrorKind::InvalidValue {
            argument,
            token: token.to_string(),
        })
    }

    fn finish<T>(mut self, directive: T) -> Result<T, ParseErrorKind> {
        match self.tokens.next() {
            Some(extra) => Err(ParseErrorKind::TrailingToken(extra.to_string())),
            None => Ok(directive),
        }
    }
}

/// Parses one line. `line` is 1-based and only used for error reporting.
pub fn parse_line(line: usize, text: &str) -> Result<Option<Directive>, ParseError> {
    parse_directive(text).map_err(|kind| ParseError { line, kind })
}

fn parse_directive(text: &str) -> Result<Option<Directive>, ParseErrorKind> {
    let text = text.split_once('#').map_or(text, |(before, _)| before);
    let mut tokens = text.split_whitespace();
    let Some(command) = tokens.next() else {
        return Ok(None);
    };
    let command: &'static str = match command {
        "route" => "route",
        "bandwidth" => "bandwidth",
        "latency" => "latency",
        "block" => "block",
        "unblock" => "unblock",
        "stats" => "stats",
        other => return Err(ParseErrorKind::UnknownCommand(other.to_string())),
    };
    let mut args = Args { command, tokens };

    let directive = match command {
        "route" => Directive::Route {
            subnet: args.next("v4-subnet")?,
            host: args.next("host-id")?,
        },
        "bandwidth" => Directive::Bandwidth {
            machine: args.next("machine")?,
            subnet: args.next("v4-subnet")?,
            kbps: args.next("kbps")?,
        },
        "latency" => Directive::Latency {
            machine: args.next("machine")?,
            subnet: args.next("v4-subnet")?,
            us: args.next("us")?,
        },
        "block" => Directive::Block {
            machine: args.next("machine")?,
            subnet: args.next("v4-subnet")?,
        },
        "unblock" => Directive::Unblock {
            machine: args.next("machine")?,
            subnet: args.next("v4-subnet")?,
        },
        _ => Directive::Stats {
            machine: args.next("machine")?,
        },
    };
    args.finish(directive).map(Some)
}

/// Parses a whole document, stopping at the first bad line.
pub fn parse(text: &str) -> Result<Vec<Directive>, ParseError> {
    let mut directives = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some(directive) = parse_line(idx + 1, line)? {
            directives.push(directive);
        }
    }
    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(s: &str) -> Ipv4Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn parses_every_command() {
        let doc = "\
# topology epoch 12
route 10.0.0.0/30 2

bandwidth 1-3 10.0.0.0/30 1000
latency 1-3 10.0.0.0/30 2500   # ~750 km
block 1-3 10.0.0.4/30
unblock 1-3 10.0.0.4/30
stats 1-3
";
        let m = MachineId::new(1, 3);
        assert_eq!(
            parse(doc).unwrap(),
            vec![
                Directive::Route {
                    subnet: subnet("10.0.0.0/30"),
                    host: NodeId::new(2).unwrap(),
                },
                Directive::Bandwidth {
                    machine: m,
                    subnet: subnet("10.0.0.0/30"),
                    kbps: 1000,
                },
                Directive::Latency {
                    machine: m,
                    subnet: subnet("10.0.0.0/30"),
                    us: 2500,
                },
                Directive::Block {
                    machine: m,
                    subnet: subnet("10.0.0.4/30"),
                },
                Directive::Unblock {
                    machine: m,
                    subnet: subnet("10.0.0.4/30"),
                },
                Directive::Stats { machine: m },
            ]
        );
    }

    #[test]
    fn errors_carry_line_and_token() {
        let err = parse("stats 1-1\nbandwidth 1-1 10.0.0.0/30 fast\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(
            err.kind,
            ParseErrorKind::InvalidValue {
                argument: "kbps",
                token: "fast".to_string(),
            }
        );
        assert_eq!(err.to_string(), "line 2: invalid <kbps> 'fast'");
    }

    #[test]
    fn rejects_unknown_missing_and_trailing() {
        assert_eq!(
            parse_line(1, "teleport 1-1").unwrap_err().kind,
            ParseErrorKind::UnknownCommand("teleport".to_string())
        );
        assert_eq!(
            parse_line(1, "block 1-1").unwrap_err().kind,
            ParseErrorKind::MissingArgument {
                command: "block",
                argument: "v4-subnet",
            }
        );
        assert_eq!(
            parse_line(1, "stats 1-1 now").unwrap_err().kind,
            ParseErrorKind::TrailingToken("now".to_string())
        );
        assert!(matches!(
            parse_line(1, "route 10.0.0.0/30 254").unwrap_err().kind,
            ParseErrorKind::InvalidValue { argument: "host-id", .. }
        ));
    }

    #[test]
    fn comments_and_blanks_yield_nothing() {
        assert_eq!(parse_line(1, "   ").unwrap(), None);
        assert_eq!(parse_line(1, "# route 10.0.0.0/30 2").unwrap(), None);
        assert!(parse_line(1, "route 10.0.0.0/30 2").unwrap().unwrap().is_mesh());
    }
}
