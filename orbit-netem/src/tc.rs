//! Queueing disciplines the shaper depends on.
//!
//! The classifier runs from a `clsact` qdisc on egress and only stamps
//! departure times; a root `fq` qdisc does the actual pacing.

use std::io;

use futures::StreamExt as _;
use rtnetlink::packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload,
};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    tc::{TcAttribute, TcHandle, TcMessage},
};

use crate::ErrorKind;

/// `123:`
pub const FQ_HANDLE: u32 = 0x0123_0000;
const CLSACT_PARENT: u32 = 0xFFFF_FFF1;
const CLSACT_HANDLE: u32 = 0xFFFF_0000;

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("interface {iface} not found")]
    InterfaceNotFound {
        iface: String,
        #[source]
        source: nix::Error,
    },
    #[error("{kind} qdisc already exists on {iface}")]
    QdiscExists { iface: String, kind: &'static str },
    #[error("failed to open netlink socket")]
    Connection(#[source] io::Error),
    #[error("{kind} qdisc request on {iface} failed")]
    Netlink {
        iface: String,
        kind: &'static str,
        #[source]
        source: rtnetlink::Error,
    },
    #[error("failed to add clsact qdisc to {iface}")]
    Clsact {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to {action} tc program on {iface}")]
    Program {
        iface: String,
        action: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },
}

impl AttachError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttachError::InterfaceNotFound { .. } | AttachError::Connection(_) => {
                ErrorKind::Resource
            }
            AttachError::QdiscExists { .. }
            | AttachError::Netlink { .. }
            | AttachError::Clsact { .. }
            | AttachError::Program { .. } => ErrorKind::KernelState,
        }
    }
}

pub fn interface_index(iface: &str) -> Result<u32, AttachError> {
    nix::net::if_::if_nametoindex(iface).map_err(|source| AttachError::InterfaceNotFound {
        iface: iface.to_string(),
        source,
    })
}

/// Adds the `clsact` qdisc classifiers hang off.
pub fn add_clsact(iface: &str) -> Result<(), AttachError> {
    match aya::programs::tc::qdisc_add_clsact(iface) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(AttachError::QdiscExists {
            iface: iface.to_string(),
            kind: Qdisc::Clsact.kind(),
        }),
        Err(source) => Err(AttachError::Clsact {
            iface: iface.to_string(),
            source,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qdisc {
    /// Root pacing qdisc honouring `skb->tstamp`.
    Fq,
    Clsact,
}

impl Qdisc {
    pub fn kind(self) -> &'static str {
        match self {
            Qdisc::Fq => "fq",
            Qdisc::Clsact => "clsact",
        }
    }

    fn parent(self) -> TcHandle {
        match self {
            Qdisc::Fq => TcHandle::ROOT,
            Qdisc::Clsact => TcHandle::from(CLSACT_PARENT),
        }
    }

    fn handle(self) -> TcHandle {
        match self {
            Qdisc::Fq => TcHandle::from(FQ_HANDLE),
            Qdisc::Clsact => TcHandle::from(CLSACT_HANDLE),
        }
    }

    fn message(self, if_index: u32) -> TcMessage {
        let mut tc_message = TcMessage::with_index(if_index as i32);
        tc_message.header.parent = self.parent();
        tc_message.header.handle = self.handle();
        tc_message
            .attributes
            .push(TcAttribute::Kind(self.kind().to_string()));
        tc_message
    }

    /// Fails if a qdisc with this handle is already installed.
    pub fn add_request(self, if_index: u32) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(
            self.message(if_index),
        ));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK;
        nl_req
    }

    pub fn delete_request(self, if_index: u32) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(
            self.message(if_index),
        ));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        nl_req
    }
}

/// Route netlink socket for qdisc requests.
#[derive(Clone)]
pub struct Netlink {
    handle: rtnetlink::Handle,
}

impl Netlink {
    /// Must be called from within a tokio runtime; the connection task is
    /// spawned onto it.
    pub fn connect() -> Result<Self, AttachError> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(AttachError::Connection)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn add_qdisc(&self, iface: &str, if_index: u32, qdisc: Qdisc) -> Result<(), AttachError> {
        tracing::debug!(iface, kind = qdisc.kind(), "adding qdisc");
        match self.request(qdisc.add_request(if_index)).await {
            Ok(()) => Ok(()),
            Err(err) if errno(&err) == Some(libc::EEXIST) => Err(AttachError::QdiscExists {
                iface: iface.to_string(),
                kind: qdisc.kind(),
            }),
            Err(source) => Err(AttachError::Netlink {
                iface: iface.to_string(),
                kind: qdisc.kind(),
                source,
            }),
        }
    }

    /// Deleting a qdisc that is not there is not an error.
    pub async fn delete_qdisc(
        &self,
        iface: &str,
        if_index: u32,
        qdisc: Qdisc,
    ) -> Result<(), AttachError> {
        tracing::debug!(iface, kind = qdisc.kind(), "deleting qdisc");
        match self.request(qdisc.delete_request(if_index)).await {
            Ok(()) => Ok(()),
            Err(err) if is_missing(&err) => {
                tracing::debug!(iface, kind = qdisc.kind(), "qdisc already gone");
                Ok(())
            }
            Err(source) => Err(AttachError::Netlink {
                iface: iface.to_string(),
                kind: qdisc.kind(),
                source,
            }),
        }
    }

    async fn request(
        &self,
        nl_req: NetlinkMessage<RouteNetlinkMessage>,
    ) -> Result<(), rtnetlink::Error> {
        let mut handle = self.handle.clone();
        let mut res = handle.request(nl_req)?;
        while let Some(res) = res.next().await {
            // An error message without a code is the acknowledgement.
            if let NetlinkPayload::Error(e) = res.payload {
                if e.code.is_some() {
                    return Err(rtnetlink::Error::NetlinkError(e));
                }
            }
        }
        Ok(())
    }
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| code.get().abs()),
        _ => None,
    }
}

fn is_missing(err: &rtnetlink::Error) -> bool {
    matches!(errno(err), Some(libc::ENOENT | libc::EINVAL | libc::ENODEV))
}
