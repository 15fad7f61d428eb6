//! DICOM association module
//!
//! This module contains the pieces needed to negotiate and maintain
//! associations between DICOM nodes over TCP/IP:
//!
//! - [`model`] holds the in-memory [`Association`](model::Association)
//!   with its presentation contexts and negotiation items;
//! - [`state`] tracks the lifecycle of one association
//!   and validates protocol inputs against it;
//! - [`client`] and [`server`] provide blocking requester and acceptor
//!   endpoints on top of the model and the state machine;
//! - [`pdata`] offers streaming reader/writer abstractions
//!   over P-DATA-TF exchanges;
//! - [`appinfo`] decodes the service-class specific layouts
//!   of extended negotiation application information.
pub mod appinfo;
pub mod client;
pub mod model;
pub mod server;
pub mod state;

pub(crate) mod pdata;

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::pdu::{read_pdu, AssociationRJ, Pdu};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use model::Association;
pub use pdata::{PDataReader, PDataWriter};
pub use server::{
    AcceptAny, AcceptCalledAeTitle, AccessControl, ServerAssociation, ServerAssociationOptions,
};
pub use state::{AssociationState, StateMachine};

/// Common error type for association negotiation and use.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode an outgoing PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read PDU message from wire
    WireReceive {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to decode an incoming PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// connection closed by peer before a full PDU was received
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("association rejected by the peer: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// association aborted
    Aborted { backtrace: Backtrace },

    #[snafu(display("unexpected PDU from peer `{:?}`", pdu))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    #[snafu(display("unknown PDU from peer `{:?}`", pdu))]
    #[non_exhaustive]
    UnknownPdu {
        /// the PDU obtained from the peer, of variant Unknown
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    #[non_exhaustive]
    SendTooLongPdu { length: usize, backtrace: Backtrace },

    /// could not set read timeout on socket
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not set write timeout on socket
    SetWriteTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// invalid association negotiation
    #[snafu(display("invalid association negotiation: {}", source))]
    Negotiation { source: model::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for the underlying TCP socket of an association.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
}

/// Read one full PDU from the given byte source,
/// buffering partial reads in `read_buffer`
/// until the PDU is complete.
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read,
{
    loop {
        let mut cursor = Cursor::new(&read_buffer[..]);
        if let Some(pdu) = read_pdu(&mut cursor, max_pdu_length, strict).context(ReceivePduSnafu)? {
            let consumed = cursor.position() as usize;
            read_buffer.advance(consumed);
            return Ok(pdu);
        }

        let mut chunk = [0u8; 8192];
        let bytes_read = reader.read(&mut chunk).context(WireReceiveSnafu)?;
        if bytes_read == 0 {
            return ConnectionClosedSnafu.fail();
        }
        read_buffer.extend_from_slice(&chunk[..bytes_read]);
    }
}

/// Trim trailing null padding from a UID value.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') {
        Cow::Owned(uid.trim_end_matches('\0').to_string())
    } else {
        uid
    }
}
