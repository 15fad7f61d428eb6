//! DIMSE message exchange over established DICOM associations.
//!
//! This crate builds the DICOM message service element (PS3.7)
//! on top of the upper layer protocol provided by `radlink-ul`:
//!
//! - The [`command`] module models DIMSE command sets
//!   as a single discriminated type with per-operation constructors.
//! - The [`framer`] module splits messages into presentation data values
//!   bounded by the negotiated maximum PDU length,
//!   and reassembles incoming PDV streams into complete messages.
//! - The [`correlator`] module matches responses to pending requests
//!   by message ID,
//!   keeping multi-response operations alive until a terminal status.
//! - The [`connection`] module owns the transport of one association:
//!   a single sequential read loop and a serialized write path.
//! - The [`scu`] module provides requester sessions,
//!   the [`server`] module the acceptor server,
//!   and the [`service`] module the provider callback surface
//!   shared by both sides.
//! - The [`config`] module carries the timing and bound parameters
//!   read once at association setup.
pub mod command;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod framer;
pub mod message;
pub mod scu;
pub mod server;
pub mod service;

mod wire;

// re-exports

pub use command::{CommandField, CommandSet, Priority, Status, StatusState};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Error, MessageSender, Request};
pub use correlator::{RequestError, ResponseStream};
pub use message::{Message, MessageDataset};
pub use scu::{ClientSession, ClientSessionOptions};
pub use server::DimseServer;
pub use service::{NoServices, ProviderContext, Response, Responses, ServiceProvider};

pub use radlink_ul as ul;
