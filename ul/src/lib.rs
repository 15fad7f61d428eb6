//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol (PS3.8).
//!
//! This crate can be used as a base
//! for higher-level helpers and message exchange layers,
//! enabling the creation of concrete service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   which are passed around as part of the DICOM network communication
//!   support, as well as a byte-exact reader and writer for them.
//! - The [`association`] module
//!   comprises the association model, its lifecycle state machine,
//!   and blocking abstractions for establishing and negotiating
//!   associations between application entities via TCP.

pub mod address;
pub mod association;
pub mod pdu;

/// The implementation class UID generically referring to this project.
///
/// Generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137403925291736902678810835436837988512";

/// The implementation version name generically referring to this project.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "radlink-ul 0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::model::Association;
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use association::state::{AssociationState, StateMachine};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
