//! This crate implements the upper layer of the DICOM network protocol:
//! protocol data unit (PDU) reading and writing,
//! association negotiation on both sides of the wire
//! and the message layer which turns P-Data traffic
//! into whole service requests and responses.
//!
//! - The [`pdu`] module has the data structures
//!   representing protocol data units,
//!   plus [`read_pdu`](pdu::read_pdu) and [`write_pdu`](pdu::write_pdu)
//!   to convert them from and into bytes.
//! - The [`association`] module negotiates and drives associations,
//!   as a requester ([`ClientAssociationOptions`])
//!   or as an acceptor ([`ServerAssociationOptions`]).
//! - The [`dimse`] module reassembles messages
//!   and dispatches them to a [service provider](dimse::ServiceProvider).
//! - The [`registry`] module carries the unique identifiers
//!   the other layers consult during negotiation.
//!
//! # Example
//!
//! A verification service provider in a few lines:
//!
//! ```no_run
//! use std::net::TcpListener;
//! use dicom_dimse::association::ServerAssociationOptions;
//! use dicom_dimse::dimse::{DimseMultiplexer, ServiceProvider};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! struct Echo;
//! impl ServiceProvider for Echo {}
//!
//! let listener = TcpListener::bind("0.0.0.0:11112")?;
//! let options = ServerAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1");
//! let (socket, _) = listener.accept()?;
//! let mut association = options.establish(socket)?;
//! let mut multiplexer = DimseMultiplexer::new(
//!     Echo,
//!     association.presentation_contexts(),
//!     association.acceptor_max_pdu_length(),
//! );
//! multiplexer.serve(&mut association)?;
//! # Ok(())
//! # }
//! ```
pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;
pub mod registry;

pub use address::{AeAddr, FullAeAddr};
pub use association::{
    ClientAssociation, ClientAssociationOptions, ServerAssociation, ServerAssociationOptions,
};
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use registry::UidRegistry;

/// The UID under which this implementation identifies itself
/// during association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.972.1";

/// The version name sent alongside the implementation class UID.
/// At most 16 characters.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE-RS-0.1";
