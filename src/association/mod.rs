//! Association requesting and accepting.
//!
//! This module provides the two sides of an association:
//!
//! - [`ClientAssociationOptions`] requests associations to a remote peer
//!   (the requester, usually a service class user);
//! - [`ServerAssociationOptions`] accepts association requests
//!   from an incoming connection
//!   (the acceptor, usually a service class provider).
//!
//! Both sides drive a shared explicit [state machine](machine)
//! which validates every protocol step,
//! and negotiate presentation contexts
//! through the [negotiation](negotiation) module.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_dimse::association::ClientAssociationOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .calling_ae_title("ECHO-SCU")
//!     .establish_with("SCP-STORAGE@127.0.0.1:104")?;
//! association.release()?;
//! # Ok(())
//! # }
//! ```
pub mod client;
pub mod machine;
pub mod negotiation;
pub mod pdata;
pub mod server;
mod uid;

use std::net::TcpStream;
use std::time::Duration;

use snafu::{Backtrace, Snafu};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use machine::{
    AbortKind, AssociationEvent, AssociationState, Event, Output, StateMachine,
};
pub use negotiation::{negotiate, AcceptorPolicy, NegotiationOutcome};
pub use pdata::{PDataReader, PDataWriter};
pub use server::{
    AcceptAny, AcceptCalledAeTitle, AccessControl, ServerAssociation, ServerAssociationOptions,
};

use crate::pdu::{AssociationRJ, Pdu};

/// Timeouts applied to the underlying transport of an association.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SocketOptions {
    /// maximum amount of time to wait for an incoming PDU;
    /// this also bounds how long the endpoint waits
    /// for an expected peer answer such as a release reply
    pub read_timeout: Option<Duration>,
    /// maximum amount of time to wait when writing a PDU
    pub write_timeout: Option<Duration>,
    /// maximum amount of time to wait when connecting to the peer
    pub connection_timeout: Option<Duration>,
}

/// A transport which can be shut down in both directions.
pub trait CloseSocket {
    fn close(&mut self) -> std::io::Result<()>;
}

impl CloseSocket for TcpStream {
    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

/// Common errors of the client and server association endpoints.
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

    /// failed to send association request
    SendRequest {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to receive association response
    ReceiveResponse {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("unexpected response from peer `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedResponse {
        /// the PDU which was received
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown response from peer `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnknownResponse {
        /// the PDU which was received
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the peer: {}", association_rj.source))]
    Rejected {
        /// the full rejection information
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// association aborted
    Aborted { backtrace: Backtrace },

    /// failed to send PDU message
    #[non_exhaustive]
    Send {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU is too large to be sent to peer: length is {}, maximum is {}",
        length,
        maximum
    ))]
    #[non_exhaustive]
    SendTooLongPdu {
        length: usize,
        maximum: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("cannot send {} PDU through this association", pdu.short_description()))]
    #[non_exhaustive]
    SendUnsupportedPdu {
        /// the PDU which the caller tried to send
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    /// failed to receive PDU message
    #[non_exhaustive]
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// the peer did not answer within the configured time
    Timeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// illegal local operation on the association
    Machine {
        #[snafu(backtrace)]
        source: machine::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Distinguish a socket read timeout from other PDU reading failures.
pub(crate) fn as_timeout_error(
    e: crate::pdu::reader::Error,
) -> std::result::Result<std::io::Error, crate::pdu::reader::Error> {
    use crate::pdu::reader::Error as PduError;
    use std::io::ErrorKind;
    match e {
        PduError::ReadPdu { source, .. }
        | PduError::ReadPduItem { source, .. }
        | PduError::ReadPduField { source, .. }
        | PduError::ReadReserved { source, .. }
            if matches!(source.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
        {
            Ok(source)
        }
        e => Err(e),
    }
}
