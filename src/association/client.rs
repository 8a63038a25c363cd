//! Association requester module
//!
//! The main entrypoint is [`ClientAssociationOptions`],
//! which compiles a set of options into an association request
//! and drives the establishment handshake.
//! A successful establishment yields a [`ClientAssociation`],
//! through which messages can be exchanged
//! until the association is released or aborted.
use std::borrow::Cow;
use std::convert::TryInto;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};

use snafu::{ensure, ResultExt};
use tracing::{debug, trace, warn};

use crate::address::AeAddr;
use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationRQ, PDataValueType, Pdu,
    PresentationContextNegotiated, PresentationContextProposed, PresentationContextResultReason,
    UserIdentity, UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::registry::DICOM_APPLICATION_CONTEXT;
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::machine::{AbortKind, AssociationEvent, AssociationState, Event, Output, StateMachine};
use super::pdata::{PDataReader, PDataWriter};
use super::uid::trim_uid;
use super::{
    AbortedSnafu, CloseSocket, ConnectSnafu, MachineSnafu, MissingAbstractSyntaxSnafu,
    NoAcceptedPresentationContextsSnafu, ProtocolVersionMismatchSnafu, ReceiveResponseSnafu,
    ReceiveSnafu, RejectedSnafu, Result, SendRequestSnafu, SendSnafu, SendTooLongPduSnafu,
    SendUnsupportedPduSnafu, SetReadTimeoutSnafu, SetWriteTimeoutSnafu, SocketOptions,
    TimeoutSnafu, UnexpectedResponseSnafu, UnknownResponseSnafu, WireSendSnafu,
};

/// A set of options and a builder
/// for requesting a new association to a remote application entity.
///
/// ```no_run
/// # use dicom_dimse::association::ClientAssociationOptions;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("SCP-STORAGE")
///     .establish("127.0.0.1:104")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the AE title of this node
    calling_ae_title: Cow<'a, str>,
    /// the AE title of the peer,
    /// when not provided by the address at establishment time
    called_ae_title: Option<Cow<'a, str>>,
    /// the application context name to propose
    application_context_name: Cow<'a, str>,
    /// the abstract syntaxes to propose,
    /// each with its list of candidate transfer syntaxes
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs strictly within the negotiated limit
    strict: bool,
    /// the user identity username, if any
    username: Option<Cow<'a, str>>,
    /// the user identity password, if any
    password: Option<Cow<'a, str>>,
    /// the user identity Kerberos service ticket, if any
    kerberos_service_ticket: Option<Cow<'a, [u8]>>,
    /// the user identity SAML assertion, if any
    saml_assertion: Option<Cow<'a, str>>,
    /// the user identity JSON Web Token, if any
    jwt: Option<Cow<'a, str>>,
    /// timeouts applied to the connection
    socket_options: SocketOptions,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            username: None,
            password: None,
            kerberos_service_ticket: None,
            saml_assertion: None,
            jwt: None,
            socket_options: SocketOptions::default(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which identifies this side of the association.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which identifies the target of the association.
    ///
    /// An AE title given through the address at establishment time
    /// takes precedence over this one.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = Some(called_ae_title.into());
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and the default transfer syntax candidates
    /// (Explicit VR Little Endian, then Implicit VR Little Endian).
    pub fn with_abstract_syntax<T>(self, abstract_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax.into(), default_transfer_syntaxes)
    }

    /// Propose a presentation context with the given abstract syntax
    /// and an explicit list of candidate transfer syntaxes,
    /// in preference order.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax: T,
        transfer_syntaxes: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntaxes
            .into_iter()
            .map(|ts| trim_uid(ts.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax.into()), transfer_syntaxes));
        self
    }

    /// Define the maximum PDU length this node is willing to receive.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving a PDU larger than the negotiated maximum
    /// is an error (`true`) or tolerated with a warning (`false`).
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Define the user identity username
    /// for user identity negotiation.
    pub fn username<T>(mut self, username: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.username = Some(username.into());
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self.jwt = None;
        self
    }

    /// Define the user identity password.
    /// Only meaningful together with a username.
    pub fn password<T>(mut self, password: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.password = Some(password.into());
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self.jwt = None;
        self
    }

    /// Define both the username and the password
    /// for user identity negotiation.
    pub fn username_password<T, U>(mut self, username: T, password: U) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self.jwt = None;
        self
    }

    /// Define a Kerberos service ticket for user identity negotiation.
    pub fn kerberos_service_ticket<T>(mut self, ticket: T) -> Self
    where
        T: Into<Cow<'a, [u8]>>,
    {
        self.kerberos_service_ticket = Some(ticket.into());
        self.username = None;
        self.password = None;
        self.saml_assertion = None;
        self.jwt = None;
        self
    }

    /// Define a SAML assertion for user identity negotiation.
    pub fn saml_assertion<T>(mut self, assertion: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.saml_assertion = Some(assertion.into());
        self.username = None;
        self.password = None;
        self.kerberos_service_ticket = None;
        self.jwt = None;
        self
    }

    /// Define a JSON Web Token for user identity negotiation.
    pub fn jwt<T>(mut self, jwt: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.jwt = Some(jwt.into());
        self.username = None;
        self.password = None;
        self.kerberos_service_ticket = None;
        self.saml_assertion = None;
        self
    }

    /// Define the timeout for individual socket reads.
    /// This also bounds how long the requester waits
    /// for each expected peer answer.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Define the timeout for individual socket writes.
    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Define the timeout for connecting to the peer.
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.connection_timeout = Some(timeout);
        self
    }

    /// Initiate the association with the peer at the given address.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        self.establish_impl(AeAddr::new_socket_addr(address))
    }

    /// Initiate the association with the peer
    /// at the given AE address, such as `SCP-STORAGE@192.168.1.99:104`.
    /// A plain socket address is accepted as well,
    /// in which case the called AE title given in the options applies.
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation> {
        match ae_address.try_into() {
            Ok(ae_address) => self.establish_impl::<String>(ae_address),
            Err(_) => self.establish_impl(AeAddr::new_socket_addr(ae_address.to_string())),
        }
    }

    fn establish_impl<T>(self, ae_address: AeAddr<T>) -> Result<ClientAssociation>
    where
        T: ToSocketAddrs,
    {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let called_ae_title = ae_address
            .ae_title()
            .map(str::to_string)
            .or_else(|| self.called_ae_title.as_ref().map(|aet| aet.to_string()))
            .unwrap_or_else(|| "ANY-SCP".to_string());

        let mut socket = self.connect(&ae_address)?;
        socket
            .set_read_timeout(self.socket_options.read_timeout)
            .context(SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout)
            .context(SetWriteTimeoutSnafu)?;

        // odd identifiers, one per proposed abstract syntax
        let requested_contexts: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes
                    .iter()
                    .map(|ts| ts.to_string())
                    .collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some(identity) = self.user_identity() {
            user_variables.push(UserVariableItem::UserIdentityItem(identity));
        }

        let protocol_version = 1;
        let rq = AssociationRQ {
            protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title,
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: requested_contexts.clone(),
            user_variables,
        };

        let mut machine = StateMachine::new();
        let mut buffer = Vec::with_capacity(PDU_HEADER_SIZE as usize + 256);
        let outputs = machine
            .handle(Event::RequestAssociation(rq))
            .context(MachineSnafu)?;
        for output in outputs {
            if let Output::Send(pdu) = output {
                write_pdu(&mut buffer, &pdu).context(SendRequestSnafu)?;
            }
        }
        socket.write_all(&buffer).context(WireSendSnafu)?;
        buffer.clear();

        // the association response is allowed to reach the absolute maximum,
        // negotiation of the PDU limit only applies from here on
        let response = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, self.strict)
            .context(ReceiveResponseSnafu)?;
        let outputs = machine
            .handle(Event::PduReceived(response))
            .context(MachineSnafu)?;

        let mut established = None;
        let mut rejection = None;
        let mut abort_kind = None;
        for output in outputs {
            match output {
                Output::Send(pdu) => {
                    buffer.clear();
                    write_pdu(&mut buffer, &pdu).context(SendSnafu)?;
                    let _ = socket.write_all(&buffer);
                }
                Output::Notify(AssociationEvent::Established(ac)) => established = ac,
                Output::Notify(AssociationEvent::Rejected(rj)) => rejection = Some(rj),
                Output::Notify(AssociationEvent::Aborted(kind)) => abort_kind = Some(kind),
                Output::Notify(_) => {}
                Output::CloseTransport => {
                    let _ = socket.close();
                }
            }
        }

        if let Some(association_rj) = rejection {
            return RejectedSnafu { association_rj }.fail();
        }
        match abort_kind {
            Some(AbortKind::ProtocolError(pdu)) => {
                return match *pdu {
                    pdu @ Pdu::Unknown { .. } => UnknownResponseSnafu { pdu: Box::new(pdu) }.fail(),
                    pdu => UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail(),
                };
            }
            Some(_) => return AbortedSnafu.fail(),
            None => {}
        }
        let ac = match established {
            Some(ac) => *ac,
            // the machine only reaches here through one of the arms above
            None => return AbortedSnafu.fail(),
        };

        if ac.protocol_version != protocol_version {
            abort_and_close(&mut machine, &mut socket);
            return ProtocolVersionMismatchSnafu {
                expected: protocol_version,
                got: ac.protocol_version,
            }
            .fail();
        }

        let presentation_contexts: Vec<PresentationContextNegotiated> = ac
            .presentation_contexts
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .filter_map(|pc| {
                requested_contexts
                    .iter()
                    .find(|req| req.id == pc.id)
                    .map(|req| PresentationContextNegotiated {
                        id: pc.id,
                        reason: pc.reason.clone(),
                        transfer_syntax: pc.transfer_syntax.clone(),
                        abstract_syntax: req.abstract_syntax.clone(),
                    })
            })
            .collect();
        if presentation_contexts.is_empty() {
            debug!("the peer accepted none of the proposed presentation contexts");
            abort_and_close(&mut machine, &mut socket);
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        let acceptor_max_pdu_length = match ac.user_variables.iter().find_map(|item| match item {
            UserVariableItem::MaxLength(max) => Some(*max),
            _ => None,
        }) {
            // zero means no limit declared;
            // a declared limit below the standard's minimum
            // cannot frame a single PDV and is raised to it
            Some(0) => MAXIMUM_PDU_SIZE,
            Some(max) => max.max(MINIMUM_PDU_SIZE),
            None => DEFAULT_MAX_PDU,
        };

        Ok(ClientAssociation {
            machine,
            presentation_contexts,
            requestor_max_pdu_length: self.max_pdu_length,
            acceptor_max_pdu_length,
            socket,
            buffer,
            strict: self.strict,
        })
    }

    fn connect<T>(&self, ae_address: &AeAddr<T>) -> Result<TcpStream>
    where
        T: ToSocketAddrs,
    {
        match self.socket_options.connection_timeout {
            Some(timeout) => {
                let addrs = ae_address.to_socket_addrs().context(ConnectSnafu)?;
                let mut last_err = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(socket) => return Ok(socket),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "no socket addresses resolved",
                    )
                }))
                .context(ConnectSnafu)
            }
            None => TcpStream::connect(ae_address).context(ConnectSnafu),
        }
    }

    fn user_identity(&self) -> Option<UserIdentity> {
        if let Some(username) = &self.username {
            let (identity_type, secondary) = match &self.password {
                Some(password) => (
                    UserIdentityType::UsernamePassword,
                    password.as_bytes().to_vec(),
                ),
                None => (UserIdentityType::Username, Vec::new()),
            };
            return Some(UserIdentity::new(
                false,
                identity_type,
                username.as_bytes().to_vec(),
                secondary,
            ));
        }
        if let Some(ticket) = &self.kerberos_service_ticket {
            return Some(UserIdentity::new(
                false,
                UserIdentityType::KerberosServiceTicket,
                ticket.to_vec(),
                Vec::new(),
            ));
        }
        if let Some(assertion) = &self.saml_assertion {
            return Some(UserIdentity::new(
                false,
                UserIdentityType::SamlAssertion,
                assertion.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        if let Some(jwt) = &self.jwt {
            return Some(UserIdentity::new(
                false,
                UserIdentityType::Jwt,
                jwt.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        None
    }
}

/// Send an abort through the machine on a best effort basis
/// and shut the transport down.
fn abort_and_close(machine: &mut StateMachine, socket: &mut TcpStream) {
    if let Ok(outputs) = machine.handle(Event::Abort(AbortRQSource::ServiceUser)) {
        for output in outputs {
            if let Output::Send(pdu) = output {
                let mut buffer = Vec::with_capacity(PDU_HEADER_SIZE as usize + 4);
                if write_pdu(&mut buffer, &pdu).is_ok() {
                    let _ = socket.write_all(&buffer);
                }
            }
        }
    }
    let _ = socket.close();
}

/// An established association from the perspective of the requesting node.
///
/// When the value is dropped without a previous release or abort,
/// an orderly release is attempted on a best effort basis.
#[derive(Debug)]
#[must_use]
pub struct ClientAssociation {
    machine: StateMachine,
    /// the presentation contexts accepted by the peer
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length this node admits
    requestor_max_pdu_length: u32,
    /// the maximum PDU length the peer admits
    acceptor_max_pdu_length: u32,
    socket: TcpStream,
    /// write buffer, reused between messages
    buffer: Vec<u8>,
    strict: bool,
}

impl ClientAssociation {
    /// The accepted presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// The current lifecycle state of the association.
    pub fn state(&self) -> AssociationState {
        self.machine.state()
    }

    /// The maximum PDU length the peer admits.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// The maximum PDU length this node admits.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// Send a message to the peer.
    ///
    /// Accepts P-Data, A-RELEASE-RQ and A-ABORT messages;
    /// the state machine refuses the operation
    /// if the association is not in a state to send it.
    pub fn send(&mut self, msg: Pdu) -> Result<()> {
        let event = match msg {
            Pdu::PData { data } => Event::SendData(data),
            Pdu::ReleaseRQ => Event::RequestRelease,
            Pdu::AbortRQ { source } => Event::Abort(source),
            pdu => return SendUnsupportedPduSnafu { pdu: Box::new(pdu) }.fail(),
        };
        let outputs = self.machine.handle(event).context(MachineSnafu)?;
        self.process_outputs(outputs).map(|_| ())
    }

    /// Read one message from the peer.
    ///
    /// Peer aborts and protocol violations surface as errors,
    /// after the machine has already torn the association down.
    pub fn receive(&mut self) -> Result<Pdu> {
        let pdu = self.read_message()?;
        trace!("received {}", pdu.short_description());
        let outputs = self
            .machine
            .handle(Event::PduReceived(pdu.clone()))
            .context(MachineSnafu)?;
        let events = self.process_outputs(outputs)?;
        for event in events {
            if let AssociationEvent::Aborted(kind) = event {
                return match kind {
                    AbortKind::ProtocolError(pdu) => match *pdu {
                        pdu @ Pdu::Unknown { .. } => {
                            UnknownResponseSnafu { pdu: Box::new(pdu) }.fail()
                        }
                        pdu => UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail(),
                    },
                    _ => AbortedSnafu.fail(),
                };
            }
        }
        Ok(pdu)
    }

    /// Gracefully terminate the association,
    /// waiting for the peer's release reply.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.close();
        out
    }

    /// Send an abort message and shut down the connection,
    /// terminating the association immediately.
    pub fn abort(mut self) -> Result<()> {
        let outputs = self
            .machine
            .handle(Event::Abort(AbortRQSource::ServiceUser))
            .context(MachineSnafu)?;
        let out = self.process_outputs(outputs).map(|_| ());
        let _ = self.socket.close();
        out
    }

    /// Prepare a P-Data writer for sending
    /// one message's worth of payload bytes
    /// in the given presentation context.
    pub fn send_pdata(
        &mut self,
        presentation_context_id: u8,
        value_type: PDataValueType,
    ) -> PDataWriter<&mut TcpStream> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            value_type,
            self.acceptor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one message's worth of payload bytes from the peer.
    pub fn receive_pdata(&mut self) -> PDataReader<&mut TcpStream> {
        PDataReader::new(&mut self.socket, self.requestor_max_pdu_length)
    }

    /// Access the underlying transport stream.
    ///
    /// Writing PDUs directly bypasses the state machine,
    /// use with care.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    fn release_impl(&mut self) -> Result<()> {
        let outputs = self
            .machine
            .handle(Event::RequestRelease)
            .context(MachineSnafu)?;
        self.process_outputs(outputs)?;
        loop {
            let pdu = self.read_message()?;
            let outputs = self
                .machine
                .handle(Event::PduReceived(pdu))
                .context(MachineSnafu)?;
            for event in self.process_outputs(outputs)? {
                match event {
                    AssociationEvent::Released => return Ok(()),
                    AssociationEvent::Aborted(_) => return AbortedSnafu.fail(),
                    AssociationEvent::DataReceived(_) => {
                        warn!("discarding incoming message data during release");
                    }
                    _ => {}
                }
            }
        }
    }

    /// Execute the machine's instructions,
    /// returning the notifications for the caller to interpret.
    fn process_outputs(&mut self, outputs: Vec<Output>) -> Result<Vec<AssociationEvent>> {
        let mut events = Vec::new();
        for output in outputs {
            match output {
                Output::Send(pdu) => {
                    self.buffer.clear();
                    write_pdu(&mut self.buffer, &pdu).context(SendSnafu)?;
                    if matches!(pdu, Pdu::PData { .. }) {
                        ensure!(
                            self.buffer.len()
                                <= self.acceptor_max_pdu_length as usize
                                    + PDU_HEADER_SIZE as usize,
                            SendTooLongPduSnafu {
                                length: self.buffer.len(),
                                maximum: self.acceptor_max_pdu_length as usize,
                            }
                        );
                    }
                    self.socket.write_all(&self.buffer).context(WireSendSnafu)?;
                }
                Output::Notify(event) => events.push(event),
                Output::CloseTransport => {
                    let _ = self.socket.close();
                }
            }
        }
        Ok(events)
    }

    fn read_message(&mut self) -> Result<Pdu> {
        match read_pdu(&mut self.socket, self.requestor_max_pdu_length, self.strict) {
            Ok(pdu) => Ok(pdu),
            Err(e) => match super::as_timeout_error(e) {
                Ok(source) => {
                    // the peer did not answer in time, give up on the association
                    if let Ok(outputs) = self.machine.handle(Event::TimerExpired) {
                        let _ = self.process_outputs(outputs);
                    }
                    Err(source).context(TimeoutSnafu)
                }
                Err(e) => {
                    if let Ok(outputs) = self.machine.handle(Event::TransportError) {
                        let _ = self.process_outputs(outputs);
                    }
                    Err(e).context(ReceiveSnafu)
                }
            },
        }
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if !self.machine.is_terminated() {
            let _ = self.release_impl();
        }
        let _ = self.socket.close();
    }
}
