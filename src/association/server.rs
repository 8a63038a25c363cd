//! Association acceptor module
//!
//! The main entrypoint is [`ServerAssociationOptions`],
//! which declares what this node is willing to negotiate
//! and turns incoming connections into established associations.
//!
//! ```no_run
//! # use std::net::TcpListener;
//! # use dicom_dimse::association::ServerAssociationOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("0.0.0.0:11111")?;
//! let options = ServerAssociationOptions::new()
//!     .accept_called_ae_title()
//!     .ae_title("RUST-SCP")
//!     .with_abstract_syntax("1.2.840.10008.1.1");
//! let (socket, _peer) = listener.accept()?;
//! let mut association = options.establish(socket)?;
//! # Ok(())
//! # }
//! ```
use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use snafu::{ensure, ResultExt};
use tracing::{trace, warn};

use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, PDataValueType, Pdu,
    PresentationContextNegotiated, PresentationContextResult, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::registry::{UidRegistry, DICOM_APPLICATION_CONTEXT};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::machine::{
    AbortKind, AssociationEvent, AssociationState, Event, Output, StateMachine,
};
use super::negotiation::{negotiate, AcceptorPolicy, NegotiationOutcome};
use super::pdata::{PDataReader, PDataWriter};
use super::uid::trim_uid;
use super::{
    AbortedSnafu, CloseSocket, MachineSnafu, ReceiveSnafu, RejectedSnafu, Result, SendSnafu,
    SendTooLongPduSnafu, SendUnsupportedPduSnafu, SetReadTimeoutSnafu, SetWriteTimeoutSnafu,
    SocketOptions, TimeoutSnafu, UnexpectedResponseSnafu, UnknownResponseSnafu, WireSendSnafu,
};

/// Decides whether an incoming association request
/// is acceptable based on the application entity titles involved.
pub trait AccessControl {
    /// Decide the fate of the request,
    /// returning the rejection reason to reply with
    /// when access is denied.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// Accept all associations regardless of the AE titles involved.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// Accept associations only when the called AE title
/// matches the AE title of this node.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAeTitleNotRecognized)
        }
    }
}

/// A set of options and a builder
/// for accepting incoming association requests.
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the access control policy for incoming requests
    ae_access_control: A,
    /// the AE title of this node
    ae_title: Cow<'a, str>,
    /// the application context name to accept
    application_context_name: Cow<'a, str>,
    /// the abstract syntaxes this node provides services for
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the transfer syntaxes this node is willing to converse in;
    /// when empty, anything the registry supports is acceptable
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the maximum PDU length this node admits
    max_pdu_length: u32,
    /// whether to receive PDUs strictly within the declared limit
    strict: bool,
    /// accept any abstract syntax regardless of the list above
    promiscuous: bool,
    /// the UID registry consulted during negotiation
    registry: Arc<UidRegistry>,
    /// timeouts applied to the connection
    socket_options: SocketOptions,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            registry: Arc::new(UidRegistry::new_with_standard_entries()),
            socket_options: SocketOptions::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Accept requests regardless of the AE titles involved.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Accept requests only when the called AE title
    /// matches the AE title of this node.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Replace the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            max_pdu_length,
            strict,
            promiscuous,
            registry,
            socket_options,
        } = self;
        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            max_pdu_length,
            strict,
            promiscuous,
            registry,
            socket_options,
        }
    }

    /// Define the application entity title of this node.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Add an abstract syntax this node provides services for.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax.into()));
        self
    }

    /// Add a transfer syntax this node is willing to converse in.
    /// When none is given,
    /// any transfer syntax the registry supports is acceptable.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax.into()));
        self
    }

    /// Define the maximum PDU length this node admits.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving a PDU larger than the declared maximum
    /// is an error (`true`) or tolerated with a warning (`false`).
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Accept any abstract syntax,
    /// regardless of the list declared through `with_abstract_syntax`.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Replace the UID registry consulted during negotiation.
    pub fn with_registry(mut self, registry: Arc<UidRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Define the timeout for individual socket reads.
    /// This also bounds how long the acceptor waits
    /// for the next message of an established association.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Define the timeout for individual socket writes.
    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, socket: TcpStream) -> Result<ServerAssociation<TcpStream>> {
        socket
            .set_read_timeout(self.socket_options.read_timeout)
            .context(SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout)
            .context(SetWriteTimeoutSnafu)?;
        self.establish_on(socket)
    }

    /// Negotiate an association over an arbitrary transport.
    pub fn establish_on<S>(&self, mut socket: S) -> Result<ServerAssociation<S>>
    where
        S: Read + Write + CloseSocket,
    {
        let max_pdu_length = self.max_pdu_length;
        let mut machine = StateMachine::new();

        // the request may exceed the declared limit,
        // the limit only binds after it is communicated to the peer
        let request = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, self.strict).context(ReceiveSnafu)?;
        let outputs = machine
            .handle(Event::PduReceived(request))
            .context(MachineSnafu)?;

        let mut rq = None;
        for output in outputs {
            match output {
                Output::Send(pdu) => send_single(&mut socket, &pdu)?,
                Output::Notify(AssociationEvent::RequestReceived(received)) => {
                    rq = Some(*received)
                }
                Output::Notify(AssociationEvent::Aborted(AbortKind::ProtocolError(pdu))) => {
                    let _ = socket.close();
                    return match *pdu {
                        pdu @ Pdu::Unknown { .. } => {
                            UnknownResponseSnafu { pdu: Box::new(pdu) }.fail()
                        }
                        pdu => UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail(),
                    };
                }
                Output::Notify(_) => {}
                Output::CloseTransport => {
                    let _ = socket.close();
                }
            }
        }
        let rq = match rq {
            Some(rq) => rq,
            None => return AbortedSnafu.fail(),
        };
        trace!(
            "association requested by {} to {}",
            rq.calling_ae_title,
            rq.called_ae_title
        );

        // protocol version is a bit field, bit 1 names version 1
        if rq.protocol_version & 0x0001 == 0 {
            return refuse(
                &mut machine,
                &mut socket,
                AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: AssociationRJSource::ServiceProviderAsce(
                        crate::pdu::AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                    ),
                },
            );
        }

        if rq.application_context_name != self.application_context_name {
            return refuse(
                &mut machine,
                &mut socket,
                AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    ),
                },
            );
        }

        if let Err(reason) = self.ae_access_control.check_access(
            &self.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
        ) {
            return refuse(
                &mut machine,
                &mut socket,
                AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: AssociationRJSource::ServiceUser(reason),
                },
            );
        }

        let policy = AcceptorPolicy {
            registry: Arc::clone(&self.registry),
            abstract_syntaxes: self
                .abstract_syntax_uids
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            transfer_syntaxes: self
                .transfer_syntax_uids
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            promiscuous: self.promiscuous,
        };
        let presentation_contexts = match negotiate(&policy, &rq.presentation_contexts) {
            NegotiationOutcome::Accepted { contexts } => contexts,
            NegotiationOutcome::Rejected(association_rj) => {
                return refuse(&mut machine, &mut socket, association_rj);
            }
        };

        let requestor_max_pdu_length = match rq.user_variables.iter().find_map(|item| match item {
            UserVariableItem::MaxLength(max) => Some(*max),
            _ => None,
        }) {
            // zero means no limit declared;
            // a declared limit below the standard's minimum
            // cannot frame a single PDV and is raised to it
            Some(0) => u32::MAX,
            Some(max) => max.max(MINIMUM_PDU_SIZE),
            None => DEFAULT_MAX_PDU,
        };

        let ac = AssociationAC {
            protocol_version: 1,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason.clone(),
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            user_variables: vec![
                UserVariableItem::MaxLength(max_pdu_length),
                UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        };

        let outputs = machine.handle(Event::Accept(ac)).context(MachineSnafu)?;
        for output in outputs {
            match output {
                Output::Send(pdu) => send_single(&mut socket, &pdu)?,
                Output::Notify(_) => {}
                Output::CloseTransport => {
                    let _ = socket.close();
                }
            }
        }

        Ok(ServerAssociation {
            machine,
            presentation_contexts,
            requestor_max_pdu_length,
            acceptor_max_pdu_length: max_pdu_length,
            client_ae_title: rq.calling_ae_title,
            socket,
            buffer: Vec::with_capacity(max_pdu_length as usize + PDU_HEADER_SIZE as usize),
            strict: self.strict,
        })
    }
}

/// Write one PDU directly to the transport.
fn send_single<S: Write>(socket: &mut S, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::with_capacity(PDU_HEADER_SIZE as usize + 128);
    write_pdu(&mut buffer, pdu).context(SendSnafu)?;
    socket.write_all(&buffer).context(WireSendSnafu)
}

/// Reject the pending association request and report the rejection.
fn refuse<S, T>(
    machine: &mut StateMachine,
    socket: &mut S,
    association_rj: AssociationRJ,
) -> Result<T>
where
    S: Write + CloseSocket,
{
    let outputs = machine
        .handle(Event::Reject(association_rj.clone()))
        .context(MachineSnafu)?;
    for output in outputs {
        match output {
            Output::Send(pdu) => send_single(socket, &pdu)?,
            Output::Notify(_) => {}
            Output::CloseTransport => {
                let _ = socket.close();
            }
        }
    }
    RejectedSnafu { association_rj }.fail()
}

/// An established association from the perspective of the accepting node.
#[derive(Debug)]
#[must_use]
pub struct ServerAssociation<S> {
    machine: StateMachine,
    /// the negotiated presentation contexts, accepted and rejected
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the maximum PDU length the peer admits
    requestor_max_pdu_length: u32,
    /// the maximum PDU length this node admits
    acceptor_max_pdu_length: u32,
    /// the AE title of the requesting node
    client_ae_title: String,
    socket: S,
    /// write buffer, reused between messages
    buffer: Vec<u8>,
    strict: bool,
}

impl<S> ServerAssociation<S> {
    /// The negotiated presentation contexts,
    /// including the ones which were not accepted.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// The negotiated presentation context with the given identifier,
    /// if it exists and was accepted.
    pub fn accepted_presentation_context(
        &self,
        id: u8,
    ) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts.iter().find(|pc| {
            pc.id == id
                && pc.reason == crate::pdu::PresentationContextResultReason::Acceptance
        })
    }

    /// The AE title of the requesting node.
    pub fn client_ae_title(&self) -> &str {
        &self.client_ae_title
    }

    /// The current lifecycle state of the association.
    pub fn state(&self) -> AssociationState {
        self.machine.state()
    }

    /// The maximum PDU length the peer admits.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The maximum PDU length this node admits.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }
}

impl<S> ServerAssociation<S>
where
    S: Read + Write + CloseSocket,
{
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
    /// A release request from the peer is answered automatically
    /// before this method returns it,
    /// so the caller only needs to stop using the association.
    /// Peer aborts and protocol violations surface as errors.
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

    /// Send an abort message and shut down the connection,
    /// terminating the association immediately.
    pub fn abort(mut self) -> Result<()> {
        let outputs = self
            .machine
            .handle(Event::Abort(AbortRQSource::ServiceProvider(
                crate::pdu::AbortRQServiceProviderReason::ReasonNotSpecified,
            )))
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
    ) -> PDataWriter<&mut S> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            value_type,
            self.requestor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one message's worth of payload bytes from the peer.
    pub fn receive_pdata(&mut self) -> PDataReader<&mut S> {
        PDataReader::new(&mut self.socket, self.acceptor_max_pdu_length)
    }

    /// Access the underlying transport stream.
    ///
    /// Writing PDUs directly bypasses the state machine,
    /// use with care.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }

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
                                <= self.requestor_max_pdu_length as usize
                                    + PDU_HEADER_SIZE as usize,
                            SendTooLongPduSnafu {
                                length: self.buffer.len(),
                                maximum: self.requestor_max_pdu_length as usize,
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
        match read_pdu(&mut self.socket, self.acceptor_max_pdu_length, self.strict) {
            Ok(pdu) => Ok(pdu),
            Err(e) => match super::as_timeout_error(e) {
                Ok(source) => {
                    warn!("peer did not answer in time, aborting association");
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
