//! Message multiplexer.
//!
//! The [`DimseMultiplexer`] sits between an association
//! and a [`ServiceProvider`]:
//! it reassembles incoming P-Data fragments into whole request messages,
//! routes each request to the matching provider operation
//! and fragments the responses back into P-Data traffic.
//!
//! Provider failures never tear the association down,
//! they surface to the peer as a terminal failure status.
use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::BytesMut;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::pdata::fragment_pdvs;
use crate::association::{CloseSocket, ServerAssociation};
use crate::pdu::{
    PDataValue, PDataValueType, Pdu, PresentationContextNegotiated,
    PresentationContextResultReason,
};

use super::service::{single, DimseRequest, DimseResponse, ResponseStream, ServiceError};
use super::{CommandField, CommandSet, ServiceProvider, Status};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("message arrived on unknown presentation context {}", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "data fragments arrived on presentation context {} with no pending command",
        id
    ))]
    DataWithoutCommand { id: u8, backtrace: Backtrace },

    /// could not decode command set
    DecodeCommand {
        #[snafu(backtrace)]
        source: super::Error,
    },

    /// could not encode command set
    EncodeCommand {
        #[snafu(backtrace)]
        source: super::Error,
    },

    /// association channel failure
    Association {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The in-progress reassembly of one message on one presentation context.
#[derive(Debug, Default)]
struct MessageAssembly {
    command: BytesMut,
    parsed_command: Option<CommandSet>,
    expects_data: bool,
    data: BytesMut,
}

/// A message-layer multiplexer over one association.
///
/// Interleaved fragments of different presentation contexts
/// are reassembled independently;
/// within one context, the command fragments of a message
/// are expected before its data fragments.
pub struct DimseMultiplexer<P> {
    provider: P,
    /// transfer syntax per accepted presentation context
    contexts: HashMap<u8, String>,
    /// the PDU length bound for outgoing messages
    max_pdu_length: u32,
    assemblies: HashMap<u8, MessageAssembly>,
}

impl<P> DimseMultiplexer<P>
where
    P: ServiceProvider,
{
    /// Create a multiplexer for the given provider,
    /// serving the accepted subset of the given presentation contexts.
    ///
    /// `max_pdu_length` bounds the PDUs of outgoing messages;
    /// [`serve`](Self::serve) further caps it
    /// at the maximum admitted by the peer.
    pub fn new(
        provider: P,
        presentation_contexts: &[PresentationContextNegotiated],
        max_pdu_length: u32,
    ) -> Self {
        let contexts = presentation_contexts
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .map(|pc| (pc.id, pc.transfer_syntax.clone()))
            .collect();
        DimseMultiplexer {
            provider,
            contexts,
            max_pdu_length,
            assemblies: HashMap::new(),
        }
    }

    pub fn into_provider(self) -> P {
        self.provider
    }

    /// Feed the fragments of one P-Data PDU into the reassembler,
    /// collecting the request messages completed by them.
    pub fn handle_pdata(&mut self, values: Vec<PDataValue>) -> Result<Vec<DimseRequest>> {
        let mut completed = Vec::new();
        for pdv in values {
            let id = pdv.presentation_context_id;
            let transfer_syntax = self
                .contexts
                .get(&id)
                .context(UnknownPresentationContextSnafu { id })?
                .clone();
            let assembly = self.assemblies.entry(id).or_default();

            match pdv.value_type {
                PDataValueType::Command => {
                    if assembly.parsed_command.is_some() {
                        warn!(
                            "new command fragments on context {} discard an incomplete message",
                            id
                        );
                        *assembly = MessageAssembly::default();
                    }
                    assembly.command.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        let command = CommandSet::read_from(&assembly.command[..])
                            .context(DecodeCommandSnafu)?;
                        assembly.command.clear();
                        assembly.expects_data = command.has_data_set();
                        if assembly.expects_data {
                            assembly.parsed_command = Some(command);
                        } else {
                            completed.push(DimseRequest {
                                presentation_context_id: id,
                                transfer_syntax,
                                command,
                                data: None,
                            });
                            self.assemblies.remove(&id);
                        }
                    }
                }
                PDataValueType::Data => {
                    // a data fragment is only meaningful
                    // after its message's command set announced a data set
                    if assembly.parsed_command.is_none() {
                        self.assemblies.remove(&id);
                        return DataWithoutCommandSnafu { id }.fail();
                    }
                    assembly.data.extend_from_slice(&pdv.data);
                    if pdv.is_last {
                        let command = assembly
                            .parsed_command
                            .take()
                            .unwrap_or_default();
                        let data = assembly.data.split().freeze().to_vec();
                        completed.push(DimseRequest {
                            presentation_context_id: id,
                            transfer_syntax,
                            command,
                            data: Some(data),
                        });
                        self.assemblies.remove(&id);
                    }
                }
            }
        }
        Ok(completed)
    }

    /// Dispatch a request to the provider,
    /// returning its responses as a stream
    /// guaranteed to end with a terminal status.
    ///
    /// Provider errors become a single terminal failure response.
    pub fn dispatch(&mut self, request: DimseRequest) -> ResponseStream {
        let template = request.command.clone();

        let field = match request.command.command_field() {
            Ok(field) => field,
            Err(e) => {
                warn!("request with unusable command field: {}", e);
                return single(DimseResponse::from_status(
                    &template,
                    Status::PROCESSING_FAILURE,
                ));
            }
        };

        // a cancel terminates nothing here, there is no response to give
        if field == CommandField::CCancelRq {
            debug!("cancel request received, no operation in progress");
            return Box::new(std::iter::empty());
        }

        let outcome = match field {
            CommandField::CEchoRq => self.provider.c_echo(request),
            CommandField::CFindRq => self.provider.c_find(request),
            CommandField::CStoreRq => self.provider.c_store(request),
            CommandField::CGetRq => self.provider.c_get(request),
            CommandField::CMoveRq => self.provider.c_move(request),
            CommandField::NEventReportRq
            | CommandField::NGetRq
            | CommandField::NSetRq
            | CommandField::NActionRq
            | CommandField::NCreateRq
            | CommandField::NDeleteRq => self.provider.n_service(field, request),
            field => {
                warn!("received {:?}, which is not a request", field);
                return single(DimseResponse::from_status(
                    &template,
                    Status::PROCESSING_FAILURE,
                ));
            }
        };

        match outcome {
            Ok(stream) => Box::new(Terminated {
                inner: Some(stream),
                template,
            }),
            Err(ServiceError::NotSupported) => single(DimseResponse::from_status(
                &template,
                Status::SOP_CLASS_NOT_SUPPORTED,
            )),
            Err(ServiceError::Failed { message }) => {
                warn!("service operation failed: {}", message);
                single(DimseResponse::from_status(
                    &template,
                    Status::PROCESSING_FAILURE,
                ))
            }
        }
    }

    /// Fragment one response message into P-Data values,
    /// command fragments first, then data fragments.
    pub fn encode_response(
        &self,
        presentation_context_id: u8,
        response: &DimseResponse,
    ) -> Result<Vec<PDataValue>> {
        let mut command_bytes = Vec::new();
        response
            .command
            .write_to(&mut command_bytes)
            .context(EncodeCommandSnafu)?;

        let mut pdvs = fragment_pdvs(
            presentation_context_id,
            PDataValueType::Command,
            &command_bytes,
            self.max_pdu_length,
        );
        if let Some(data) = &response.data {
            pdvs.extend(fragment_pdvs(
                presentation_context_id,
                PDataValueType::Data,
                data,
                self.max_pdu_length,
            ));
        }
        Ok(pdvs)
    }

    /// Group presentation data values into P-Data PDUs,
    /// packing as many as fit under the PDU length bound.
    fn group_into_pdus(&self, pdvs: Vec<PDataValue>) -> Vec<Vec<PDataValue>> {
        let bound = self.max_pdu_length as usize;
        let mut pdus = Vec::new();
        let mut current = Vec::new();
        let mut current_len = 0;
        for pdv in pdvs {
            // each PDV item carries a 4-byte length field,
            // the context identifier and the message control header
            let item_len = 6 + pdv.data.len();
            if !current.is_empty() && current_len + item_len > bound {
                pdus.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current_len += item_len;
            current.push(pdv);
        }
        if !current.is_empty() {
            pdus.push(current);
        }
        pdus
    }

    /// Serve the given association until the peer releases it.
    ///
    /// Returns once the release exchange completes;
    /// peer aborts and transport failures are reported as errors.
    pub fn serve<S>(&mut self, association: &mut ServerAssociation<S>) -> Result<()>
    where
        S: Read + Write + CloseSocket,
    {
        // outgoing PDUs must never exceed what the peer admits
        self.max_pdu_length = self
            .max_pdu_length
            .min(association.requestor_max_pdu_length());
        loop {
            match association.receive().context(AssociationSnafu)? {
                Pdu::PData { data } => {
                    for request in self.handle_pdata(data)? {
                        let context_id = request.presentation_context_id;
                        for response in self.dispatch(request) {
                            let pdvs = self.encode_response(context_id, &response)?;
                            for data in self.group_into_pdus(pdvs) {
                                association
                                    .send(Pdu::PData { data })
                                    .context(AssociationSnafu)?;
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    debug!("association released by the peer");
                    return Ok(());
                }
                pdu => {
                    // the machine inside the association
                    // already answered or aborted as appropriate
                    warn!("ignoring {} at the message layer", pdu.short_description());
                }
            }
        }
    }
}

/// Caps a provider stream at its first terminal status
/// and synthesizes a failure when the stream ends without one.
struct Terminated {
    inner: Option<ResponseStream>,
    template: CommandSet,
}

impl Iterator for Terminated {
    type Item = DimseResponse;

    fn next(&mut self) -> Option<DimseResponse> {
        let inner = self.inner.as_mut()?;
        match inner.next() {
            Some(response) => {
                if response.is_terminal() {
                    self.inner = None;
                }
                Some(response)
            }
            None => {
                warn!("response stream ended without a terminal status");
                self.inner = None;
                Some(DimseResponse::from_status(
                    &self.template,
                    Status::PROCESSING_FAILURE,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{tags, DATA_SET_ABSENT, DATA_SET_PRESENT};
    use super::*;

    struct EchoOnly;
    impl ServiceProvider for EchoOnly {}

    fn contexts() -> Vec<PresentationContextNegotiated> {
        vec![
            PresentationContextNegotiated {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
            },
            PresentationContextNegotiated {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
                abstract_syntax: "1.2.999.1".to_string(),
            },
        ]
    }

    fn echo_rq(message_id: u16) -> CommandSet {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1")
            .put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.code())
            .put_u16(tags::MESSAGE_ID, message_id)
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
        cmd
    }

    fn command_pdvs(cmd: &CommandSet, context_id: u8, chunk: usize) -> Vec<PDataValue> {
        let mut bytes = Vec::new();
        cmd.write_to(&mut bytes).unwrap();
        let chunks: Vec<_> = bytes.chunks(chunk).collect();
        chunks
            .iter()
            .enumerate()
            .map(|(i, data)| PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: i == chunks.len() - 1,
                data: data.to_vec(),
            })
            .collect()
    }

    #[test]
    fn reassembles_fragmented_command() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let pdvs = command_pdvs(&echo_rq(11), 1, 10);
        assert!(pdvs.len() > 1);

        // feed all but the last fragment, nothing completes
        let (last, init) = pdvs.split_last().unwrap();
        let requests = mux.handle_pdata(init.to_vec()).unwrap();
        assert!(requests.is_empty());

        let requests = mux.handle_pdata(vec![last.clone()]).unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.presentation_context_id, 1);
        assert_eq!(request.transfer_syntax, "1.2.840.10008.1.2");
        assert_eq!(request.command.message_id().unwrap(), 11);
        assert!(request.data.is_none());
    }

    #[test]
    fn command_and_data_make_one_request() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let mut cmd = echo_rq(5);
        cmd.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);

        let mut pdvs = command_pdvs(&cmd, 1, 4096);
        pdvs.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: false,
            data: vec![1, 2, 3],
        });
        pdvs.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![4, 5],
        });

        let requests = mux.handle_pdata(pdvs).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].data.as_deref(), Some(&[1, 2, 3, 4, 5][..]));
    }

    #[test]
    fn data_without_a_pending_command_is_an_error() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let pdvs = vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![1, 2, 3],
        }];
        assert!(matches!(
            mux.handle_pdata(pdvs),
            Err(Error::DataWithoutCommand { id: 1, .. })
        ));
    }

    #[test]
    fn unknown_context_is_an_error() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        // context 3 exists but was not accepted
        let pdvs = command_pdvs(&echo_rq(1), 3, 4096);
        assert!(matches!(
            mux.handle_pdata(pdvs),
            Err(Error::UnknownPresentationContext { id: 3, .. })
        ));
    }

    #[test]
    fn echo_dispatch_yields_single_success() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: echo_rq(21),
            data: None,
        };
        let responses: Vec<_> = mux.dispatch(request).collect();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].command.status().unwrap().is_success());
        assert_eq!(
            responses[0]
                .command
                .message_id_being_responded_to()
                .unwrap(),
            21
        );
    }

    #[test]
    fn unsupported_operation_yields_terminal_status() {
        let mut mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let mut cmd = echo_rq(2);
        cmd.put_u16(tags::COMMAND_FIELD, CommandField::CFindRq.code());
        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: cmd,
            data: None,
        };
        let responses: Vec<_> = mux.dispatch(request).collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].command.status().unwrap(),
            Status::SOP_CLASS_NOT_SUPPORTED
        );
    }

    #[test]
    fn failing_provider_yields_single_failure() {
        struct Failing;
        impl ServiceProvider for Failing {
            fn c_echo(
                &mut self,
                _request: DimseRequest,
            ) -> std::result::Result<ResponseStream, ServiceError> {
                Err(ServiceError::Failed {
                    message: "backend unavailable".to_string(),
                })
            }
        }

        let mut mux = DimseMultiplexer::new(Failing, &contexts(), 16_384);
        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: echo_rq(2),
            data: None,
        };
        let responses: Vec<_> = mux.dispatch(request).collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].command.status().unwrap(),
            Status::PROCESSING_FAILURE
        );
        assert!(responses[0].is_terminal());
    }

    #[test]
    fn stream_without_terminal_status_is_capped_with_failure() {
        struct PendingForever;
        impl ServiceProvider for PendingForever {
            fn c_find(
                &mut self,
                request: DimseRequest,
            ) -> std::result::Result<ResponseStream, ServiceError> {
                let pending =
                    DimseResponse::from_status(&request.command, Status::PENDING);
                Ok(Box::new(vec![pending.clone(), pending].into_iter()))
            }
        }

        let mut mux = DimseMultiplexer::new(PendingForever, &contexts(), 16_384);
        let mut cmd = echo_rq(8);
        cmd.put_u16(tags::COMMAND_FIELD, CommandField::CFindRq.code());
        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: cmd,
            data: None,
        };
        let responses: Vec<_> = mux.dispatch(request).collect();
        assert_eq!(responses.len(), 3);
        assert!(responses[0].command.status().unwrap().is_pending());
        assert!(responses[1].command.status().unwrap().is_pending());
        assert_eq!(
            responses[2].command.status().unwrap(),
            Status::PROCESSING_FAILURE
        );
    }

    #[test]
    fn pending_stream_is_capped_at_the_terminal_status() {
        struct TwoMatches;
        impl ServiceProvider for TwoMatches {
            fn c_find(
                &mut self,
                request: DimseRequest,
            ) -> std::result::Result<ResponseStream, ServiceError> {
                let mut pending =
                    DimseResponse::from_status(&request.command, Status::PENDING);
                pending
                    .command
                    .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
                pending.data = Some(vec![0x08, 0x00]);
                let done = DimseResponse::from_status(&request.command, Status::SUCCESS);
                Ok(Box::new(
                    vec![pending.clone(), pending, done].into_iter(),
                ))
            }
        }

        let mut mux = DimseMultiplexer::new(TwoMatches, &contexts(), 16_384);
        let mut cmd = echo_rq(4);
        cmd.put_u16(tags::COMMAND_FIELD, CommandField::CFindRq.code());
        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: cmd,
            data: None,
        };
        let responses: Vec<_> = mux.dispatch(request).collect();
        assert_eq!(responses.len(), 3);
        assert!(responses[2].command.status().unwrap().is_success());
    }

    #[test]
    fn large_responses_span_multiple_pdus_within_the_bound() {
        let bound = 4_096;
        let mux = DimseMultiplexer::new(EchoOnly, &contexts(), bound);
        let mut response = DimseResponse::from_status(&echo_rq(1), Status::SUCCESS);
        response
            .command
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        response.data = Some(vec![0x77; bound as usize * 3]);

        let pdvs = mux.encode_response(1, &response).unwrap();
        let pdus = mux.group_into_pdus(pdvs);
        assert!(pdus.len() > 1);
        for pdu in &pdus {
            let body_len: usize = pdu.iter().map(|pdv| 6 + pdv.data.len()).sum();
            assert!(body_len <= bound as usize);
        }
        assert!(pdus.last().unwrap().last().unwrap().is_last);
    }

    #[test]
    fn responses_are_encoded_command_first() {
        let mux = DimseMultiplexer::new(EchoOnly, &contexts(), 16_384);
        let mut response =
            DimseResponse::from_status(&echo_rq(1), Status::SUCCESS);
        response
            .command
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT);
        response.data = Some(vec![0xAA; 64]);

        let pdvs = mux.encode_response(1, &response).unwrap();
        assert!(pdvs.len() >= 2);
        assert_eq!(pdvs[0].value_type, PDataValueType::Command);
        assert_eq!(pdvs.last().unwrap().value_type, PDataValueType::Data);
        assert!(pdvs.last().unwrap().is_last);
    }
}
