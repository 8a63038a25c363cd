//! Service provider abstraction.
//!
//! A [`ServiceProvider`] receives whole request messages
//! and answers each one with a stream of response messages,
//! without touching fragmentation or the association itself.
//! Implementations override the operations they actually provide;
//! everything else is answered with
//! [`ServiceError::NotSupported`] by the multiplexer.
use snafu::Snafu;

use super::{tags, CommandField, CommandSet, Status, DATA_SET_ABSENT};

/// A whole request message, reassembled from P-Data traffic.
#[derive(Debug, Clone)]
pub struct DimseRequest {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the transfer syntax negotiated for that context,
    /// which governs the encoding of the data set
    pub transfer_syntax: String,
    /// the command set of the message
    pub command: CommandSet,
    /// the accompanying data set, still encoded, if the command declares one
    pub data: Option<Vec<u8>>,
}

/// A whole response message, to be fragmented into P-Data traffic.
#[derive(Debug, Clone)]
pub struct DimseResponse {
    /// the command set of the message
    pub command: CommandSet,
    /// the accompanying data set, already encoded, if any
    pub data: Option<Vec<u8>>,
}

impl DimseResponse {
    /// Build a response command echoing the request's identifiers,
    /// with the given status and no data set.
    pub fn from_status(request: &CommandSet, status: Status) -> Self {
        let mut command = CommandSet::new();
        if let Some(uid) = request.affected_sop_class_uid() {
            command.put_str(tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Ok(field) = request.command_field() {
            if let Some(response_field) = field.response() {
                command.put_u16(tags::COMMAND_FIELD, response_field.code());
            }
        }
        if let Ok(message_id) = request.message_id() {
            command.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        }
        command.put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
        command.put_u16(tags::STATUS, status.0);
        DimseResponse {
            command,
            data: None,
        }
    }

    /// Whether this response ends the message exchange.
    pub fn is_terminal(&self) -> bool {
        self.command
            .status()
            .map(Status::is_terminal)
            .unwrap_or(true)
    }
}

/// The stream of responses to one request,
/// ending with a terminal status.
pub type ResponseStream = Box<dyn Iterator<Item = DimseResponse> + Send>;

/// An error reported by a service provider operation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ServiceError {
    /// the operation is not provided by this node
    NotSupported,

    #[snafu(display("service operation failed: {}", message))]
    Failed { message: String },
}

/// Build a response stream with a single message.
pub fn single(response: DimseResponse) -> ResponseStream {
    Box::new(std::iter::once(response))
}

/// The operations a service class provider may answer.
///
/// Every operation receives the whole request message
/// and returns the stream of response messages for it.
/// The stream must end with a terminal status;
/// the multiplexer synthesizes a failure response
/// when a stream ends without one.
pub trait ServiceProvider {
    /// Answer a verification request.
    /// The default implementation reports success.
    fn c_echo(&mut self, request: DimseRequest) -> Result<ResponseStream, ServiceError> {
        Ok(single(DimseResponse::from_status(
            &request.command,
            Status::SUCCESS,
        )))
    }

    /// Answer a query request with zero or more pending matches
    /// followed by a terminal status.
    fn c_find(&mut self, _request: DimseRequest) -> Result<ResponseStream, ServiceError> {
        Err(ServiceError::NotSupported)
    }

    /// Answer a storage request.
    fn c_store(&mut self, _request: DimseRequest) -> Result<ResponseStream, ServiceError> {
        Err(ServiceError::NotSupported)
    }

    /// Answer a retrieval request delivered on this association.
    fn c_get(&mut self, _request: DimseRequest) -> Result<ResponseStream, ServiceError> {
        Err(ServiceError::NotSupported)
    }

    /// Answer a retrieval request delivered to a third node.
    fn c_move(&mut self, _request: DimseRequest) -> Result<ResponseStream, ServiceError> {
        Err(ServiceError::NotSupported)
    }

    /// Answer a normalized (N-family) request.
    fn n_service(
        &mut self,
        _field: CommandField,
        _request: DimseRequest,
    ) -> Result<ResponseStream, ServiceError> {
        Err(ServiceError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_rq(message_id: u16) -> CommandSet {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1")
            .put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.code())
            .put_u16(tags::MESSAGE_ID, 3)
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
        cmd.put_u16(tags::MESSAGE_ID, message_id);
        cmd
    }

    #[test]
    fn default_echo_reports_success() {
        struct Provider;
        impl ServiceProvider for Provider {}

        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: echo_rq(9),
            data: None,
        };
        let mut responses = Provider.c_echo(request).unwrap();
        let response = responses.next().unwrap();
        assert!(responses.next().is_none());

        assert_eq!(
            response.command.command_field().unwrap(),
            CommandField::CEchoRsp
        );
        assert_eq!(response.command.message_id_being_responded_to().unwrap(), 9);
        assert!(response.command.status().unwrap().is_success());
        assert!(response.is_terminal());
        assert!(!response.command.has_data_set());
    }

    #[test]
    fn other_operations_default_to_not_supported() {
        struct Provider;
        impl ServiceProvider for Provider {}

        let request = DimseRequest {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
            command: echo_rq(1),
            data: None,
        };
        assert!(matches!(
            Provider.c_find(request.clone()),
            Err(ServiceError::NotSupported)
        ));
        assert!(matches!(
            Provider.c_store(request),
            Err(ServiceError::NotSupported)
        ));
    }
}
