//! DICOM message service element (DIMSE) support.
//!
//! This module covers the message layer above the association:
//! the [`CommandSet`] codec for command messages
//! in Implicit VR Little Endian,
//! the [service provider abstraction](service)
//! and the [multiplexer](multiplexer)
//! which reassembles incoming P-Data traffic into whole messages
//! and dispatches them to the provider.
pub mod multiplexer;
pub mod service;

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io::{Read, Write};

use byteordered::ByteOrdered;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::warn;

pub use multiplexer::DimseMultiplexer;
pub use service::{DimseRequest, DimseResponse, ResponseStream, ServiceError, ServiceProvider};

/// Element numbers of the command group (0000,_xxxx_).
pub mod tags {
    /// Command Group Length
    pub const COMMAND_GROUP_LENGTH: u16 = 0x0000;
    /// Affected SOP Class UID
    pub const AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
    /// Requested SOP Class UID
    pub const REQUESTED_SOP_CLASS_UID: u16 = 0x0003;
    /// Command Field
    pub const COMMAND_FIELD: u16 = 0x0100;
    /// Message ID
    pub const MESSAGE_ID: u16 = 0x0110;
    /// Message ID Being Responded To
    pub const MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
    /// Move Destination
    pub const MOVE_DESTINATION: u16 = 0x0600;
    /// Priority
    pub const PRIORITY: u16 = 0x0700;
    /// Command Data Set Type
    pub const COMMAND_DATA_SET_TYPE: u16 = 0x0800;
    /// Status
    pub const STATUS: u16 = 0x0900;
    /// Affected SOP Instance UID
    pub const AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;
    /// Requested SOP Instance UID
    pub const REQUESTED_SOP_INSTANCE_UID: u16 = 0x1001;
    /// Number of Remaining Sub-operations
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: u16 = 0x1020;
    /// Number of Completed Sub-operations
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: u16 = 0x1021;
    /// Number of Failed Sub-operations
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: u16 = 0x1022;
    /// Number of Warning Sub-operations
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: u16 = 0x1023;
}

/// Command Data Set Type value declaring that a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0001;
/// Command Data Set Type value declaring that no data set follows.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// The kind of operation named by a command message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(CommandField::CStoreRq),
            0x8001 => Some(CommandField::CStoreRsp),
            0x0010 => Some(CommandField::CGetRq),
            0x8010 => Some(CommandField::CGetRsp),
            0x0020 => Some(CommandField::CFindRq),
            0x8020 => Some(CommandField::CFindRsp),
            0x0021 => Some(CommandField::CMoveRq),
            0x8021 => Some(CommandField::CMoveRsp),
            0x0030 => Some(CommandField::CEchoRq),
            0x8030 => Some(CommandField::CEchoRsp),
            0x0100 => Some(CommandField::NEventReportRq),
            0x8100 => Some(CommandField::NEventReportRsp),
            0x0110 => Some(CommandField::NGetRq),
            0x8110 => Some(CommandField::NGetRsp),
            0x0120 => Some(CommandField::NSetRq),
            0x8120 => Some(CommandField::NSetRsp),
            0x0130 => Some(CommandField::NActionRq),
            0x8130 => Some(CommandField::NActionRsp),
            0x0140 => Some(CommandField::NCreateRq),
            0x8140 => Some(CommandField::NCreateRsp),
            0x0150 => Some(CommandField::NDeleteRq),
            0x8150 => Some(CommandField::NDeleteRsp),
            0x0FFF => Some(CommandField::CCancelRq),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CGetRq => 0x0010,
            CommandField::CGetRsp => 0x8010,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::NEventReportRq => 0x0100,
            CommandField::NEventReportRsp => 0x8100,
            CommandField::NGetRq => 0x0110,
            CommandField::NGetRsp => 0x8110,
            CommandField::NSetRq => 0x0120,
            CommandField::NSetRsp => 0x8120,
            CommandField::NActionRq => 0x0130,
            CommandField::NActionRsp => 0x8130,
            CommandField::NCreateRq => 0x0140,
            CommandField::NCreateRsp => 0x8140,
            CommandField::NDeleteRq => 0x0150,
            CommandField::NDeleteRsp => 0x8150,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    /// Whether this is a request operation.
    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0
    }

    /// The response operation matching this request.
    pub fn response(self) -> Option<CommandField> {
        if self.is_request() && self != CommandField::CCancelRq {
            CommandField::from_code(self.code() | 0x8000)
        } else {
            None
        }
    }
}

/// A DIMSE status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const CANCEL: Status = Status(0xFE00);
    pub const PENDING: Status = Status(0xFF00);
    /// pending, with some optional keys unsupported
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const PROCESSING_FAILURE: Status = Status(0xC000);

    pub fn is_success(self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_pending(self) -> bool {
        self.0 == 0xFF00 || self.0 == 0xFF01
    }

    pub fn is_cancel(self) -> bool {
        self.0 == 0xFE00
    }

    /// Whether this status ends the message exchange,
    /// successfully or not.
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}H", self.0)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to read command element header
    ReadHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read command element value
    ReadValue {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to write command element
    WriteElement {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unreasonable command element length {}", length))]
    ElementLengthTooLarge { length: u32, backtrace: Backtrace },

    #[snafu(display("missing command element (0000,{:04X})", element))]
    MissingElement { element: u16, backtrace: Backtrace },

    #[snafu(display("command element (0000,{:04X}) has invalid contents", element))]
    InvalidElement { element: u16, backtrace: Backtrace },

    #[snafu(display("unknown command field {:04X}H", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An upper bound on a single command element value.
/// Command sets are small, anything beyond this is corrupt input.
const MAX_ELEMENT_LENGTH: u32 = 1 << 24;

/// A command message in Implicit VR Little Endian,
/// as carried by the command fragments of P-Data traffic.
///
/// Values are kept raw,
/// with typed accessors for the elements the message layer needs.
/// Elements stay sorted by element number,
/// so encoding always emits a standards-ordered group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSet {
    elements: BTreeMap<u16, Vec<u8>>,
}

impl CommandSet {
    pub fn new() -> Self {
        CommandSet::default()
    }

    /// Decode a command set from its full payload.
    ///
    /// A group length element is tolerated and dropped,
    /// it is recalculated on encoding.
    /// Elements outside the command group are skipped with a warning.
    pub fn read_from<R: Read>(mut reader: R) -> Result<CommandSet> {
        let mut elements = BTreeMap::new();
        loop {
            let group = match ByteOrdered::le(&mut reader).read_u16() {
                Ok(group) => group,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context(ReadHeaderSnafu),
            };
            let element = ByteOrdered::le(&mut reader).read_u16().context(ReadHeaderSnafu)?;
            let length = ByteOrdered::le(&mut reader).read_u32().context(ReadHeaderSnafu)?;
            snafu::ensure!(
                length <= MAX_ELEMENT_LENGTH,
                ElementLengthTooLargeSnafu { length }
            );
            let mut value = vec![0; length as usize];
            reader.read_exact(&mut value).context(ReadValueSnafu)?;

            if group != 0x0000 {
                warn!(
                    "skipping foreign element ({:04X},{:04X}) in command set",
                    group, element
                );
                continue;
            }
            if element == tags::COMMAND_GROUP_LENGTH {
                continue;
            }
            elements.insert(element, value);
        }
        Ok(CommandSet { elements })
    }

    /// Encode the command set,
    /// preceded by a freshly calculated group length element.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let group_length: u32 = self
            .elements
            .iter()
            .map(|(_, value)| 8 + value.len() as u32)
            .sum();
        Self::write_header(&mut writer, tags::COMMAND_GROUP_LENGTH, 4)?;
        ByteOrdered::le(&mut writer)
            .write_u32(group_length)
            .context(WriteElementSnafu)?;

        for (element, value) in &self.elements {
            Self::write_header(&mut writer, *element, value.len() as u32)?;
            writer.write_all(value).context(WriteElementSnafu)?;
        }
        Ok(())
    }

    fn write_header<W: Write>(writer: &mut W, element: u16, length: u32) -> Result<()> {
        let mut writer = ByteOrdered::le(writer);
        writer.write_u16(0x0000).context(WriteElementSnafu)?;
        writer.write_u16(element).context(WriteElementSnafu)?;
        writer.write_u32(length).context(WriteElementSnafu)?;
        Ok(())
    }

    /// The number of elements, not counting the group length.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The raw value of the given element, if present.
    pub fn get(&self, element: u16) -> Option<&[u8]> {
        self.elements.get(&element).map(|v| v.as_slice())
    }

    pub fn get_u16(&self, element: u16) -> Option<u16> {
        let value = self.elements.get(&element)?;
        let bytes: [u8; 2] = value.get(..2)?.try_into().ok()?;
        Some(u16::from_le_bytes(bytes))
    }

    pub fn get_str(&self, element: u16) -> Option<&str> {
        let value = self.elements.get(&element)?;
        std::str::from_utf8(value)
            .ok()
            .map(|s| s.trim_end_matches(['\0', ' ']))
    }

    /// Insert or replace an element with a raw value.
    /// The value is padded with a null byte to an even length.
    pub fn put(&mut self, element: u16, mut value: Vec<u8>) -> &mut Self {
        if value.len() % 2 != 0 {
            value.push(0);
        }
        self.elements.insert(element, value);
        self
    }

    pub fn put_u16(&mut self, element: u16, value: u16) -> &mut Self {
        self.put(element, value.to_le_bytes().to_vec())
    }

    pub fn put_str(&mut self, element: u16, value: &str) -> &mut Self {
        self.put(element, value.as_bytes().to_vec())
    }

    /// The operation this command message names.
    pub fn command_field(&self) -> Result<CommandField> {
        let code = self
            .get_u16(tags::COMMAND_FIELD)
            .context(MissingElementSnafu {
                element: tags::COMMAND_FIELD,
            })?;
        CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })
    }

    pub fn message_id(&self) -> Result<u16> {
        self.get_u16(tags::MESSAGE_ID).context(MissingElementSnafu {
            element: tags::MESSAGE_ID,
        })
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
            .context(MissingElementSnafu {
                element: tags::MESSAGE_ID_BEING_RESPONDED_TO,
            })
    }

    pub fn status(&self) -> Result<Status> {
        self.get_u16(tags::STATUS)
            .map(Status)
            .context(MissingElementSnafu {
                element: tags::STATUS,
            })
    }

    pub fn affected_sop_class_uid(&self) -> Option<&str> {
        self.get_str(tags::AFFECTED_SOP_CLASS_UID)
    }

    /// Whether the command declares an accompanying data set.
    /// An absent Command Data Set Type counts as no data set.
    pub fn has_data_set(&self) -> bool {
        self.get_u16(tags::COMMAND_DATA_SET_TYPE)
            .map(|value| value != DATA_SET_ABSENT)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_rq() -> CommandSet {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1")
            .put_u16(tags::COMMAND_FIELD, CommandField::CEchoRq.code())
            .put_u16(tags::MESSAGE_ID, 41)
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_ABSENT);
        cmd
    }

    #[test]
    fn command_set_round_trip() {
        let cmd = echo_rq();
        let mut encoded = Vec::new();
        cmd.write_to(&mut encoded).unwrap();

        // group length element comes first
        assert_eq!(&encoded[..4], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&encoded[4..8], &[0x04, 0x00, 0x00, 0x00]);

        let decoded = CommandSet::read_from(&encoded[..]).unwrap();
        assert_eq!(decoded.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(decoded.message_id().unwrap(), 41);
        assert_eq!(
            decoded.affected_sop_class_uid(),
            Some("1.2.840.10008.1.1")
        );
        assert!(!decoded.has_data_set());
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn odd_length_values_are_padded() {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.5.1.4.31");
        // 22 characters, even, stays as is
        assert_eq!(cmd.get(tags::AFFECTED_SOP_CLASS_UID).unwrap().len(), 22);

        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.1.1");
        // 17 characters, null padded to 18
        assert_eq!(cmd.get(tags::AFFECTED_SOP_CLASS_UID).unwrap().len(), 18);
        // the accessor strips the padding back off
        assert_eq!(
            cmd.affected_sop_class_uid(),
            Some("1.2.840.10008.1.1")
        );
    }

    #[test]
    fn find_rsp_codec_round_trip() {
        let mut cmd = CommandSet::new();
        cmd.put_str(tags::AFFECTED_SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.2.1.1")
            .put_u16(tags::COMMAND_FIELD, CommandField::CFindRsp.code())
            .put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, 7)
            .put_u16(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT)
            .put_u16(tags::STATUS, Status::PENDING.0);

        let mut encoded = Vec::new();
        cmd.write_to(&mut encoded).unwrap();
        let decoded = CommandSet::read_from(&encoded[..]).unwrap();

        assert_eq!(decoded.command_field().unwrap(), CommandField::CFindRsp);
        assert_eq!(decoded.message_id_being_responded_to().unwrap(), 7);
        assert_eq!(decoded.status().unwrap(), Status::PENDING);
        assert!(decoded.status().unwrap().is_pending());
        assert!(decoded.has_data_set());
    }

    #[test]
    fn group_length_on_input_is_dropped_and_recalculated() {
        let cmd = echo_rq();
        let mut encoded = Vec::new();
        cmd.write_to(&mut encoded).unwrap();

        let decoded = CommandSet::read_from(&encoded[..]).unwrap();
        // the group length element does not count as content
        assert_eq!(decoded.len(), 4);

        let mut reencoded = Vec::new();
        decoded.write_to(&mut reencoded).unwrap();
        assert_eq!(reencoded, encoded);
    }

    #[test]
    fn missing_fields_are_reported() {
        let cmd = CommandSet::new();
        assert!(matches!(
            cmd.command_field(),
            Err(Error::MissingElement { element, .. }) if element == tags::COMMAND_FIELD
        ));
        assert!(matches!(cmd.status(), Err(Error::MissingElement { .. })));
    }

    #[test]
    fn request_response_code_pairing() {
        assert_eq!(
            CommandField::CEchoRq.response(),
            Some(CommandField::CEchoRsp)
        );
        assert_eq!(
            CommandField::CFindRq.response(),
            Some(CommandField::CFindRsp)
        );
        assert_eq!(CommandField::CFindRsp.response(), None);
        assert_eq!(CommandField::CCancelRq.response(), None);
        assert!(CommandField::CCancelRq.is_request());
    }
}
