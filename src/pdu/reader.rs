//! PDU decoding from arbitrary byte sources.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// no PDU available
    NoPduAvailable { backtrace: Backtrace },

    /// could not read PDU
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not read PDU item
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation data item length {} (must be at least 2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display("could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU is too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an item {:?} where it is not admitted", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    /// more than one transfer syntax in a presentation context result
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    /// invalid association rejection source or reason
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    /// invalid abort source or reason
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    /// invalid presentation context result reason
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    /// invalid transfer syntax sub-item
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    /// unknown presentation context sub-item
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("text field `{}` is not valid ISO 646 text", field))]
    InvalidText {
        field: &'static str,
        backtrace: Backtrace,
    },
    /// missing application context name
    MissingApplicationContextName { backtrace: Backtrace },
    /// missing abstract syntax
    MissingAbstractSyntax { backtrace: Backtrace },
    /// missing transfer syntax
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a full PDU from the given source.
///
/// A clean end of stream before the first header byte
/// yields [`Error::NoPduAvailable`].
/// In strict mode, a PDU longer than `max_pdu_length` is an error;
/// otherwise it is tolerated with a warning
/// up to the absolute maximum of the standard.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // An unexpected EOF on the first two bytes means that no PDU was started,
    // which callers may treat as an orderly end of traffic.
    // Past this point, truncation is always an error.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if pdu_length > max_pdu_length {
        ensure!(
            !strict,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
        // lenient mode still refuses anything past the standard's ceiling
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "tolerating incoming PDU of length {} over the maximum {}",
            pdu_length, max_pdu_length
        );
    }

    let body = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(body);

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ
            let header = read_association_header(&mut cursor)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version: header.protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title: header.called_ae_title,
                calling_ae_title: header.calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC;
            // the AE title fields are formally reserved here,
            // echoing the request, and are decoded without validation
            let header = read_association_header(&mut cursor)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version: header.protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title: header.called_ae_title,
                calling_ae_title: header.calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ
            skip_reserved(&mut cursor, 1)?;
            let result = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Result" })?;
            let source = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag.",
            })?;

            Ok(Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::from(result)
                    .context(InvalidRejectSourceOrReasonSnafu)?,
                source: AssociationRJSource::from(source, reason)
                    .context(InvalidRejectSourceOrReasonSnafu)?,
            }))
        }
        0x04 => {
            // P-DATA-TF
            let mut values = vec![];
            while has_remaining(&cursor) {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                // context ID byte plus control header byte
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // message control header:
                // bit 0 set means command fragment,
                // bit 1 set means last fragment of its object
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;
                let value_type = if header & 0x01 != 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last: header & 0x02 != 0,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ
            skip_reserved(&mut cursor, 4)?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP
            skip_reserved(&mut cursor, 4)?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT
            skip_reserved(&mut cursor, 2)?;
            let source = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "Source" })?;
            let reason = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Reason/Diag",
            })?;

            Ok(Pdu::AbortRQ {
                source: AbortRQSource::from(source, reason)
                    .context(InvalidAbortSourceOrReasonSnafu)?,
            })
        }
        _ => {
            let data = read_n(&mut cursor, pdu_length as usize)
                .context(ReadPduFieldSnafu { field: "Unknown" })?;
            Ok(Pdu::Unknown { pdu_type, data })
        }
    }
}

/// The fields shared by the association request and acknowledgement,
/// up to the first variable item.
struct AssociationHeader {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

fn read_association_header(cursor: &mut Cursor<Vec<u8>>) -> Result<AssociationHeader> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    skip_reserved(cursor, 2)?;

    // both AE title fields are 16 bytes of ISO 646 text,
    // leading and trailing spaces being non-significant
    let called_ae_title = read_text(cursor, 16, "Called-AE-title")?;
    let calling_ae_title = read_text(cursor, 16, "Calling-AE-title")?;
    skip_reserved(cursor, 32)?;

    Ok(AssociationHeader {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn has_remaining(cursor: &Cursor<Vec<u8>>) -> bool {
    cursor.position() < cursor.get_ref().len() as u64
}

fn skip_reserved(cursor: &mut Cursor<Vec<u8>>, bytes: u32) -> Result<()> {
    cursor
        .seek(SeekFrom::Current(i64::from(bytes)))
        .context(ReadReservedSnafu { bytes })?;
    Ok(())
}

/// Read exactly `bytes_to_read` bytes.
/// A source with fewer bytes than declared
/// is a framing error, not a shorter result.
fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = vec![0; bytes_to_read];
    reader.read_exact(&mut result)?;
    Ok(result)
}

/// Decode a sequence of bytes as ISO 646 (basic G0 set) text,
/// trimming non-significant surrounding whitespace and trailing nulls.
fn read_text<R>(reader: &mut R, len: usize, field: &'static str) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, len).context(ReadPduFieldSnafu { field })?;
    ensure!(bytes.is_ascii(), InvalidTextSnafu { field });
    let text: &str = std::str::from_utf8(&bytes)
        .ok()
        .context(InvalidTextSnafu { field })?;
    Ok(text.trim_end_matches('\0').trim().to_string())
}

/// Read the type and length of the next sub-item,
/// skipping the reserved byte between them.
fn read_item_header<R>(reader: &mut R) -> Result<(u8, u16)>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    Ok((item_type, item_length))
}

fn read_pdu_variable<R>(reader: &mut R) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, item_length) = read_item_header(reader)?;
    let body = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(body);

    match item_type {
        0x10 => {
            // Application Context Item
            let len = cursor.get_ref().len();
            let val = read_text(&mut cursor, len, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item (proposed)
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            skip_reserved(&mut cursor, 3)?;

            // one abstract syntax sub-item
            // followed by one or more transfer syntax sub-items
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_item_header(&mut cursor)?;
                match item_type {
                    0x30 => {
                        abstract_syntax = Some(read_text(
                            &mut cursor,
                            item_length as usize,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_text(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item (result)
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            skip_reserved(&mut cursor, 1)?;

            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;
            skip_reserved(&mut cursor, 1)?;

            // exactly one transfer syntax sub-item,
            // only significant when the reason is acceptance
            let mut transfer_syntax: Option<String> = None;
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_item_header(&mut cursor)?;
                match item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_text(
                            &mut cursor,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information Item
            let mut user_variables = vec![];
            while has_remaining(&cursor) {
                let (item_type, item_length) = read_item_header(&mut cursor)?;
                match item_type {
                    0x51 => {
                        // Maximum Length sub-item;
                        // zero means no maximum specified
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        user_variables.push(UserVariableItem::ImplementationClassUid(read_text(
                            &mut cursor,
                            item_length as usize,
                            "Implementation-class-uid",
                        )?));
                    }
                    0x55 => {
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            read_text(
                                &mut cursor,
                                item_length as usize,
                                "Implementation-version-name",
                            )?,
                        ));
                    }
                    0x56 => {
                        user_variables.push(read_sop_class_extended_negotiation(&mut cursor)?);
                    }
                    0x58 => {
                        if let Some(item) = read_user_identity(&mut cursor)? {
                            user_variables.push(item);
                        }
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

/// Read a SOP Class Extended Negotiation sub-item body (0x56).
fn read_sop_class_extended_negotiation(
    cursor: &mut Cursor<Vec<u8>>,
) -> Result<UserVariableItem> {
    let sop_class_uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "SOP-class-uid-length",
    })?;
    let sop_class_uid = read_text(cursor, sop_class_uid_length as usize, "SOP-class-uid")?;

    let data_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Service-class-application-information-length",
    })?;
    let data = read_n(cursor, data_length as usize).context(ReadPduFieldSnafu {
        field: "Service-class-application-information",
    })?;

    Ok(UserVariableItem::SopClassExtendedNegotiationSubItem(
        sop_class_uid,
        data,
    ))
}

/// Read a User Identity Negotiation sub-item body (0x58).
/// An unknown identity type code is tolerated and dropped with a warning.
fn read_user_identity(cursor: &mut Cursor<Vec<u8>>) -> Result<Option<UserVariableItem>> {
    let identity_type_code = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "User-Identity-type",
    })?;
    let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
        field: "User-Identity-positive-response-requested",
    })?;

    let primary_field_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "User-Identity-primary-field-length",
    })?;
    let primary_field =
        read_n(cursor, primary_field_length as usize).context(ReadPduFieldSnafu {
            field: "User-Identity-primary-field",
        })?;

    // only non-zero for the username and password kind
    let secondary_field_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "User-Identity-secondary-field-length",
    })?;
    let secondary_field =
        read_n(cursor, secondary_field_length as usize).context(ReadPduFieldSnafu {
            field: "User-Identity-secondary-field",
        })?;

    match UserIdentityType::from(identity_type_code) {
        Some(identity_type) => Ok(Some(UserVariableItem::UserIdentityItem(UserIdentity::new(
            positive_response_requested == 1,
            identity_type,
            primary_field,
            secondary_field,
        )))),
        None => {
            warn!("unknown user identity type code {}", identity_type_code);
            Ok(None)
        }
    }
}
