//! PDU encoding into arbitrary byte sinks.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write `{}` chunk: {}", name, source))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("could not write field `{}`: {}", field, source))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("could not write {} reserved bytes: {}", bytes, source))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("field `{}` is not valid ISO 646 text", field))]
    EncodeText {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("AE title `{}` is longer than 16 bytes", ae_title))]
    AeTitleTooLong {
        ae_title: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("could not build chunk: {}", source))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("could not write chunk length: {}", source))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("could not write chunk data: {}", source))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Write a length-prefixed chunk with a 32-bit big endian length field.
///
/// The body is buffered first,
/// so the declared length always matches the bytes written.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

/// Same as [`write_chunk_u32`], with a 16-bit length field.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteLengthSnafu)?;
    writer.write_all(&data).context(WriteDataSnafu)?;
    Ok(())
}

fn encode_text<'a>(text: &'a str, field: &'static str) -> Result<&'a [u8]> {
    ensure!(text.is_ascii(), EncodeTextSnafu { field });
    Ok(text.as_bytes())
}

/// Write the type code of a PDU followed by its reserved byte.
fn write_pdu_header(writer: &mut dyn Write, pdu_type: u8) -> Result<()> {
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "PDU-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    Ok(())
}

/// Write the type code of a variable item or sub-item
/// followed by its reserved byte.
/// The 16-bit length field which follows is produced by [`write_chunk_u16`].
fn write_item_header(writer: &mut dyn Write, item_type: u8) -> Result<()> {
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;
    Ok(())
}

/// Encode an AE title as exactly 16 bytes, space padded.
fn write_ae_title(writer: &mut dyn Write, ae_title: &str, field: &'static str) -> Result<()> {
    ensure!(
        ae_title.len() <= 16,
        AeTitleTooLongSnafu {
            ae_title: ae_title.to_string()
        }
    );
    let mut ae_title_bytes = encode_text(ae_title, field)?.to_vec();
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Write the fixed fields shared by the association request
/// and acknowledgement PDUs,
/// up to the first variable item.
fn write_association_fields(
    writer: &mut dyn Write,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;
    write_ae_title(writer, called_ae_title, "Called-AE-title")?;
    write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })?;
    Ok(())
}

/// The wire codes of an association rejection source and reason.
fn rejection_codes(source: &AssociationRJSource) -> (u8, u8) {
    match source {
        AssociationRJSource::ServiceUser(reason) => (
            0x01,
            match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 0x02,
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 0x03,
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 0x07,
                AssociationRJServiceUserReason::Reserved(code) => *code,
            },
        ),
        AssociationRJSource::ServiceProviderAsce(reason) => (
            0x02,
            match reason {
                AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 0x02,
            },
        ),
        AssociationRJSource::ServiceProviderPresentation(reason) => (
            0x03,
            match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 0x01,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 0x02,
                AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
            },
        ),
    }
}

/// The wire codes of an abort source and reason.
fn abort_codes(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0x00, 0x00),
        AbortRQSource::Reserved => (0x01, 0x00),
        AbortRQSource::ServiceProvider(reason) => (
            0x02,
            match reason {
                AbortRQServiceProviderReason::ReasonNotSpecified => 0x00,
                AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                AbortRQServiceProviderReason::Reserved => 0x03,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
            },
        ),
    }
}

/// Write a full PDU into the given sink.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ
            write_pdu_header(writer, 0x01)?;
            write_chunk_u32(writer, |writer| {
                write_association_fields(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;
                write_application_context_item(writer, application_context_name)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_proposed(writer, presentation_context)?;
                }
                write_user_information_item(writer, user_variables)
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;
            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC;
            // the AE title fields are formally reserved here
            // and echo the titles of the request
            write_pdu_header(writer, 0x02)?;
            write_chunk_u32(writer, |writer| {
                write_association_fields(
                    writer,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;
                write_application_context_item(writer, application_context_name)?;
                for presentation_context in presentation_contexts {
                    write_presentation_context_result(writer, presentation_context)?;
                }
                write_user_information_item(writer, user_variables)
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })?;
            Ok(())
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // A-ASSOCIATE-RJ
            write_pdu_header(writer, 0x03)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                let (source_code, reason_code) = rejection_codes(source);
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;
            Ok(())
        }
        Pdu::PData { data } => {
            // P-DATA-TF
            write_pdu_header(writer, 0x04)?;
            write_chunk_u32(writer, |writer| {
                for pdv in data {
                    write_chunk_u32(writer, |writer| {
                        writer.write_u8(pdv.presentation_context_id).context(
                            WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            },
                        )?;

                        // message control header:
                        // bit 0 for command,
                        // bit 1 for the last fragment of the object
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = pdv.value_type {
                            message_header |= 0x01;
                        }
                        if pdv.is_last {
                            message_header |= 0x02;
                        }
                        writer.write_u8(message_header).context(WriteFieldSnafu {
                            field: "Presentation-data-value control header",
                        })?;

                        writer.write_all(&pdv.data).context(WriteFieldSnafu {
                            field: "Presentation-data-value",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "PData" })?;
            Ok(())
        }
        Pdu::ReleaseRQ => {
            // A-RELEASE-RQ
            write_pdu_header(writer, 0x05)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteReservedSnafu { bytes: 4_u32 })
            })
            .context(WriteChunkSnafu { name: "ReleaseRQ" })?;
            Ok(())
        }
        Pdu::ReleaseRP => {
            // A-RELEASE-RP
            write_pdu_header(writer, 0x06)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(WriteReservedSnafu { bytes: 4_u32 })
            })
            .context(WriteChunkSnafu { name: "ReleaseRP" })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            // A-ABORT
            write_pdu_header(writer, 0x07)?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0x00; 2])
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                let (source_code, reason_code) = abort_codes(source);
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason_code).context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })
            })
            .context(WriteChunkSnafu { name: "AbortRQ" })?;
            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            write_pdu_header(writer, *pdu_type)?;
            write_chunk_u32(writer, |writer| {
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Unknown data",
                })
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;
            Ok(())
        }
    }
}

/// Write an Application Context Item (0x10).
fn write_application_context_item(
    writer: &mut dyn Write,
    application_context_name: &str,
) -> Result<()> {
    write_item_header(writer, 0x10)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(encode_text(
                application_context_name,
                "Application-context-name",
            )?)
            .context(WriteFieldSnafu {
                field: "Application-context-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Application Context Item",
    })?;
    Ok(())
}

/// Write a proposed Presentation Context Item (0x20)
/// with its abstract syntax and transfer syntax sub-items.
fn write_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
) -> Result<()> {
    write_item_header(writer, 0x20)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0x00; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        write_item_header(writer, 0x30)?;
        write_chunk_u16(writer, |writer| {
            writer
                .write_all(encode_text(
                    &presentation_context.abstract_syntax,
                    "Abstract-syntax-name",
                )?)
                .context(WriteFieldSnafu {
                    field: "Abstract-syntax-name",
                })
        })
        .context(WriteChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        // one transfer syntax sub-item per proposal,
        // in order of preference
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_transfer_syntax_sub_item(writer, transfer_syntax)?;
        }
        Ok(())
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;
    Ok(())
}

/// Write a result Presentation Context Item (0x21)
/// with its single transfer syntax sub-item.
fn write_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
) -> Result<()> {
    write_item_header(writer, 0x21)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        writer
            .write_u8(match &presentation_context.reason {
                PresentationContextResultReason::Acceptance => 0,
                PresentationContextResultReason::UserRejection => 1,
                PresentationContextResultReason::NoReason => 2,
                PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
                PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
            })
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // exactly one transfer syntax sub-item,
        // not significant unless the reason is acceptance
        write_transfer_syntax_sub_item(writer, &presentation_context.transfer_syntax)
    })
    .context(WriteChunkSnafu {
        name: "Presentation Context Item",
    })?;
    Ok(())
}

fn write_transfer_syntax_sub_item(writer: &mut dyn Write, transfer_syntax: &str) -> Result<()> {
    write_item_header(writer, 0x40)?;
    write_chunk_u16(writer, |writer| {
        writer
            .write_all(encode_text(transfer_syntax, "Transfer-syntax-name")?)
            .context(WriteFieldSnafu {
                field: "Transfer-syntax-name",
            })
    })
    .context(WriteChunkSnafu {
        name: "Transfer Syntax Sub-Item",
    })?;
    Ok(())
}

/// Write a User Information Item (0x50) with its sub-items.
/// Nothing is written when there are no user variables.
fn write_user_information_item(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item_header(writer, 0x50)?;
    write_chunk_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    write_item_header(writer, 0x51)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Maximum-length-received",
                    })?;
                }
                UserVariableItem::ImplementationClassUid(implementation_class_uid) => {
                    write_item_header(writer, 0x52)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(encode_text(
                                implementation_class_uid,
                                "Implementation-class-uid",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-class-uid",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-class-uid",
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    write_item_header(writer, 0x55)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_all(encode_text(
                                implementation_version_name,
                                "Implementation-version-name",
                            )?)
                            .context(WriteFieldSnafu {
                                field: "Implementation-version-name",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Implementation-version-name",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    write_item_header(writer, 0x56)?;
                    write_chunk_u16(writer, |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(encode_text(sop_class_uid, "SOP-class-uid")?)
                                .context(WriteFieldSnafu {
                                    field: "SOP-class-uid",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;

                        write_chunk_u16(writer, |writer| {
                            writer.write_all(data).context(WriteFieldSnafu {
                                field: "Service-class-application-information",
                            })
                        })
                        .context(WriteChunkSnafu {
                            name: "Service-class-application-information",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "SOP Class Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    write_item_header(writer, 0x58)?;
                    write_chunk_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type().to_u8())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-primary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-primary-field",
                        })?;

                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(&user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-secondary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-secondary-field",
                        })
                    })
                    .context(WriteChunkSnafu {
                        name: "User Identity Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item_header(writer, *item_type)?;
                    write_chunk_u16(writer, |writer| {
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Unknown Data",
                        })
                    })
                    .context(WriteChunkSnafu { name: "Unknown" })?;
                }
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "User-data" })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_chunks_with_preceding_u32_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .context(WriteChunkSnafu { name: "Chunk1" })?;

        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);

        Ok(())
    }

    #[test]
    fn can_write_chunks_with_preceding_u16_length() -> Result<()> {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, |writer| {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "Field1" })?;
            write_chunk_u16(writer, |writer| {
                writer
                    .write_u8(0x03)
                    .context(WriteFieldSnafu { field: "Field2" })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Chunk2" })
        })
        .context(WriteChunkSnafu { name: "Chunk1" })?;

        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);

        Ok(())
    }

    #[test]
    fn ae_titles_longer_than_16_bytes_fail() {
        let mut out = vec![];
        let e = write_ae_title(&mut out, "A-VERY-LONG-AE-TITLE", "Called-AE-title");
        assert!(matches!(e, Err(Error::AeTitleTooLong { .. })));
    }
}
