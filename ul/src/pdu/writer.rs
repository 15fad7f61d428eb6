//! Encoding of protocol data units into a byte sink.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::TextCodec;
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write {} structure", name))]
    Chunk {
        /// the name of the PDU structure
        name: &'static str,
        source: ChunkError,
    },

    #[snafu(display("could not write PDU field `{}`", name))]
    Field {
        name: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("could not write {} reserved bytes", count))]
    Reserved {
        count: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("could not encode text field `{}`", name))]
    Encode {
        name: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to write a length-prefixed piece of a PDU.
#[derive(Debug, Snafu)]
pub enum ChunkError {
    #[snafu(display("could not build chunk contents"))]
    BuildChunk {
        backtrace: Backtrace,
        source: Box<Error>,
    },
    #[snafu(display("could not write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("could not write chunk contents"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Run the given writing function over an in-memory buffer,
/// then write the buffer prefixed by its length in 32 bits.
fn write_sized_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), ChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Run the given writing function over an in-memory buffer,
/// then write the buffer prefixed by its length in 16 bits.
fn write_sized_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), ChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(BuildChunkSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write an AE title field,
/// ASCII-coerced and padded with spaces to exactly 16 bytes.
fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    codec: &dyn TextCodec,
    name: &'static str,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeSnafu { name })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes[..16])
        .context(FieldSnafu { name })
}

/// Write a full PDU to the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = dicom_encoding::text::DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type, 2 - Reserved
            writer
                .write_u8(0x01)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                // 7-8 - Protocol-version, 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(FieldSnafu {
                        name: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(ReservedSnafu { count: 2_u32 })?;

                // 11-26 - Called-AE-title, 27-42 - Calling-AE-title
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(ReservedSnafu { count: 32_u32 })?;

                // 75-xxx - variable items:
                // application context, presentation contexts, user information
                write_application_context_item(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_presentation_context_rq_item(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_user_information_item(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(ChunkSnafu {
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
            // 1 - PDU-type, 2 - Reserved
            writer
                .write_u8(0x02)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                // 7-8 - Protocol-version, 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(FieldSnafu {
                        name: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(ReservedSnafu { count: 2_u32 })?;

                // 11-42 - reserved in the AC,
                // but echoed back with the values from the request
                // as recommended by PS3.8 §9.3.3
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(ReservedSnafu { count: 32_u32 })?;

                write_application_context_item(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_presentation_context_ac_item(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_user_information_item(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(ChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 1 - PDU-type, 2 - Reserved
            writer
                .write_u8(0x03)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(ReservedSnafu { count: 1_u32 })?;

                // 8 - Result: 1 - rejected-permanent, 2 - rejected-transient
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(FieldSnafu { name: "Result" })?;

                // 9 - Source, 10 - Reason/Diag.
                let (source_code, reason_code) = match source {
                    AssociationRJSource::ServiceUser(reason) => (
                        0x01,
                        match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                                0x02
                            }
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                            AssociationRJServiceUserReason::Reserved(code) => *code,
                        },
                    ),
                    AssociationRJSource::ServiceProviderAcse(reason) => (
                        0x02,
                        match reason {
                            AssociationRJServiceProviderAcseReason::NoReasonGiven => 0x01,
                            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => {
                                0x02
                            }
                        },
                    ),
                    AssociationRJSource::ServiceProviderPresentation(reason) => (
                        0x03,
                        match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                0x01
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                                0x02
                            }
                            AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                        },
                    ),
                };
                writer
                    .write_u8(source_code)
                    .context(FieldSnafu { name: "Source" })?;
                writer.write_u8(reason_code).context(FieldSnafu {
                    name: "Reason/Diag.",
                })?;

                Ok(())
            })
            .context(ChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            // 1 - PDU-type, 2 - Reserved
            writer
                .write_u8(0x04)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_sized_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer
                            .write_u8(presentation_data_value.presentation_context_id)
                            .context(FieldSnafu {
                                name: "Presentation-context-ID",
                            })?;

                        // 6 - message control header:
                        // bit 0 is the command flag, bit 1 the last-fragment flag
                        let mut message_header = 0x00;
                        if let PDataValueType::Command = presentation_data_value.value_type {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.write_u8(message_header).context(FieldSnafu {
                            name: "Message Control Header",
                        })?;

                        // 7-xxx - the message fragment
                        writer
                            .write_all(&presentation_data_value.data)
                            .context(FieldSnafu {
                                name: "Presentation-data-value",
                            })?;

                        Ok(())
                    })
                    .context(ChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
            .context(ChunkSnafu { name: "P-DATA-TF" })
        }
        Pdu::ReleaseRQ => {
            writer
                .write_u8(0x05)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(ReservedSnafu { count: 4_u32 })
            })
            .context(ChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;

            Ok(())
        }
        Pdu::ReleaseRP => {
            writer
                .write_u8(0x06)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                writer
                    .write_all(&[0u8; 4])
                    .context(ReservedSnafu { count: 4_u32 })
            })
            .context(ChunkSnafu {
                name: "A-RELEASE-RP",
            })?;

            Ok(())
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_u8(0x07)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                // 7-8 - Reserved
                writer
                    .write_all(&[0u8; 2])
                    .context(ReservedSnafu { count: 2_u32 })?;

                // 9 - Source, 10 - Reason/Diag;
                // the reason is only significant
                // for provider initiated aborts
                let (source_code, reason_code) = match source {
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
                };
                writer
                    .write_u8(source_code)
                    .context(FieldSnafu { name: "Source" })?;
                writer.write_u8(reason_code).context(FieldSnafu {
                    name: "Reason/Diag",
                })?;

                Ok(())
            })
            .context(ChunkSnafu { name: "A-ABORT" })?;

            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_u8(*pdu_type)
                .context(FieldSnafu { name: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u32(writer, |writer| {
                writer.write_all(data).context(FieldSnafu {
                    name: "Unknown data",
                })
            })
            .context(ChunkSnafu { name: "Unknown" })?;

            Ok(())
        }
    }
}

fn write_application_context_item(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type (10H), 2 - Reserved
    writer
        .write_u8(0x10)
        .context(FieldSnafu { name: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(ReservedSnafu { count: 1_u32 })?;

    write_sized_u16(writer, |writer| {
        writer
            .write_all(&codec.encode(application_context_name).context(
                EncodeSnafu {
                    name: "Application-context-name",
                },
            )?)
            .context(FieldSnafu {
                name: "Application-context-name",
            })
    })
    .context(ChunkSnafu {
        name: "Application Context Item",
    })?;

    Ok(())
}

fn write_presentation_context_rq_item(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type (20H), 2 - Reserved
    writer
        .write_u8(0x20)
        .context(FieldSnafu { name: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(ReservedSnafu { count: 1_u32 })?;

    write_sized_u16(writer, |writer| {
        // 5 - Presentation-context-ID, 6-8 - Reserved
        writer
            .write_u8(presentation_context.id)
            .context(FieldSnafu {
                name: "Presentation-context-ID",
            })?;
        writer
            .write_all(&[0u8; 3])
            .context(ReservedSnafu { count: 3_u32 })?;

        // one abstract syntax sub-item (30H)
        writer
            .write_u8(0x30)
            .context(FieldSnafu { name: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(ReservedSnafu { count: 1_u32 })?;

        write_sized_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.abstract_syntax)
                        .context(EncodeSnafu {
                            name: "Abstract-syntax-name",
                        })?,
                )
                .context(FieldSnafu {
                    name: "Abstract-syntax-name",
                })
        })
        .context(ChunkSnafu {
            name: "Abstract Syntax Sub-Item",
        })?;

        // one or more transfer syntax sub-items (40H)
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(FieldSnafu { name: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(ReservedSnafu { count: 1_u32 })?;

            write_sized_u16(writer, |writer| {
                writer
                    .write_all(&codec.encode(transfer_syntax).context(EncodeSnafu {
                        name: "Transfer-syntax-name",
                    })?)
                    .context(FieldSnafu {
                        name: "Transfer-syntax-name",
                    })
            })
            .context(ChunkSnafu {
                name: "Transfer Syntax Sub-Item",
            })?;
        }

        Ok(())
    })
    .context(ChunkSnafu {
        name: "Presentation Context Item",
    })?;

    Ok(())
}

fn write_presentation_context_ac_item(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type (21H), 2 - Reserved
    writer
        .write_u8(0x21)
        .context(FieldSnafu { name: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(ReservedSnafu { count: 1_u32 })?;

    write_sized_u16(writer, |writer| {
        // 5 - Presentation-context-ID, 6 - Reserved
        writer
            .write_u8(presentation_context.id)
            .context(FieldSnafu {
                name: "Presentation-context-ID",
            })?;
        writer
            .write_u8(0x00)
            .context(ReservedSnafu { count: 1_u32 })?;

        // 7 - Result/Reason, 8 - Reserved
        writer
            .write_u8(presentation_context.reason as u8)
            .context(FieldSnafu {
                name: "Result/Reason",
            })?;
        writer
            .write_u8(0x00)
            .context(ReservedSnafu { count: 1_u32 })?;

        // 9-xxx - one transfer syntax sub-item (40H),
        // not significant unless the context was accepted
        writer
            .write_u8(0x40)
            .context(FieldSnafu { name: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(ReservedSnafu { count: 1_u32 })?;

        write_sized_u16(writer, |writer| {
            writer
                .write_all(
                    &codec
                        .encode(&presentation_context.transfer_syntax)
                        .context(EncodeSnafu {
                            name: "Transfer-syntax-name",
                        })?,
                )
                .context(FieldSnafu {
                    name: "Transfer-syntax-name",
                })
        })
        .context(ChunkSnafu {
            name: "Transfer Syntax Sub-Item",
        })?;

        Ok(())
    })
    .context(ChunkSnafu {
        name: "Presentation Context Item",
    })
}

fn write_sized_uid(
    writer: &mut dyn Write,
    uid: &str,
    codec: &dyn TextCodec,
    name: &'static str,
) -> Result<()> {
    write_sized_u16(writer, |writer| {
        writer
            .write_all(&codec.encode(uid).context(EncodeSnafu { name })?)
            .context(FieldSnafu { name })
    })
    .context(ChunkSnafu { name: "UID" })
}

fn write_user_information_item(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type (50H), 2 - Reserved
    writer
        .write_u8(0x50)
        .context(FieldSnafu { name: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(ReservedSnafu { count: 1_u32 })?;

    write_sized_u16(writer, |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    writer
                        .write_u8(0x51)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(FieldSnafu {
                                name: "Maximum-length-received",
                            })
                    })
                    .context(ChunkSnafu {
                        name: "Maximum Length Sub-Item",
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    writer
                        .write_u8(0x52)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_uid(
                        writer,
                        implementation_class_uid,
                        codec,
                        "Implementation-class-uid",
                    )?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    writer
                        .write_u8(0x55)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        writer
                            .write_all(&codec.encode(implementation_version_name).context(
                                EncodeSnafu {
                                    name: "Implementation-version-name",
                                },
                            )?)
                            .context(FieldSnafu {
                                name: "Implementation-version-name",
                            })
                    })
                    .context(ChunkSnafu {
                        name: "Implementation Version Name Sub-Item",
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    writer
                        .write_u8(0x53)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(FieldSnafu {
                                name: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(FieldSnafu {
                                name: "Maximum-number-operations-performed",
                            })
                    })
                    .context(ChunkSnafu {
                        name: "Asynchronous Operations Window Sub-Item",
                    })?;
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    writer
                        .write_u8(0x54)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        write_sized_uid(
                            writer,
                            &role_selection.sop_class_uid,
                            codec,
                            "SOP-class-uid",
                        )?;
                        writer
                            .write_u8(role_selection.scu_role.into())
                            .context(FieldSnafu { name: "SCU-role" })?;
                        writer
                            .write_u8(role_selection.scp_role.into())
                            .context(FieldSnafu { name: "SCP-role" })
                    })
                    .context(ChunkSnafu {
                        name: "Role Selection Sub-Item",
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    writer
                        .write_u8(0x56)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        write_sized_uid(writer, sop_class_uid, codec, "SOP-class-uid")?;
                        writer.write_all(data).context(FieldSnafu {
                            name: "Service-class-application-information",
                        })
                    })
                    .context(ChunkSnafu {
                        name: "SOP Class Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(common) => {
                    writer
                        .write_u8(0x57)
                        .context(FieldSnafu { name: "Item-type" })?;
                    // 2 - Sub-item-version
                    writer
                        .write_u8(0x00)
                        .context(FieldSnafu {
                            name: "Sub-item-version",
                        })?;

                    write_sized_u16(writer, |writer| {
                        write_sized_uid(writer, &common.sop_class_uid, codec, "SOP-class-uid")?;
                        write_sized_uid(
                            writer,
                            &common.service_class_uid,
                            codec,
                            "Service-class-uid",
                        )?;
                        write_sized_u16(writer, |writer| {
                            for related in &common.related_general_sop_classes {
                                write_sized_uid(
                                    writer,
                                    related,
                                    codec,
                                    "Related-general-sop-class-uid",
                                )?;
                            }
                            Ok(())
                        })
                        .context(ChunkSnafu {
                            name: "Related General SOP Class Identification",
                        })?;
                        Ok(())
                    })
                    .context(ChunkSnafu {
                        name: "SOP Class Common Extended Negotiation Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    writer
                        .write_u8(0x58)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        writer
                            .write_u8(user_identity.identity_type().to_u8())
                            .context(FieldSnafu {
                                name: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested().into())
                            .context(FieldSnafu {
                                name: "User-Identity-positive-response-requested",
                            })?;
                        write_sized_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(FieldSnafu {
                                    name: "User-Identity-primary-field",
                                })
                        })
                        .context(ChunkSnafu {
                            name: "User Identity primary field",
                        })?;
                        write_sized_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(FieldSnafu {
                                    name: "User-Identity-secondary-field",
                                })
                        })
                        .context(ChunkSnafu {
                            name: "User Identity secondary field",
                        })?;
                        Ok(())
                    })
                    .context(ChunkSnafu {
                        name: "User Identity Sub-Item",
                    })?;
                }
                UserVariableItem::UserIdentityResponseItem(server_response) => {
                    writer
                        .write_u8(0x59)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        write_sized_u16(writer, |writer| {
                            writer.write_all(server_response).context(FieldSnafu {
                                name: "User-Identity-server-response",
                            })
                        })
                        .context(ChunkSnafu {
                            name: "User Identity server response",
                        })
                    })
                    .context(ChunkSnafu {
                        name: "User Identity Response Sub-Item",
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(FieldSnafu { name: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(ReservedSnafu { count: 1_u32 })?;

                    write_sized_u16(writer, |writer| {
                        writer.write_all(data).context(FieldSnafu {
                            name: "Unknown Data",
                        })
                    })
                    .context(ChunkSnafu { name: "Unknown" })?;
                }
            }
        }

        Ok(())
    })
    .context(ChunkSnafu { name: "User-data" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_chunks_carry_their_own_length() -> Result<()> {
        let mut out = vec![0u8; 0];
        write_sized_u32(&mut out, |w| {
            w.write_u8(0xAA).context(FieldSnafu { name: "outer" })?;
            write_sized_u16(w, |w| {
                w.write_all(&[0xBB, 0xCC])
                    .context(FieldSnafu { name: "inner" })
            })
            .context(ChunkSnafu { name: "inner chunk" })
        })
        .context(ChunkSnafu { name: "outer chunk" })?;

        // 1 payload byte, then a 2-byte length prefix and 2 more bytes
        assert_eq!(out, &[0, 0, 0, 5, 0xAA, 0, 2, 0xBB, 0xCC]);
        Ok(())
    }

    #[test]
    fn ae_titles_are_space_padded_to_16_bytes() -> Result<()> {
        let codec = dicom_encoding::text::DefaultCharacterSetCodec;
        let mut out = vec![0u8; 0];
        write_ae_title(&mut out, "MAIN-SCP", &codec, "Called-AE-title")?;
        assert_eq!(out, b"MAIN-SCP        ");
        Ok(())
    }
}
