//! Decoding of protocol data units from a byte source.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("max PDU length {} out of supported range", max_pdu_length))]
    MaxPduOutOfRange {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU of {} bytes exceeds the admitted maximum of {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU body"))]
    Body {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read variable item"))]
    Item {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{}`", name))]
    Field {
        name: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not skip {} reserved bytes", count))]
    SkipReserved {
        count: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not decode text field `{}`", name))]
    Text {
        name: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("presentation data item too short ({} bytes)", length))]
    ShortPdvItem { length: u32 },

    #[snafu(display("item not admissible in this PDU: {:?}", item))]
    UnexpectedItem {
        item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context reply carries more than one transfer syntax"))]
    AmbiguousTransferSyntax { backtrace: Backtrace },

    #[snafu(display("illegal rejection source/reason combination"))]
    BadRejectCode { backtrace: Backtrace },

    #[snafu(display("illegal abort source/reason combination"))]
    BadAbortCode { backtrace: Backtrace },

    #[snafu(display("illegal presentation context result/reason code"))]
    BadContextResult { backtrace: Backtrace },

    #[snafu(display("malformed transfer syntax sub-item"))]
    BadTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("unrecognized presentation context sub-item"))]
    BadPresentationContextSubItem { backtrace: Backtrace },

    #[snafu(display("no application context name in association PDU"))]
    NoApplicationContext { backtrace: Backtrace },

    #[snafu(display("no abstract syntax in presentation context item"))]
    NoAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("no transfer syntax in presentation context item"))]
    NoTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from the given source.
///
/// The reader is incremental:
/// `Ok(None)` means that the source does not yet hold a complete PDU,
/// in which case the caller should gather more bytes
/// and retry from the same position.
/// Bytes are only meaningfully consumed when a PDU is returned.
///
/// In strict mode, a PDU larger than `max_pdu_length` is an error;
/// otherwise a warning is logged
/// and the PDU is admitted up to the absolute maximum
/// ([`MAXIMUM_PDU_SIZE`]).
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        MaxPduOutOfRangeSnafu { max_pdu_length }
    );

    // PDU header: 1 - PDU-type, 2 - reserved, 3-6 - PDU-length
    let mut head = [0u8; 6];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context(FieldSnafu { name: "PDU-header" }),
    }
    let pdu_type = head[0];
    let pdu_length = u32::from_be_bytes([head[2], head[3], head[4], head[5]]);

    if pdu_length > max_pdu_length {
        if strict {
            return PduTooLargeSnafu {
                pdu_length,
                max_pdu_length,
            }
            .fail();
        }
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "admitting PDU of {} bytes over the declared maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    let body = take(reader, pdu_length as usize).context(BodySnafu)?;
    if body.len() < pdu_length as usize {
        // the PDU body is not fully buffered yet
        return Ok(None);
    }
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    let pdu = match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ and A-ASSOCIATE-AC share the fixed part of
            // their layout (PS3.8 §9.3.2 / §9.3.3) and differ in which
            // presentation context items they admit.

            // 7-8 - Protocol-version (bit 0 identifies version 1)
            let protocol_version = cursor.read_u16::<BigEndian>().context(FieldSnafu {
                name: "Protocol-version",
            })?;

            // 9-10 - Reserved
            skip_reserved(&mut cursor, 2)?;

            // 11-26 - Called-AE-title, 27-42 - Calling-AE-title:
            // 16 characters each from the ISO 646:1990 basic G0 set,
            // leading and trailing spaces being non-significant
            let called_ae_title = take_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = take_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            // 43-74 - Reserved
            skip_reserved(&mut cursor, 32)?;

            // 75-xxx - variable items: one application context item,
            // one or more presentation context items,
            // and one user information item
            let mut application_context_name: Option<String> = None;
            let mut proposed_contexts = vec![];
            let mut context_replies = vec![];
            let mut user_variables = vec![];

            while remaining(&cursor) > 0 {
                match read_variable_item(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(name) => {
                        application_context_name = Some(name);
                    }
                    PduVariableItem::PresentationContextProposed(pc) if pdu_type == 0x01 => {
                        proposed_contexts.push(pc);
                    }
                    PduVariableItem::PresentationContextResult(pc) if pdu_type == 0x02 => {
                        context_replies.push(pc);
                    }
                    PduVariableItem::UserVariables(vars) => {
                        user_variables = vars;
                    }
                    item => return UnexpectedItemSnafu { item }.fail(),
                }
            }

            let application_context_name =
                application_context_name.context(NoApplicationContextSnafu)?;

            if pdu_type == 0x01 {
                Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    application_context_name,
                    called_ae_title,
                    calling_ae_title,
                    presentation_contexts: proposed_contexts,
                    user_variables,
                })
            } else {
                Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    application_context_name,
                    called_ae_title,
                    calling_ae_title,
                    presentation_contexts: context_replies,
                    user_variables,
                })
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ (PS3.8 §9.3.4):
            // 7 - Reserved, 8 - Result, 9 - Source, 10 - Reason/Diag.,
            // where the legal reason codes depend on the source value
            skip_reserved(&mut cursor, 1)?;
            let result_byte = cursor
                .read_u8()
                .context(FieldSnafu { name: "Result" })?;
            let source_byte = cursor
                .read_u8()
                .context(FieldSnafu { name: "Source" })?;
            let reason_byte = cursor.read_u8().context(FieldSnafu {
                name: "Reason/Diag.",
            })?;

            let result = AssociationRJResult::from(result_byte).context(BadRejectCodeSnafu)?;
            let source =
                AssociationRJSource::from(source_byte, reason_byte).context(BadRejectCodeSnafu)?;

            Pdu::AssociationRJ(AssociationRJ { result, source })
        }
        0x04 => {
            // P-DATA-TF (PS3.8 §9.3.5): a sequence of presentation data items
            let mut data = vec![];
            while remaining(&cursor) > 0 {
                // 1-4 - Item-length
                let item_length = cursor.read_u32::<BigEndian>().context(FieldSnafu {
                    name: "Item-length",
                })?;
                ensure!(
                    item_length >= 2,
                    ShortPdvItemSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID,
                // 6 - message control header:
                // bit 0 set for command information,
                // bit 1 set for the last fragment
                let presentation_context_id = cursor.read_u8().context(FieldSnafu {
                    name: "Presentation-context-ID",
                })?;
                let control = cursor.read_u8().context(FieldSnafu {
                    name: "Message-control-header",
                })?;

                let value = take(&mut cursor, (item_length - 2) as usize).context(FieldSnafu {
                    name: "Presentation-data-value",
                })?;

                data.push(PDataValue {
                    presentation_context_id,
                    value_type: if control & 0x01 != 0 {
                        PDataValueType::Command
                    } else {
                        PDataValueType::Data
                    },
                    is_last: control & 0x02 != 0,
                    data: value,
                });
            }

            Pdu::PData { data }
        }
        // A-RELEASE-RQ and A-RELEASE-RP carry 4 reserved bytes
        // and nothing to interpret
        0x05 => Pdu::ReleaseRQ,
        0x06 => Pdu::ReleaseRP,
        0x07 => {
            // A-ABORT (PS3.8 §9.3.8): 7-8 - Reserved,
            // 9 - Source (0 service-user, 2 service-provider),
            // 10 - Reason/Diag., significant only for the provider
            skip_reserved(&mut cursor, 2)?;
            let source_byte = cursor
                .read_u8()
                .context(FieldSnafu { name: "Source" })?;
            let reason_byte = cursor.read_u8().context(FieldSnafu {
                name: "Reason/Diag.",
            })?;
            let source =
                AbortRQSource::from(source_byte, reason_byte).context(BadAbortCodeSnafu)?;

            Pdu::AbortRQ { source }
        }
        _ => Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        },
    };

    Ok(Some(pdu))
}

fn take<R>(reader: &mut R, n: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut buf = Vec::new();
    reader.take(n as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn skip_reserved<R>(reader: &mut R, count: usize) -> Result<()>
where
    R: Read,
{
    let mut buf = [0u8; 32];
    reader
        .read_exact(&mut buf[..count])
        .context(SkipReservedSnafu {
            count: count as u32,
        })
}

fn take_ae_title<R>(reader: &mut R, codec: &dyn TextCodec, name: &'static str) -> Result<String>
where
    R: Read,
{
    let mut raw = [0u8; 16];
    reader.read_exact(&mut raw).context(FieldSnafu { name })?;
    let text = codec.decode(&raw).context(TextSnafu { name })?;
    Ok(text.trim().to_string())
}

fn take_uid<R>(
    reader: &mut R,
    len: usize,
    codec: &dyn TextCodec,
    name: &'static str,
) -> Result<String>
where
    R: Read,
{
    let raw = take(reader, len).context(FieldSnafu { name })?;
    let text = codec.decode(&raw).context(TextSnafu { name })?;
    Ok(text.trim_start().trim_end_matches(['\0', ' ']).to_string())
}

fn remaining(cursor: &Cursor<Vec<u8>>) -> u64 {
    cursor.get_ref().len() as u64 - cursor.position()
}

/// Read the `Item-type`, reserved and `Item-length` fields
/// common to every variable item and sub-item.
fn item_header<R>(reader: &mut R) -> Result<(u8, u16)>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(FieldSnafu { name: "Item-type" })?;
    skip_reserved(reader, 1)?;
    let item_length = reader.read_u16::<BigEndian>().context(FieldSnafu {
        name: "Item-length",
    })?;
    Ok((item_type, item_length))
}

fn read_variable_item<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, item_length) = item_header(reader)?;
    let body = take(reader, item_length as usize).context(ItemSnafu)?;
    let mut cursor = Cursor::new(body);

    match item_type {
        0x10 => {
            // Application Context item:
            // the payload is the context name itself
            let name = codec.decode(cursor.get_ref()).context(TextSnafu {
                name: "Application-context-name",
            })?;
            Ok(PduVariableItem::ApplicationContext(name.trim().to_string()))
        }
        0x20 => {
            // Presentation Context item (proposed):
            // 5 - Presentation-context-ID, 6-8 - Reserved,
            // then one abstract syntax sub-item
            // followed by one or more transfer syntax sub-items
            let id = cursor.read_u8().context(FieldSnafu {
                name: "Presentation-context-ID",
            })?;
            skip_reserved(&mut cursor, 3)?;

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];
            while remaining(&cursor) > 0 {
                let (sub_type, sub_length) = item_header(&mut cursor)?;
                match sub_type {
                    0x30 => {
                        abstract_syntax = Some(take_uid(
                            &mut cursor,
                            sub_length as usize,
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(take_uid(
                            &mut cursor,
                            sub_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => return BadPresentationContextSubItemSnafu.fail(),
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id,
                    abstract_syntax: abstract_syntax.context(NoAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (reply):
            // 5 - Presentation-context-ID, 6 - Reserved,
            // 7 - Result/Reason, 8 - Reserved,
            // then exactly one transfer syntax sub-item,
            // not significant unless the context was accepted
            let id = cursor.read_u8().context(FieldSnafu {
                name: "Presentation-context-ID",
            })?;
            skip_reserved(&mut cursor, 1)?;
            let reason_byte = cursor.read_u8().context(FieldSnafu {
                name: "Result/Reason",
            })?;
            let reason =
                PresentationContextResultReason::from(reason_byte).context(BadContextResultSnafu)?;
            skip_reserved(&mut cursor, 1)?;

            let mut transfer_syntax: Option<String> = None;
            while remaining(&cursor) > 0 {
                let (sub_type, sub_length) = item_header(&mut cursor)?;
                ensure!(sub_type == 0x40, BadTransferSyntaxSubItemSnafu);
                ensure!(transfer_syntax.is_none(), AmbiguousTransferSyntaxSnafu);
                transfer_syntax = Some(take_uid(
                    &mut cursor,
                    sub_length as usize,
                    codec,
                    "Transfer-syntax-name",
                )?);
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax: transfer_syntax.context(NoTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information item,
            // containing the user data sub-items of PS3.7 Annex D.3;
            // each sub-item body is isolated by its declared length,
            // so reserved trailing bytes are tolerated
            let mut user_variables = vec![];

            while remaining(&cursor) > 0 {
                let (sub_type, sub_length) = item_header(&mut cursor)?;
                let sub_body = take(&mut cursor, sub_length as usize).context(ItemSnafu)?;
                let mut sub = Cursor::new(sub_body);

                match sub_type {
                    0x51 => {
                        // Maximum Length: 5-8 - Maximum-length-received,
                        // the largest P-DATA-TF this node is willing to
                        // receive (0 meaning no maximum is declared)
                        let max = sub.read_u32::<BigEndian>().context(FieldSnafu {
                            name: "Maximum-length-received",
                        })?;
                        user_variables.push(UserVariableItem::MaxLength(max));
                    }
                    0x52 => {
                        let uid = take_uid(
                            &mut sub,
                            sub_length as usize,
                            codec,
                            "Implementation-class-uid",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(uid));
                    }
                    0x53 => {
                        // Asynchronous Operations Window:
                        // 5-6 - Maximum-number-operations-invoked,
                        // 7-8 - Maximum-number-operations-performed
                        let invoked = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "Maximum-number-operations-invoked",
                        })?;
                        let performed = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "Maximum-number-operations-performed",
                        })?;
                        user_variables
                            .push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
                    }
                    0x54 => {
                        // SCP/SCU Role Selection: 5-6 - UID-length,
                        // 7-xxx - SOP-class-uid,
                        // then one byte each for the SCU and SCP roles
                        let uid_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "SOP-class-uid-length",
                        })?;
                        let sop_class_uid =
                            take_uid(&mut sub, uid_length as usize, codec, "SOP-class-uid")?;
                        let scu_role = sub
                            .read_u8()
                            .context(FieldSnafu { name: "SCU-role" })?;
                        let scp_role = sub
                            .read_u8()
                            .context(FieldSnafu { name: "SCP-role" })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role == 1,
                            scp_role: scp_role == 1,
                        }));
                    }
                    0x55 => {
                        let raw = sub.into_inner();
                        let name = codec.decode(&raw).context(TextSnafu {
                            name: "Implementation-version-name",
                        })?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            name.trim().to_string(),
                        ));
                    }
                    0x56 => {
                        // SOP Class Extended Negotiation:
                        // 5-6 - SOP-class-uid-length, 7-xxx - SOP-class-uid,
                        // then the service class application information,
                        // opaque at this level
                        let uid_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "SOP-class-uid-length",
                        })?;
                        let sop_class_uid =
                            take_uid(&mut sub, uid_length as usize, codec, "SOP-class-uid")?;
                        let info_len = remaining(&sub) as usize;
                        let info = take(&mut sub, info_len).context(FieldSnafu {
                            name: "Service-class-application-information",
                        })?;
                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            info,
                        ));
                    }
                    0x57 => {
                        // SOP Class Common Extended Negotiation:
                        // SOP class UID, service class UID,
                        // then the related general SOP class identification,
                        // each introduced by a 2-byte length
                        let uid_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "SOP-class-uid-length",
                        })?;
                        let sop_class_uid =
                            take_uid(&mut sub, uid_length as usize, codec, "SOP-class-uid")?;

                        let service_uid_length =
                            sub.read_u16::<BigEndian>().context(FieldSnafu {
                                name: "Service-class-uid-length",
                            })?;
                        let service_class_uid = take_uid(
                            &mut sub,
                            service_uid_length as usize,
                            codec,
                            "Service-class-uid",
                        )?;

                        let related_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "Related-general-sop-class-identification-length",
                        })?;
                        let related = take(&mut sub, related_length as usize).context(FieldSnafu {
                            name: "Related-general-sop-class-identification",
                        })?;
                        let mut related = Cursor::new(related);
                        let mut related_general_sop_classes = vec![];
                        while remaining(&related) > 2 {
                            let len = related.read_u16::<BigEndian>().context(FieldSnafu {
                                name: "Related-general-sop-class-uid-length",
                            })?;
                            related_general_sop_classes.push(take_uid(
                                &mut related,
                                len as usize,
                                codec,
                                "Related-general-sop-class-uid",
                            )?);
                        }

                        user_variables.push(
                            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                                CommonExtendedNegotiation {
                                    sop_class_uid,
                                    service_class_uid,
                                    related_general_sop_classes,
                                },
                            ),
                        );
                    }
                    0x58 => {
                        // User Identity sub-item: 5 - User-Identity-type,
                        // 6 - Positive-response-requested,
                        // then the primary and secondary fields,
                        // each with a 2-byte length prefix
                        // (the secondary field is only non-empty
                        // for the username and passcode identity type)
                        let type_byte = sub.read_u8().context(FieldSnafu {
                            name: "User-Identity-type",
                        })?;
                        let positive_response = sub.read_u8().context(FieldSnafu {
                            name: "User-Identity-positive-response-requested",
                        })?;
                        let primary_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "User-Identity-primary-field-length",
                        })?;
                        let primary_field =
                            take(&mut sub, primary_length as usize).context(FieldSnafu {
                                name: "User-Identity-primary-field",
                            })?;
                        let secondary_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "User-Identity-secondary-field-length",
                        })?;
                        let secondary_field =
                            take(&mut sub, secondary_length as usize).context(FieldSnafu {
                                name: "User-Identity-secondary-field",
                            })?;

                        if let Some(identity_type) = UserIdentityType::from(type_byte) {
                            user_variables.push(UserVariableItem::UserIdentityItem(
                                UserIdentity::new(
                                    positive_response == 1,
                                    identity_type,
                                    primary_field,
                                    secondary_field,
                                ),
                            ));
                        } else {
                            warn!("unknown user identity type code {}", type_byte);
                        }
                    }
                    0x59 => {
                        // User Identity server response sub-item:
                        // 5-6 - Server-response-length, 7-n - Server-response
                        let response_length = sub.read_u16::<BigEndian>().context(FieldSnafu {
                            name: "User-Identity-server-response-length",
                        })?;
                        let server_response =
                            take(&mut sub, response_length as usize).context(FieldSnafu {
                                name: "User-Identity-server-response",
                            })?;
                        user_variables
                            .push(UserVariableItem::UserIdentityResponseItem(server_response));
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(sub_type, sub.into_inner()));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
