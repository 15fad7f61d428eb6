use radlink_ul::pdu::reader::read_pdu;
use radlink_ul::pdu::writer::write_pdu;
use radlink_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, CommonExtendedNegotiation,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use std::io::Cursor;

fn round_trip(pdu: &Pdu) -> Pdu {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, pdu).unwrap();
    read_pdu(&mut Cursor::new(&bytes), MAXIMUM_PDU_SIZE, true)
        .unwrap()
        .unwrap()
}

#[test]
fn can_read_write_associate_rq() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("RADLINK01".to_string()),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.1.4".to_string(),
                vec![1, 1, 0, 1, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let same = round_trip(&association_rq.clone().into());
    assert_eq!(same, Pdu::AssociationRQ(association_rq));
}

#[test]
fn can_read_write_role_selection_and_async_window() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "COMMIT-SCU".to_string(),
        called_ae_title: "COMMIT-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.20.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(32768),
            UserVariableItem::AsyncOperationsWindow(5, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.1.20.1".to_string(),
                scu_role: true,
                scp_role: true,
            }),
        ],
    };

    let same = round_trip(&association_rq.clone().into());
    assert_eq!(same, Pdu::AssociationRQ(association_rq));
}

#[test]
fn can_read_write_common_extended_negotiation() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
            CommonExtendedNegotiation {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                service_class_uid: "1.2.840.10008.4.2".to_string(),
                related_general_sop_classes: vec!["1.2.840.10008.5.1.4.1.1.88.11".to_string()],
            },
        )],
    };

    let same = round_trip(&association_rq.clone().into());
    assert_eq!(same, Pdu::AssociationRQ(association_rq));
}

#[test]
fn can_read_write_associate_ac_with_user_identity_response() {
    let association_ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(65536),
            UserVariableItem::UserIdentityResponseItem(b"ticket-granted".to_vec()),
        ],
    };

    let same = round_trip(&association_ac.clone().into());
    assert_eq!(same, Pdu::AssociationAC(association_ac));
}

#[test]
fn can_read_write_associate_rj() {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    };
    let same = round_trip(&association_rj.clone().into());
    assert_eq!(same, Pdu::AssociationRJ(association_rj));
}

#[rstest::rstest]
// source = 2 (ACSE) only admits reasons 1-2,
// source = 1 (service user) only 1-10,
// and source = 4 does not exist
#[case([0x02, 0x03])]
#[case([0x01, 0x0B])]
#[case([0x04, 0x01])]
fn rejects_invalid_reject_reason_for_source(#[case] source_and_reason: [u8; 2]) {
    let bytes = [
        0x03,
        0x00,
        0x00,
        0x00,
        0x00,
        0x04,
        0x00,
        0x01,
        source_and_reason[0],
        source_and_reason[1],
    ];
    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(err.to_string().contains("reject"));
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(round_trip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(&abort), abort);
}

#[test]
fn can_read_write_pdata_with_multiple_values() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x10; 74],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x42; 1024],
            },
        ],
    };
    assert_eq!(round_trip(&pdu), pdu);
}

#[test]
fn incomplete_input_yields_none() {
    let pdu = Pdu::ReleaseRQ;
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    for cut in 0..bytes.len() {
        let out = read_pdu(&mut Cursor::new(&bytes[..cut]), DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(out, None, "truncation at {} bytes", cut);
    }
}

#[test]
fn lenient_mode_admits_oversized_pdus() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0x77; (DEFAULT_MAX_PDU + 100) as usize],
        }],
    };
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    // strict mode refuses the PDU
    assert!(read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).is_err());
    // lenient mode admits it with a warning
    let out = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, false)
        .unwrap()
        .unwrap();
    assert_eq!(out, pdu);
}

#[test]
fn unknown_user_sub_items_are_preserved() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::Unknown(0x7F, vec![0xDE, 0xAD])],
    };

    let same = round_trip(&association_rq.clone().into());
    assert_eq!(same, Pdu::AssociationRQ(association_rq));
}
