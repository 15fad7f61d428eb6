//! A full verification exchange at the upper layer level:
//! the requester sends a C-ECHO command set as P-Data
//! and the acceptor answers it with a success status.
use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use radlink_ul::association::client::ClientAssociationOptions;
use radlink_ul::association::server::ServerAssociationOptions;
use radlink_ul::pdu::{PDataValue, PDataValueType, Pdu};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn echo_request(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, VERIFICATION_SOP_CLASS),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
    ])
}

fn echo_response(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}

fn encode_command(obj: &InMemDicomObject) -> Vec<u8> {
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    out
}

fn decode_command(data: &[u8]) -> InMemDicomObject {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap()
}

fn command_pdata(presentation_context_id: u8, obj: &InMemDicomObject) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: encode_command(obj),
        }],
    }
}

fn spawn_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        // one C-ECHO request is expected
        let pdu = association.receive()?;
        let data = match pdu {
            Pdu::PData { data } => data,
            other => panic!("unexpected PDU: {:?}", other),
        };
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].value_type, PDataValueType::Command);
        assert!(data[0].is_last);

        let command = decode_command(&data[0].data);
        let command_field = command.element(tags::COMMAND_FIELD)?.to_int::<u16>()?;
        assert_eq!(command_field, 0x0030);
        let message_id = command.element(tags::MESSAGE_ID)?.to_int::<u16>()?;

        let context_id = data[0].presentation_context_id;
        association.send(&command_pdata(context_id, &echo_response(message_id)))?;

        // then a release
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });
    Ok((h, addr))
}

#[test]
fn echo_exchange_succeeds() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    let context_id = association
        .association()
        .accepted_contexts()
        .next()
        .expect("at least one accepted context")
        .id();

    association
        .send(&command_pdata(context_id, &echo_request(123)))
        .unwrap();

    let pdu = association.receive().unwrap();
    let data = match pdu {
        Pdu::PData { data } => data,
        other => panic!("unexpected PDU: {:?}", other),
    };
    let response = decode_command(&data[0].data);
    assert_eq!(
        response
            .element(tags::COMMAND_FIELD)
            .unwrap()
            .to_int::<u16>()
            .unwrap(),
        0x8030
    );
    assert_eq!(
        response
            .element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
            .unwrap()
            .to_int::<u16>()
            .unwrap(),
        123
    );
    assert_eq!(
        response
            .element(tags::STATUS)
            .unwrap()
            .to_int::<u16>()
            .unwrap(),
        0x0000
    );

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
}
