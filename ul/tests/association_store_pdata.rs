//! Test suite for streaming a C-STORE data set
//! through `send_pdata` and `receive_pdata`.
use std::io::Write as _;
use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use radlink_ul::association::client::ClientAssociationOptions;
use radlink_ul::association::server::ServerAssociationOptions;
use radlink_ul::pdu::{PDataValue, PDataValueType, Pdu};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn to_bytes_implicit_vr_le(obj: &InMemDicomObject) -> Vec<u8> {
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    out
}

fn from_bytes_implicit_vr_le(data: &[u8]) -> InMemDicomObject {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap()
}

fn store_req_command(sop_class_uid: &str, sop_instance_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        // C-STORE-RQ
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn store_rsp_command(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        // C-STORE-RSP
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
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
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Create a store SCP which accepts one C-STORE interaction.
fn spawn_store_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .accept_called_ae_title()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SC_IMAGE_STORAGE);

    let h = std::thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        let context = association
            .association()
            .accepted_contexts()
            .next()
            .expect("the storage context should be accepted");
        assert_eq!(context.id(), 1);
        assert_eq!(context.abstract_syntax(), SC_IMAGE_STORAGE);
        assert_eq!(context.accepted_transfer_syntax(), Some(IMPLICIT_VR_LE));

        // handle a full C-STORE-RQ interaction
        let pdu = association.receive()?;
        let Pdu::PData { data } = pdu else {
            panic!("unexpected PDU type");
        };
        assert!(data[0].is_last);
        let cstore_cmd = from_bytes_implicit_vr_le(&data[0].data);

        let message_id: u16 = cstore_cmd
            .element(tags::MESSAGE_ID)?
            .to_int()?;
        let affected_sop = cstore_cmd
            .element(tags::AFFECTED_SOP_INSTANCE_UID)?
            .to_str()?
            .to_string();

        // accumulate the streamed C-STORE data set
        let mut dcm_data = Vec::new();
        {
            let mut pdata = association.receive_pdata();
            std::io::copy(&mut pdata, &mut dcm_data)?;
        }

        // inspect some attributes to validate that it is the expected object
        let dcm_obj = from_bytes_implicit_vr_le(&dcm_data);
        assert_eq!(
            dcm_obj.element(tags::SOP_INSTANCE_UID)?.to_str()?,
            affected_sop,
        );
        assert_eq!(dcm_obj.element(tags::ROWS)?.to_int::<u16>()?, 300);

        // send a C-STORE-RSP
        let cmd = store_rsp_command(message_id, SC_IMAGE_STORAGE, &affected_sop);
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: to_bytes_implicit_vr_le(&cmd),
            }],
        })?;

        // handle one release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });
    Ok((h, addr))
}

/// Negotiate an association, run a single C-STORE interaction
/// with the data set streamed over multiple PDUs,
/// and release the association.
#[test]
fn store_with_streamed_pdata() {
    let (scp_handle, scp_addr) = spawn_store_scp().unwrap();

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(SC_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    let context_id = association
        .association()
        .accepted_contexts()
        .next()
        .expect("the storage context should be accepted")
        .id();

    let iuid = "2.25.74320942257366560001029850331948705672";

    let cmd_data = to_bytes_implicit_vr_le(&store_req_command(SC_IMAGE_STORAGE, iuid, 1));
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        })
        .unwrap();

    // an RGB image bigger than the negotiated maximum PDU length,
    // forcing the writer to split the stream
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, SC_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, iuid)),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(3_u16)),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "RGB")),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(300_u16)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(400_u16)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(7_u16)),
        DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::U8(vec![0x5C_u8; 400 * 300 * 3].into()),
        ),
    ]);
    let obj_data = to_bytes_implicit_vr_le(&obj);

    {
        let mut pdata = association.send_pdata(context_id);
        pdata.write_all(&obj_data).unwrap();
        pdata.finish().unwrap();
    }

    // expect one C-STORE-RSP
    let pdu = association.receive().unwrap();
    let Pdu::PData { data } = pdu else {
        panic!("unexpected PDU type");
    };
    let pdv = &data[0];
    assert_eq!(pdv.value_type, PDataValueType::Command);
    assert!(pdv.is_last);

    let rsp = from_bytes_implicit_vr_le(&pdv.data);
    assert_eq!(
        rsp.element(tags::AFFECTED_SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap(),
        iuid,
    );
    assert_eq!(
        rsp.element(tags::STATUS).unwrap().to_int::<u16>().unwrap(),
        0x0000,
    );

    association.release().unwrap();

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}
