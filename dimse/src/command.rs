//! DIMSE command sets.
//!
//! Every DIMSE message carries a command set:
//! a small data set of group `0000` elements
//! always encoded in Implicit VR Little Endian (PS3.7 §6.3.1).
//! Rather than one type per operation,
//! this module models all commands as a single [`CommandSet`]
//! discriminated by its [`CommandField`];
//! the per-operation constructors and accessors
//! are thin projections over the underlying elements.
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, ReadError, WriteError};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("command set is missing field `{}`", name))]
    MissingField { name: &'static str },

    #[snafu(display("could not interpret command field `{}`", name))]
    InvalidField {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unknown command field value {:#06x}", value))]
    UnknownCommandField { value: u16 },

    /// could not decode command set
    DecodeCommand { source: ReadError },

    /// could not encode command set
    EncodeCommand { source: WriteError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The command field values of the DIMSE-C and DIMSE-N operations
/// (PS3.7 Table E.1-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn from_u16(value: u16) -> Option<Self> {
        let field = match value {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    /// Whether this command is a request primitive
    /// (bit 15 of the command field is clear).
    pub fn is_request(self) -> bool {
        (self as u16) & 0x8000 == 0
    }

    pub fn is_response(self) -> bool {
        !self.is_request()
    }
}

/// The priority of a DIMSE-C operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low = 0x0002,
    #[default]
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// The broad outcome class of a DIMSE status code (PS3.7 Annex C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusState {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

/// A DIMSE status code with its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const MOVE_DESTINATION_UNKNOWN: Status = Status(0xA801);

    pub fn state(self) -> StatusState {
        match self.0 {
            0x0000 => StatusState::Success,
            0xFF00 | 0xFF01 => StatusState::Pending,
            0xFE00 => StatusState::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusState::Warning,
            code if code & 0xF000 == 0xB000 => StatusState::Warning,
            _ => StatusState::Failure,
        }
    }

    /// Whether more responses are to follow for the same request.
    pub fn is_pending(self) -> bool {
        self.state() == StatusState::Pending
    }

    /// Whether this status concludes the operation it responds to.
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        Status(value)
    }
}

/// Data Set Type value indicating that no data set is present (PS3.7 §9.3).
const DATA_SET_ABSENT: u16 = 0x0101;
/// Conventional Data Set Type value for a present data set.
const DATA_SET_PRESENT: u16 = 0x0001;

/// A DIMSE command set:
/// a group `0000` data set with typed accessors over its elements.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    /// Wrap an existing command data set.
    pub fn from_object(obj: InMemDicomObject) -> Self {
        CommandSet { obj }
    }

    /// Decode a command set from its Implicit VR Little Endian encoding.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            data,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(DecodeCommandSnafu)?;
        Ok(CommandSet { obj })
    }

    /// Encode the command set in Implicit VR Little Endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(128);
        self.obj
            .write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(EncodeCommandSnafu)?;
        Ok(data)
    }

    /// Access the underlying data set.
    pub fn inner(&self) -> &InMemDicomObject {
        &self.obj
    }

    fn u16_field(&self, tag: dicom_core::Tag, name: &'static str) -> Result<u16> {
        self.obj
            .element(tag)
            .ok()
            .context(MissingFieldSnafu { name })?
            .to_int::<u16>()
            .context(InvalidFieldSnafu { name })
    }

    fn u16_field_opt(&self, tag: dicom_core::Tag) -> Option<u16> {
        self.obj
            .element(tag)
            .ok()
            .and_then(|el| el.to_int::<u16>().ok())
    }

    fn str_field_opt(&self, tag: dicom_core::Tag) -> Option<String> {
        self.obj.element(tag).ok().and_then(|el| {
            el.to_str()
                .ok()
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        })
    }

    pub fn command_field(&self) -> Result<CommandField> {
        let value = self.u16_field(tags::COMMAND_FIELD, "Command Field")?;
        CommandField::from_u16(value).context(UnknownCommandFieldSnafu { value })
    }

    /// The message ID of a request primitive.
    pub fn message_id(&self) -> Result<u16> {
        self.u16_field(tags::MESSAGE_ID, "Message ID")
    }

    /// The message ID a response primitive is answering.
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.u16_field(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// Replace the message ID of this (request) command set.
    pub fn set_message_id(&mut self, message_id: u16) {
        self.obj.put(DataElement::new(
            tags::MESSAGE_ID,
            VR::US,
            dicom_value!(U16, [message_id]),
        ));
    }

    /// Whether the command is to be followed by a data set.
    pub fn has_dataset(&self) -> bool {
        self.u16_field_opt(tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != DATA_SET_ABSENT)
            .unwrap_or(false)
    }

    /// Declare whether a data set follows this command.
    pub fn set_has_dataset(&mut self, has_dataset: bool) {
        let value = if has_dataset {
            DATA_SET_PRESENT
        } else {
            DATA_SET_ABSENT
        };
        self.obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [value]),
        ));
    }

    pub fn status(&self) -> Option<Status> {
        self.u16_field_opt(tags::STATUS).map(Status)
    }

    pub fn priority(&self) -> Option<Priority> {
        self.u16_field_opt(tags::PRIORITY).and_then(Priority::from_u16)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.str_field_opt(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.str_field_opt(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.str_field_opt(tags::REQUESTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.str_field_opt(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.str_field_opt(tags::MOVE_DESTINATION)
    }

    pub fn event_type_id(&self) -> Option<u16> {
        self.u16_field_opt(tags::EVENT_TYPE_ID)
    }

    pub fn action_type_id(&self) -> Option<u16> {
        self.u16_field_opt(tags::ACTION_TYPE_ID)
    }

    pub fn number_of_remaining_suboperations(&self) -> Option<u16> {
        self.u16_field_opt(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
    }

    /// The abstract syntax this command is exchanged under,
    /// taken from the affected or requested SOP class UID.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    // ---- request constructors ----

    /// C-ECHO-RQ (PS3.7 §9.3.5.1).
    pub fn c_echo_rq(message_id: u16) -> Self {
        const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, VERIFICATION_SOP_CLASS),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::CEchoRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_ABSENT]),
                ),
            ]),
        }
    }

    /// C-STORE-RQ (PS3.7 §9.3.1.1).
    pub fn c_store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
    ) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, sop_class_uid),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::CStoreRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::PRIORITY,
                    VR::US,
                    dicom_value!(U16, [priority as u16]),
                ),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_PRESENT]),
                ),
                DataElement::new(
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, sop_instance_uid),
                ),
            ]),
        }
    }

    /// C-FIND-RQ (PS3.7 §9.3.2.1).
    pub fn c_find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, sop_class_uid),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::CFindRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::PRIORITY,
                    VR::US,
                    dicom_value!(U16, [priority as u16]),
                ),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_PRESENT]),
                ),
            ]),
        }
    }

    /// C-GET-RQ (PS3.7 §9.3.3.1).
    pub fn c_get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        let mut cmd = Self::c_find_rq(message_id, sop_class_uid, priority);
        cmd.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CGetRq as u16]),
        ));
        cmd
    }

    /// C-MOVE-RQ (PS3.7 §9.3.4.1).
    pub fn c_move_rq(
        message_id: u16,
        sop_class_uid: &str,
        move_destination: &str,
        priority: Priority,
    ) -> Self {
        let mut cmd = Self::c_find_rq(message_id, sop_class_uid, priority);
        cmd.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CMoveRq as u16]),
        ));
        cmd.obj.put(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, move_destination),
        ));
        cmd
    }

    /// C-CANCEL-RQ (PS3.7 §9.3.2.3).
    pub fn c_cancel_rq(message_id_being_responded_to: u16) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::CCancelRq as u16]),
                ),
                DataElement::new(
                    tags::MESSAGE_ID_BEING_RESPONDED_TO,
                    VR::US,
                    dicom_value!(U16, [message_id_being_responded_to]),
                ),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_ABSENT]),
                ),
            ]),
        }
    }

    /// N-EVENT-REPORT-RQ (PS3.7 §10.3.1.1).
    pub fn n_event_report_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        event_type_id: u16,
    ) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, sop_class_uid),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::NEventReportRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_ABSENT]),
                ),
                DataElement::new(
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, sop_instance_uid),
                ),
                DataElement::new(
                    tags::EVENT_TYPE_ID,
                    VR::US,
                    dicom_value!(U16, [event_type_id]),
                ),
            ]),
        }
    }

    /// N-GET-RQ (PS3.7 §10.3.2.1).
    pub fn n_get_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::REQUESTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, sop_class_uid),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::NGetRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_ABSENT]),
                ),
                DataElement::new(
                    tags::REQUESTED_SOP_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, sop_instance_uid),
                ),
            ]),
        }
    }

    /// N-SET-RQ (PS3.7 §10.3.3.1).
    pub fn n_set_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut cmd = Self::n_get_rq(message_id, sop_class_uid, sop_instance_uid);
        cmd.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::NSetRq as u16]),
        ));
        cmd.set_has_dataset(true);
        cmd
    }

    /// N-ACTION-RQ (PS3.7 §10.3.4.1).
    pub fn n_action_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        action_type_id: u16,
    ) -> Self {
        let mut cmd = Self::n_get_rq(message_id, sop_class_uid, sop_instance_uid);
        cmd.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::NActionRq as u16]),
        ));
        cmd.obj.put(DataElement::new(
            tags::ACTION_TYPE_ID,
            VR::US,
            dicom_value!(U16, [action_type_id]),
        ));
        cmd
    }

    /// N-CREATE-RQ (PS3.7 §10.3.5.1).
    pub fn n_create_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        CommandSet {
            obj: InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, sop_class_uid),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [CommandField::NCreateRq as u16]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_ABSENT]),
                ),
                DataElement::new(
                    tags::AFFECTED_SOP_INSTANCE_UID,
                    VR::UI,
                    dicom_value!(Str, sop_instance_uid),
                ),
            ]),
        }
    }

    /// N-DELETE-RQ (PS3.7 §10.3.6.1).
    pub fn n_delete_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        let mut cmd = Self::n_get_rq(message_id, sop_class_uid, sop_instance_uid);
        cmd.obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::NDeleteRq as u16]),
        ));
        cmd
    }

    // ---- response constructors ----

    /// Build the response command set answering the given request,
    /// with the response variant of the request's command field.
    pub fn response_to(request: &CommandSet, status: Status) -> Result<Self> {
        let request_field = request.command_field()? as u16;
        let response_field = request_field | 0x8000;
        let message_id = request.message_id()?;

        let mut elements = vec![
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                dicom_value!(U16, [response_field]),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status.0])),
        ];
        if let Some(uid) = request.sop_class_uid() {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }
        if let Some(uid) = request
            .affected_sop_instance_uid()
            .or_else(|| request.requested_sop_instance_uid())
        {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid),
            ));
        }

        Ok(CommandSet {
            obj: InMemDicomObject::command_from_element_iter(elements),
        })
    }

    /// Attach sub-operation progress counts
    /// to a C-GET or C-MOVE response (PS3.7 §9.3.3.2).
    pub fn with_sub_operations(
        mut self,
        remaining: u16,
        completed: u16,
        failed: u16,
        warning: u16,
    ) -> Self {
        self.obj.put(DataElement::new(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ));
        self.obj.put(DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ));
        self.obj.put(DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [failed]),
        ));
        self.obj.put(DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [warning]),
        ));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_codes() {
        assert_eq!(CommandField::from_u16(0x0030), Some(CommandField::CEchoRq));
        assert_eq!(CommandField::from_u16(0x8021), Some(CommandField::CMoveRsp));
        assert_eq!(CommandField::from_u16(0x4242), None);

        assert!(CommandField::CFindRq.is_request());
        assert!(CommandField::CCancelRq.is_request());
        assert!(CommandField::NEventReportRsp.is_response());
    }

    #[test]
    fn status_classification() {
        assert_eq!(Status::SUCCESS.state(), StatusState::Success);
        assert_eq!(Status(0xFF00).state(), StatusState::Pending);
        assert_eq!(Status(0xFF01).state(), StatusState::Pending);
        assert_eq!(Status(0xFE00).state(), StatusState::Cancel);
        assert_eq!(Status(0xB000).state(), StatusState::Warning);
        assert_eq!(Status(0xA801).state(), StatusState::Failure);
        assert_eq!(Status(0xC001).state(), StatusState::Failure);
        assert_eq!(Status(0x0122).state(), StatusState::Failure);

        assert!(Status::PENDING.is_pending());
        assert!(Status::SUCCESS.is_terminal());
        assert!(Status::CANCEL.is_terminal());
    }

    #[test]
    fn echo_command_round_trip() {
        let cmd = CommandSet::c_echo_rq(7);
        let bytes = cmd.encode().unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();

        assert_eq!(decoded.command_field().unwrap(), CommandField::CEchoRq);
        assert_eq!(decoded.message_id().unwrap(), 7);
        assert!(!decoded.has_dataset());
        assert_eq!(
            decoded.affected_sop_class_uid().as_deref(),
            Some("1.2.840.10008.1.1")
        );
    }

    #[test]
    fn store_request_declares_dataset() {
        let cmd = CommandSet::c_store_rq(
            42,
            "1.2.840.10008.5.1.4.1.1.4",
            "1.2.3.4.5.6",
            Priority::Medium,
        );
        assert!(cmd.has_dataset());
        assert_eq!(cmd.priority(), Some(Priority::Medium));
        assert_eq!(
            cmd.affected_sop_instance_uid().as_deref(),
            Some("1.2.3.4.5.6")
        );
    }

    #[test]
    fn response_mirrors_request_identity() {
        let request = CommandSet::c_find_rq(11, "1.2.840.10008.5.1.4.1.2.2.1", Priority::High);
        let response = CommandSet::response_to(&request, Status::PENDING).unwrap();

        assert_eq!(response.command_field().unwrap(), CommandField::CFindRsp);
        assert_eq!(response.message_id_being_responded_to().unwrap(), 11);
        assert_eq!(response.status(), Some(Status::PENDING));
        assert_eq!(
            response.affected_sop_class_uid(),
            request.affected_sop_class_uid()
        );
    }

    #[test]
    fn message_id_can_be_replaced() {
        let mut cmd = CommandSet::c_echo_rq(0);
        cmd.set_message_id(99);
        assert_eq!(cmd.message_id().unwrap(), 99);
    }
}
