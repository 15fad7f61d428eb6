//! Protocol Data Unit module
//!
//! This module comprises the data structures representing the protocol data
//! units (PDUs) of the DICOM Upper Layer protocol (PS3.8),
//! as well as readers and writers of PDUs from arbitrary data sources.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size admitted by this implementation
/// when reading in lenient mode
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier,
    /// an odd integer between 1 and 255
    pub id: u8,
    /// the expected abstract syntax UID
    /// (commonly referring to the expected SOP class)
    pub abstract_syntax: String,
    /// a list of transfer syntax UIDs to support in this interaction
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for a negotiated presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier as proposed by the requester
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the transfer syntax UID chosen by the acceptor,
    /// only meaningful when the reason is an acceptance
    pub transfer_syntax: String,
}

/// The result/reason field of a presentation context reply (PS3.8 §9.3.3.2).
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(code: u8) -> Option<PresentationContextResultReason> {
        use PresentationContextResultReason::*;
        match code {
            0 => Some(Acceptance),
            1 => Some(UserRejection),
            2 => Some(NoReason),
            3 => Some(AbstractSyntaxNotSupported),
            4 => Some(TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        })
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    fn from(code: u8) -> Option<AssociationRJResult> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection,
/// including the reason/diagnostic code,
/// whose legal value range depends on the source.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        match source {
            1 => {
                use AssociationRJServiceUserReason::*;
                let reason = match reason {
                    1 => NoReasonGiven,
                    2 => ApplicationContextNameNotSupported,
                    3 => CallingAETitleNotRecognized,
                    7 => CalledAETitleNotRecognized,
                    4..=6 | 8..=10 => Reserved(reason),
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceUser(reason))
            }
            2 => {
                use AssociationRJServiceProviderAcseReason::*;
                let reason = match reason {
                    1 => NoReasonGiven,
                    2 => ProtocolVersionNotSupported,
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceProviderAcse(reason))
            }
            3 => {
                use AssociationRJServiceProviderPresentationReason::*;
                let reason = match reason {
                    1 => TemporaryCongestion,
                    2 => LocalLimitExceeded,
                    0 | 3..=7 => Reserved(reason),
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceProviderPresentation(reason))
            }
            _ => None,
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderAcse(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderPresentation(r) => Display::fmt(r, f),
        }
    }
}

/// Rejection reasons attributed to the UL service user.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use AssociationRJServiceUserReason::*;
        match self {
            NoReasonGiven => f.write_str("no reason given"),
            ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            CallingAETitleNotRecognized => f.write_str("calling AE title not recognized"),
            CalledAETitleNotRecognized => f.write_str("called AE title not recognized"),
            Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// Rejection reasons attributed to the UL service provider
/// (ACSE related function).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderAcseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AssociationRJServiceProviderAcseReason::NoReasonGiven => "no reason given",
            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => {
                "protocol version not supported"
            }
        })
    }
}

/// Rejection reasons attributed to the UL service provider
/// (presentation related function).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use AssociationRJServiceProviderPresentationReason::*;
        match self {
            TemporaryCongestion => f.write_str("temporary congestion"),
            LocalLimitExceeded => f.write_str("local limit exceeded"),
            Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// A presentation data value (PDV) item of a P-DATA-TF PDU.
///
/// The payload of a PDV should have an even number of bytes;
/// producers of odd-length message fragments
/// append a single padding byte to the final fragment.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a PDV fragment belongs to a command set or to a data set.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an association abort.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        match source {
            0 => Some(AbortRQSource::ServiceUser),
            1 => Some(AbortRQSource::Reserved),
            2 => AbortRQServiceProviderReason::from(reason).map(AbortRQSource::ServiceProvider),
            _ => None,
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason Not Specified
    ReasonNotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl AbortRQServiceProviderReason {
    fn from(code: u8) -> Option<AbortRQServiceProviderReason> {
        use AbortRQServiceProviderReason::*;
        match code {
            0 => Some(ReasonNotSpecified),
            1 => Some(UnrecognizedPdu),
            2 => Some(UnexpectedPdu),
            3 => Some(Reserved),
            4 => Some(UnrecognizedPduParameter),
            5 => Some(UnexpectedPduParameter),
            6 => Some(InvalidPduParameter),
            _ => None,
        }
    }
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use AbortRQServiceProviderReason::*;
        f.write_str(match self {
            ReasonNotSpecified => "reason not specified",
            UnrecognizedPdu => "unrecognized PDU",
            UnexpectedPdu => "unexpected PDU",
            Reserved => "reserved code",
            UnrecognizedPduParameter => "unrecognized PDU parameter",
            UnexpectedPduParameter => "unexpected PDU parameter",
            InvalidPduParameter => "invalid PDU parameter",
        })
    }
}

/// A variable item of an association PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item (PS3.7 Annex D.3).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// An unrecognized sub-item, kept as opaque bytes (type, payload)
    Unknown(u8, Vec<u8>),
    /// Maximum Length sub-item (0x51)
    MaxLength(u32),
    /// Implementation Class UID sub-item (0x52)
    ImplementationClassUID(String),
    /// Implementation Version Name sub-item (0x55)
    ImplementationVersionName(String),
    /// Asynchronous Operations Window sub-item (0x53):
    /// maximum number of operations invoked and performed
    AsyncOperationsWindow(u16, u16),
    /// SCP/SCU Role Selection sub-item (0x54)
    RoleSelection(RoleSelection),
    /// SOP Class Extended Negotiation sub-item (0x56):
    /// SOP class UID and opaque service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// SOP Class Common Extended Negotiation sub-item (0x57)
    SopClassCommonExtendedNegotiationSubItem(CommonExtendedNegotiation),
    /// User Identity sub-item (0x58)
    UserIdentityItem(UserIdentity),
    /// User Identity server response sub-item (0x59)
    UserIdentityResponseItem(Vec<u8>),
}

/// An SCP/SCU role selection for one abstract syntax (PS3.7 D.3.3.4).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the abstract syntax (SOP class) UID this selection applies to
    pub sop_class_uid: String,
    /// whether this node proposes (or is confirmed) to act as an SCU
    pub scu_role: bool,
    /// whether this node proposes (or is confirmed) to act as an SCP
    pub scp_role: bool,
}

/// A SOP class common extended negotiation sub-item (PS3.7 D.3.3.6).
///
/// Only legal in an A-ASSOCIATE-RQ.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_classes: Vec<String>,
}

/// A user identity negotiation proposal (PS3.7 D.3.3.7).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// The type of a user identity proposal.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    fn from(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }

    /// Whether a positive server response to this kind of identity
    /// carries a payload (a Kerberos ticket or SAML/JWT response).
    pub fn has_response_payload(self) -> bool {
        matches!(
            self,
            Self::KerberosServiceTicket | Self::SamlAssertion | Self::Jwt
        )
    }
}

/// An in-memory representation of a full protocol data unit.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// An unrecognized PDU type, kept as opaque bytes
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// A-ASSOCIATE-RQ
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ
    ReleaseRQ,
    /// A-RELEASE-RP
    ReleaseRP,
    /// A-ABORT
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// Provide a short description of the PDU,
    /// which never spells out P-Data payload bytes.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(
                    f,
                    "Unknown {{pdu_type: {}, data: {} bytes }}",
                    pdu_type,
                    data.len()
                )
            }
            Pdu::PData { data } if data.len() <= 2 => {
                f.write_str("PData [")?;
                for (i, pdv) in data.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "({:?}, {} bytes)", pdv.value_type, pdv.data.len())?;
                }
                f.write_str("]")
            }
            Pdu::PData { data } => write!(f, "PData [{} p-data values]", data.len()),
            pdu => std::fmt::Debug::fmt(pdu, f),
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(rq: AssociationRQ) -> Self {
        Pdu::AssociationRQ(rq)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(ac: AssociationAC) -> Self {
        Pdu::AssociationAC(ac)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(rj: AssociationRJ) -> Self {
        Pdu::AssociationRJ(rj)
    }
}

#[cfg(test)]
mod tests {
    use super::{AbortRQSource, PDataValue, PDataValueType, Pdu};

    #[test]
    fn short_description_elides_pdata_payloads() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRQ { source: ServiceUser }",
        );

        let command = PDataValue {
            is_last: true,
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            data: vec![0x11; 90],
        };
        let pdu = Pdu::PData {
            data: vec![command.clone()],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(Command, 90 bytes)]",
        );

        let pdu = Pdu::PData {
            data: vec![command; 3],
        };
        assert_eq!(&pdu.short_description().to_string(), "PData [3 p-data values]");
    }
}
