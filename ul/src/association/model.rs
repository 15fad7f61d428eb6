//! In-memory model of a DICOM association.
//!
//! An [`Association`] gathers everything that is negotiated
//! between two application entities:
//! the presentation contexts with their outcomes,
//! extended negotiations,
//! user identity,
//! the asynchronous operations window,
//! and the maximum PDU lengths of both parties.
//!
//! A requester builds an association
//! through [`Association::request`] and the `add_*`/`set_*` methods,
//! then turns it into an A-ASSOCIATE-RQ via [`Association::to_request`]
//! and merges the acceptor's answer with [`Association::apply_ac`].
//! An acceptor reconstructs the proposal
//! from a received A-ASSOCIATE-RQ via [`Association::from_request`],
//! records its decisions per presentation context,
//! and produces the reply with [`Association::to_ac`].
use snafu::{ensure, OptionExt, Snafu};
use tracing::warn;

use crate::pdu::{
    AssociationAC, AssociationRQ, CommonExtendedNegotiation, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, RoleSelection, UserIdentity,
    UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// no presentation contexts were proposed
    NoPresentationContexts,

    /// too many presentation contexts (maximum is 128)
    TooManyPresentationContexts,

    #[snafu(display("presentation context ID {} is not odd", id))]
    EvenPresentationContextId { id: u8 },

    #[snafu(display("presentation context ID {} proposed more than once", id))]
    DuplicatePresentationContextId { id: u8 },

    #[snafu(display("unknown presentation context ID {}", id))]
    UnknownPresentationContextId { id: u8 },

    #[snafu(display(
        "accepting presentation context {} requires a transfer syntax",
        id
    ))]
    MissingAcceptedTransferSyntax { id: u8 },

    #[snafu(display(
        "extended negotiation for SOP class {} declared more than once",
        sop_class_uid
    ))]
    DuplicateExtendedNegotiation { sop_class_uid: String },

    #[snafu(display(
        "accepted application info for SOP class {} is longer than requested ({} > {})",
        sop_class_uid,
        accepted,
        requested
    ))]
    AcceptedInfoTooLong {
        sop_class_uid: String,
        requested: usize,
        accepted: usize,
    },

    #[snafu(display(
        "no extended negotiation was proposed for SOP class {}",
        sop_class_uid
    ))]
    NoSuchExtendedNegotiation { sop_class_uid: String },

    #[snafu(display(
        "user identity of type {:?} must not carry a secondary field",
        identity_type
    ))]
    UnexpectedSecondaryField { identity_type: UserIdentityType },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The application context name of the DICOM application context,
/// the only one defined by the standard (PS3.7 Annex A.2.1).
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Coerce an AE title into its wire form:
/// ASCII only, at most 16 characters,
/// non-representable characters replaced rather than rejected.
fn coerce_ae_title(ae_title: &str) -> String {
    let mut out: String = ae_title
        .trim()
        .chars()
        .map(|c| if c.is_ascii() && c != '\\' { c } else { '?' })
        .collect();
    out.truncate(16);
    out
}

/// The outcome recorded for one presentation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextResult {
    Accepted,
    RejectedByUser,
    RejectedNoReason,
    RejectedAbstractSyntaxNotSupported,
    RejectedTransferSyntaxesNotSupported,
    /// The proposed SCU/SCP role combination was not supported.
    ///
    /// This outcome has no code of its own in the result byte of the
    /// presentation context reply item;
    /// it is emitted as a user rejection on the wire.
    RejectedRoleSelectionNotSupported,
}

impl ContextResult {
    pub fn is_accepted(self) -> bool {
        self == ContextResult::Accepted
    }

    fn reason(self) -> PresentationContextResultReason {
        match self {
            ContextResult::Accepted => PresentationContextResultReason::Acceptance,
            ContextResult::RejectedByUser | ContextResult::RejectedRoleSelectionNotSupported => {
                PresentationContextResultReason::UserRejection
            }
            ContextResult::RejectedNoReason => PresentationContextResultReason::NoReason,
            ContextResult::RejectedAbstractSyntaxNotSupported => {
                PresentationContextResultReason::AbstractSyntaxNotSupported
            }
            ContextResult::RejectedTransferSyntaxesNotSupported => {
                PresentationContextResultReason::TransferSyntaxesNotSupported
            }
        }
    }
}

impl From<PresentationContextResultReason> for ContextResult {
    fn from(reason: PresentationContextResultReason) -> Self {
        match reason {
            PresentationContextResultReason::Acceptance => ContextResult::Accepted,
            PresentationContextResultReason::UserRejection => ContextResult::RejectedByUser,
            PresentationContextResultReason::NoReason => ContextResult::RejectedNoReason,
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                ContextResult::RejectedAbstractSyntaxNotSupported
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                ContextResult::RejectedTransferSyntaxesNotSupported
            }
        }
    }
}

/// One presentation context of an association,
/// from proposal to negotiated outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContext {
    id: u8,
    abstract_syntax: String,
    proposed_transfer_syntaxes: Vec<String>,
    result: Option<ContextResult>,
    accepted_transfer_syntax: Option<String>,
    scu_role: Option<bool>,
    scp_role: Option<bool>,
}

impl PresentationContext {
    /// The presentation context identifier,
    /// an odd integer between 1 and 255.
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn abstract_syntax(&self) -> &str {
        &self.abstract_syntax
    }

    pub fn proposed_transfer_syntaxes(&self) -> &[String] {
        &self.proposed_transfer_syntaxes
    }

    /// The negotiated outcome,
    /// or `None` while the context is still only proposed.
    pub fn result(&self) -> Option<ContextResult> {
        self.result
    }

    pub fn is_accepted(&self) -> bool {
        self.result.map(ContextResult::is_accepted).unwrap_or(false)
    }

    /// The transfer syntax chosen by the acceptor.
    ///
    /// This is `Some` if and only if the context was accepted.
    pub fn accepted_transfer_syntax(&self) -> Option<&str> {
        self.accepted_transfer_syntax.as_deref()
    }

    /// The proposed or confirmed SCU role for this context's abstract syntax.
    pub fn scu_role(&self) -> Option<bool> {
        self.scu_role
    }

    /// The proposed or confirmed SCP role for this context's abstract syntax.
    pub fn scp_role(&self) -> Option<bool> {
        self.scp_role
    }

    /// Record the outcome of the negotiation for this context.
    ///
    /// Accepting requires a transfer syntax;
    /// any other outcome clears a previously accepted transfer syntax.
    pub fn set_result(
        &mut self,
        result: ContextResult,
        transfer_syntax: Option<String>,
    ) -> Result<()> {
        if result.is_accepted() {
            ensure!(
                transfer_syntax.is_some(),
                MissingAcceptedTransferSyntaxSnafu { id: self.id }
            );
            self.accepted_transfer_syntax = transfer_syntax;
        } else {
            self.accepted_transfer_syntax = None;
        }
        self.result = Some(result);
        Ok(())
    }
}

/// An extended negotiation entry for one SOP class (PS3.7 D.3.3.5/D.3.3.6).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedNegotiation {
    sop_class_uid: String,
    requested_application_info: Vec<u8>,
    accepted_application_info: Option<Vec<u8>>,
    service_class_uid: Option<String>,
    related_general_sop_classes: Vec<String>,
}

impl ExtendedNegotiation {
    pub fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    pub fn requested_application_info(&self) -> &[u8] {
        &self.requested_application_info
    }

    /// The application info confirmed by the acceptor.
    ///
    /// `None` when the acceptor did not answer the item,
    /// meaning that the extension is not supported (PS3.7 D.3.3).
    pub fn accepted_application_info(&self) -> Option<&[u8]> {
        self.accepted_application_info.as_deref()
    }

    pub fn service_class_uid(&self) -> Option<&str> {
        self.service_class_uid.as_deref()
    }

    pub fn related_general_sop_classes(&self) -> &[String] {
        &self.related_general_sop_classes
    }

    /// Record the application info confirmed by the acceptor.
    ///
    /// The acceptor may only confirm a prefix of the proposed capabilities:
    /// accepted info longer than the requested info is refused.
    pub fn accept(&mut self, info: Vec<u8>) -> Result<()> {
        ensure!(
            info.len() <= self.requested_application_info.len(),
            AcceptedInfoTooLongSnafu {
                sop_class_uid: self.sop_class_uid.clone(),
                requested: self.requested_application_info.len(),
                accepted: info.len(),
            }
        );
        self.accepted_application_info = Some(info);
        Ok(())
    }
}

/// The asynchronous operations window (PS3.7 D.3.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncOperationsWindow {
    pub max_operations_invoked: u16,
    pub max_operations_performed: u16,
}

/// A user identity negotiation,
/// pairing the proposal with the acceptor's response.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentityNegotiation {
    identity: UserIdentity,
    server_response: Option<Vec<u8>>,
}

impl UserIdentityNegotiation {
    /// Validate and wrap a user identity proposal.
    pub fn new(identity: UserIdentity) -> Result<Self> {
        ensure!(
            identity.secondary_field().is_empty()
                || identity.identity_type() == UserIdentityType::UsernamePassword,
            UnexpectedSecondaryFieldSnafu {
                identity_type: identity.identity_type()
            }
        );
        Ok(UserIdentityNegotiation {
            identity,
            server_response: None,
        })
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// The acceptor's positive response payload, once received.
    pub fn server_response(&self) -> Option<&[u8]> {
        self.server_response.as_deref()
    }

    pub fn set_server_response(&mut self, response: Vec<u8>) {
        self.server_response = Some(response);
    }
}

/// A negotiated or negotiating association between two application entities.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    calling_ae_title: String,
    called_ae_title: String,
    protocol_version: u16,
    max_pdu_length: u32,
    peer_max_pdu_length: Option<u32>,
    presentation_contexts: Vec<PresentationContext>,
    extended_negotiations: Vec<ExtendedNegotiation>,
    user_identity: Option<UserIdentityNegotiation>,
    async_operations_window: Option<AsyncOperationsWindow>,
    peer_implementation_class_uid: Option<String>,
    peer_implementation_version_name: Option<String>,
}

impl Association {
    /// Start building an association proposal as the requester.
    ///
    /// AE titles are coerced into their wire form
    /// (ASCII, at most 16 characters).
    pub fn request(
        calling_ae_title: impl AsRef<str>,
        called_ae_title: impl AsRef<str>,
    ) -> Association {
        Association {
            calling_ae_title: coerce_ae_title(calling_ae_title.as_ref()),
            called_ae_title: coerce_ae_title(called_ae_title.as_ref()),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            peer_max_pdu_length: None,
            presentation_contexts: Vec::new(),
            extended_negotiations: Vec::new(),
            user_identity: None,
            async_operations_window: None,
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
        }
    }

    /// Reconstruct the proposed association
    /// from a received A-ASSOCIATE-RQ,
    /// validating the presentation context identifiers
    /// and the uniqueness of extended negotiation entries.
    pub fn from_request(rq: &AssociationRQ) -> Result<Association> {
        let mut presentation_contexts: Vec<PresentationContext> =
            Vec::with_capacity(rq.presentation_contexts.len());
        for pc in &rq.presentation_contexts {
            ensure!(pc.id % 2 == 1, EvenPresentationContextIdSnafu { id: pc.id });
            ensure!(
                presentation_contexts.iter().all(|c| c.id != pc.id),
                DuplicatePresentationContextIdSnafu { id: pc.id }
            );
            presentation_contexts.push(PresentationContext {
                id: pc.id,
                abstract_syntax: pc.abstract_syntax.clone(),
                proposed_transfer_syntaxes: pc.transfer_syntaxes.clone(),
                result: None,
                accepted_transfer_syntax: None,
                scu_role: None,
                scp_role: None,
            });
        }

        let mut association = Association {
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            protocol_version: rq.protocol_version,
            max_pdu_length: DEFAULT_MAX_PDU,
            peer_max_pdu_length: None,
            presentation_contexts,
            extended_negotiations: Vec::new(),
            user_identity: None,
            async_operations_window: None,
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
        };

        for item in &rq.user_variables {
            match item {
                UserVariableItem::MaxLength(len) => {
                    association.peer_max_pdu_length = Some(interpret_max_length(*len));
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    association.peer_implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    association.peer_implementation_version_name = Some(name.clone());
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    association.async_operations_window = Some(AsyncOperationsWindow {
                        max_operations_invoked: *invoked,
                        max_operations_performed: *performed,
                    });
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    association.attach_role_selection(role_selection);
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info) => {
                    association.add_extended_negotiation(sop_class_uid.clone(), info.clone())?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(common) => {
                    association.merge_common_extended_negotiation(common);
                }
                UserVariableItem::UserIdentityItem(identity) => {
                    association.user_identity =
                        Some(UserIdentityNegotiation::new(identity.clone())?);
                }
                UserVariableItem::UserIdentityResponseItem(_) | UserVariableItem::Unknown(..) => {}
            }
        }

        Ok(association)
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// The maximum PDU length this node is willing to receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// The maximum PDU length advertised by the peer, once known.
    pub fn peer_max_pdu_length(&self) -> Option<u32> {
        self.peer_max_pdu_length
    }

    /// The PDU length bound to apply when sending P-DATA to the peer.
    ///
    /// Once established, the peer's advertised maximum takes precedence
    /// over any locally configured value.
    pub fn send_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length.unwrap_or(DEFAULT_MAX_PDU)
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.presentation_contexts
    }

    pub fn presentation_context(&self, id: u8) -> Option<&PresentationContext> {
        self.presentation_contexts.iter().find(|pc| pc.id == id)
    }

    pub fn presentation_context_mut(&mut self, id: u8) -> Option<&mut PresentationContext> {
        self.presentation_contexts.iter_mut().find(|pc| pc.id == id)
    }

    /// Iterate over the accepted presentation contexts.
    pub fn accepted_contexts(&self) -> impl Iterator<Item = &PresentationContext> {
        self.presentation_contexts
            .iter()
            .filter(|pc| pc.is_accepted())
    }

    /// Find an accepted presentation context for the given abstract syntax.
    pub fn context_for_abstract_syntax(&self, abstract_syntax: &str) -> Option<&PresentationContext> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax)
    }

    pub fn extended_negotiations(&self) -> &[ExtendedNegotiation] {
        &self.extended_negotiations
    }

    pub fn extended_negotiation(&self, sop_class_uid: &str) -> Option<&ExtendedNegotiation> {
        self.extended_negotiations
            .iter()
            .find(|e| e.sop_class_uid == sop_class_uid)
    }

    /// Record the accepted application info
    /// for a previously proposed extended negotiation (acceptor side).
    pub fn accept_extended_negotiation(
        &mut self,
        sop_class_uid: &str,
        info: Vec<u8>,
    ) -> Result<()> {
        let entry = self
            .extended_negotiations
            .iter_mut()
            .find(|e| e.sop_class_uid == sop_class_uid)
            .context(NoSuchExtendedNegotiationSnafu { sop_class_uid })?;
        entry.accept(info)
    }

    pub fn user_identity(&self) -> Option<&UserIdentityNegotiation> {
        self.user_identity.as_ref()
    }

    pub fn user_identity_mut(&mut self) -> Option<&mut UserIdentityNegotiation> {
        self.user_identity.as_mut()
    }

    pub fn async_operations_window(&self) -> Option<AsyncOperationsWindow> {
        self.async_operations_window
    }

    pub fn peer_implementation_class_uid(&self) -> Option<&str> {
        self.peer_implementation_class_uid.as_deref()
    }

    pub fn peer_implementation_version_name(&self) -> Option<&str> {
        self.peer_implementation_version_name.as_deref()
    }

    /// Override the maximum PDU length this node admits for receiving.
    pub fn set_max_pdu_length(&mut self, value: u32) {
        self.max_pdu_length = value;
    }

    /// Propose a new presentation context,
    /// assigning the next odd identifier in proposal order.
    ///
    /// Returns the identifier given to the new context.
    pub fn add_presentation_context(
        &mut self,
        abstract_syntax: impl Into<String>,
        transfer_syntaxes: Vec<String>,
    ) -> Result<u8> {
        // odd IDs 1, 3, 5, ... up to 255
        let id = self.presentation_contexts.len() * 2 + 1;
        ensure!(id <= 255, TooManyPresentationContextsSnafu);
        let id = id as u8;
        self.presentation_contexts.push(PresentationContext {
            id,
            abstract_syntax: abstract_syntax.into(),
            proposed_transfer_syntaxes: transfer_syntaxes,
            result: None,
            accepted_transfer_syntax: None,
            scu_role: None,
            scp_role: None,
        });
        Ok(id)
    }

    /// Propose extended negotiation application info for a SOP class.
    ///
    /// At most one entry may exist per SOP class.
    pub fn add_extended_negotiation(
        &mut self,
        sop_class_uid: impl Into<String>,
        requested_application_info: Vec<u8>,
    ) -> Result<()> {
        let sop_class_uid = sop_class_uid.into();
        ensure!(
            self.extended_negotiation(&sop_class_uid).is_none(),
            DuplicateExtendedNegotiationSnafu { sop_class_uid }
        );
        self.extended_negotiations.push(ExtendedNegotiation {
            sop_class_uid,
            requested_application_info,
            accepted_application_info: None,
            service_class_uid: None,
            related_general_sop_classes: Vec::new(),
        });
        Ok(())
    }

    /// Declare common extended negotiation information for a SOP class,
    /// merging with an existing extended negotiation entry if present.
    pub fn add_common_extended_negotiation(
        &mut self,
        sop_class_uid: impl Into<String>,
        service_class_uid: impl Into<String>,
        related_general_sop_classes: Vec<String>,
    ) {
        self.merge_common_extended_negotiation(&CommonExtendedNegotiation {
            sop_class_uid: sop_class_uid.into(),
            service_class_uid: service_class_uid.into(),
            related_general_sop_classes,
        });
    }

    fn merge_common_extended_negotiation(&mut self, common: &CommonExtendedNegotiation) {
        if let Some(entry) = self
            .extended_negotiations
            .iter_mut()
            .find(|e| e.sop_class_uid == common.sop_class_uid)
        {
            entry.service_class_uid = Some(common.service_class_uid.clone());
            entry.related_general_sop_classes = common.related_general_sop_classes.clone();
        } else {
            self.extended_negotiations.push(ExtendedNegotiation {
                sop_class_uid: common.sop_class_uid.clone(),
                requested_application_info: Vec::new(),
                accepted_application_info: None,
                service_class_uid: Some(common.service_class_uid.clone()),
                related_general_sop_classes: common.related_general_sop_classes.clone(),
            });
        }
    }

    /// Propose a user identity.
    pub fn set_user_identity(&mut self, identity: UserIdentity) -> Result<()> {
        self.user_identity = Some(UserIdentityNegotiation::new(identity)?);
        Ok(())
    }

    /// Propose an asynchronous operations window.
    pub fn set_async_operations_window(&mut self, invoked: u16, performed: u16) {
        self.async_operations_window = Some(AsyncOperationsWindow {
            max_operations_invoked: invoked,
            max_operations_performed: performed,
        });
    }

    /// Propose SCU/SCP roles for every presentation context
    /// with the given abstract syntax.
    pub fn set_role_selection(&mut self, abstract_syntax: &str, scu_role: bool, scp_role: bool) {
        for pc in self
            .presentation_contexts
            .iter_mut()
            .filter(|pc| pc.abstract_syntax == abstract_syntax)
        {
            pc.scu_role = Some(scu_role);
            pc.scp_role = Some(scp_role);
        }
    }

    fn attach_role_selection(&mut self, role_selection: &RoleSelection) {
        for pc in self
            .presentation_contexts
            .iter_mut()
            .filter(|pc| pc.abstract_syntax == role_selection.sop_class_uid)
        {
            pc.scu_role = Some(role_selection.scu_role);
            pc.scp_role = Some(role_selection.scp_role);
        }
    }

    /// Build the A-ASSOCIATE-RQ PDU for this proposal.
    pub fn to_request(&self) -> Result<AssociationRQ> {
        ensure!(
            !self.presentation_contexts.is_empty(),
            NoPresentationContextsSnafu
        );

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];

        if let Some(window) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(
                window.max_operations_invoked,
                window.max_operations_performed,
            ));
        }

        for pc in &self.presentation_contexts {
            if let (Some(scu_role), Some(scp_role)) = (pc.scu_role, pc.scp_role) {
                user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: pc.abstract_syntax.clone(),
                    scu_role,
                    scp_role,
                }));
            }
        }

        for negotiation in &self.extended_negotiations {
            if !negotiation.requested_application_info.is_empty() {
                user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                    negotiation.sop_class_uid.clone(),
                    negotiation.requested_application_info.clone(),
                ));
            }
            if let Some(service_class_uid) = &negotiation.service_class_uid {
                user_variables.push(UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                    CommonExtendedNegotiation {
                        sop_class_uid: negotiation.sop_class_uid.clone(),
                        service_class_uid: service_class_uid.clone(),
                        related_general_sop_classes: negotiation
                            .related_general_sop_classes
                            .clone(),
                    },
                ));
            }
        }

        if let Some(user_identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(
                user_identity.identity.clone(),
            ));
        }

        Ok(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(|pc| PresentationContextProposed {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntaxes: pc.proposed_transfer_syntaxes.clone(),
                })
                .collect(),
            user_variables,
        })
    }

    /// Merge a received A-ASSOCIATE-AC into this association proposal.
    ///
    /// The acceptor must echo the identifiers it is answering;
    /// answers referring to unknown contexts are an error.
    /// Extended negotiation items absent from the AC
    /// leave the corresponding accepted info as `None`
    /// ("not supported", PS3.7 D.3.3).
    pub fn apply_ac(&mut self, ac: &AssociationAC) -> Result<()> {
        for result in &ac.presentation_contexts {
            let pc = self
                .presentation_contexts
                .iter_mut()
                .find(|pc| pc.id == result.id)
                .context(UnknownPresentationContextIdSnafu { id: result.id })?;

            let outcome = ContextResult::from(result.reason);
            let transfer_syntax = outcome
                .is_accepted()
                .then(|| result.transfer_syntax.clone());
            pc.set_result(outcome, transfer_syntax)?;
        }

        for item in &ac.user_variables {
            match item {
                UserVariableItem::MaxLength(len) => {
                    self.peer_max_pdu_length = Some(interpret_max_length(*len));
                }
                UserVariableItem::ImplementationClassUID(uid) => {
                    self.peer_implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.peer_implementation_version_name = Some(name.clone());
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    self.async_operations_window = Some(AsyncOperationsWindow {
                        max_operations_invoked: *invoked,
                        max_operations_performed: *performed,
                    });
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    self.attach_role_selection(role_selection);
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info) => {
                    match self
                        .extended_negotiations
                        .iter_mut()
                        .find(|e| e.sop_class_uid == *sop_class_uid)
                    {
                        Some(entry) => entry.accept(info.clone())?,
                        None => {
                            warn!(
                                "Ignoring unsolicited extended negotiation for SOP class {}",
                                sop_class_uid
                            );
                        }
                    }
                }
                UserVariableItem::UserIdentityResponseItem(response) => {
                    if let Some(user_identity) = &mut self.user_identity {
                        user_identity.set_server_response(response.clone());
                    } else {
                        warn!("Ignoring unsolicited user identity server response");
                    }
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(_)
                | UserVariableItem::UserIdentityItem(_)
                | UserVariableItem::Unknown(..) => {}
            }
        }

        Ok(())
    }

    /// Build the A-ASSOCIATE-AC PDU answering this proposal.
    ///
    /// Contexts still without a recorded result
    /// are reported as rejected with no reason.
    pub fn to_ac(&self) -> AssociationAC {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];

        if let Some(window) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(
                window.max_operations_invoked,
                window.max_operations_performed,
            ));
        }

        for pc in &self.presentation_contexts {
            if let (Some(scu_role), Some(scp_role)) = (pc.scu_role, pc.scp_role) {
                user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: pc.abstract_syntax.clone(),
                    scu_role,
                    scp_role,
                }));
            }
        }

        for negotiation in &self.extended_negotiations {
            if let Some(accepted) = &negotiation.accepted_application_info {
                user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                    negotiation.sop_class_uid.clone(),
                    accepted.clone(),
                ));
            }
        }

        if let Some(user_identity) = &self.user_identity {
            if let Some(response) = &user_identity.server_response {
                user_variables.push(UserVariableItem::UserIdentityResponseItem(response.clone()));
            }
        }

        AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc
                        .result
                        .unwrap_or(ContextResult::RejectedNoReason)
                        .reason(),
                    transfer_syntax: pc
                        .accepted_transfer_syntax
                        .clone()
                        // not significant on rejection, but the sub-item is mandatory
                        .unwrap_or_else(|| "1.2.840.10008.1.2".to_string()),
                })
                .collect(),
            user_variables,
        }
    }
}

/// A maximum length of 0 means that no maximum is specified (PS3.8 D.1),
/// in which case this node sends PDUs up to its own absolute maximum.
fn interpret_max_length(len: u32) -> u32 {
    if len == 0 {
        crate::pdu::MAXIMUM_PDU_SIZE
    } else {
        len
    }
}
