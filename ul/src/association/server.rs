//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::{borrow::Cow, io::Write, net::TcpStream, time::Duration};

use bytes::BytesMut;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, ResultExt};
use tracing::warn;

use crate::association::{
    model::{Association, ContextResult},
    state::{Action, Event, StateMachine},
    trim_uid, AbortedSnafu, Error, MissingAbstractSyntaxSnafu, NegotiationSnafu, RejectedSnafu,
    Result, SendPduSnafu, SendTooLongPduSnafu, SetReadTimeoutSnafu, SetWriteTimeoutSnafu,
    SocketOptions, UnexpectedPduSnafu, UnknownPduSnafu, WireSendSnafu,
};
use crate::pdu::{
    write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu, UserIdentity,
    DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};

use super::model::DICOM_APPLICATION_CONTEXT_NAME;
use super::pdata::{PDataReader, PDataWriter};

/// An application entity access control policy,
/// consulted before an association request is answered.
///
/// [`AcceptAny`] and [`AcceptCalledAeTitle`] are provided;
/// custom policies can also look at the proposed user identity.
pub trait AccessControl {
    /// Decide whether the requesting node is given clearance.
    ///
    /// A denial carries the service-user rejection reason
    /// to place in the A-ASSOCIATE-RJ.
    fn authorize(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// Access control policy which admits any association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn authorize(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// Access control policy which requires the called AE title
/// to match this node's own AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn authorize(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Application-level answers to negotiation items of one association request,
/// supplied by the layer above the acceptor
/// (e.g. the DIMSE service provider).
#[derive(Debug, Default, Clone)]
pub struct NegotiationOverrides {
    /// accepted extended negotiation application info, per SOP class UID
    pub extended_negotiation_responses: Vec<(String, Vec<u8>)>,
    /// the payload for a positive user identity server response
    pub user_identity_server_response: Option<Vec<u8>>,
}

/// Options for answering association requests as the acceptor node,
/// often one taking the role of a service class provider (SCP).
///
/// A successful negotiation yields a [`ServerAssociation`].
/// Unlike its client counterpart,
/// a value of this type can serve multiple connections.
///
/// Transfer syntax choice defaults to
/// anything supported by the main [transfer syntax registry][1];
/// calling [`with_transfer_syntax`][2] one or more times
/// narrows the candidates to those given.
///
/// The access control policy decides
/// whether an association request is honored at all:
/// [`AcceptAny`] by default,
/// [`AcceptCalledAeTitle`] via
/// [`accept_called_ae_title`](Self::accept_called_ae_title),
/// or anything implementing [`AccessControl`].
///
/// [1]: dicom_transfer_syntax_registry
/// [2]: Self::with_transfer_syntax
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use radlink_ul::association::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            strict: true,
            promiscuous: false,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            socket_options: SocketOptions::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for answering association requests.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Switch to the policy which admits any association request,
    /// disregarding AE titles.
    /// This is the initial policy.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Switch to the policy which only admits requests
    /// whose called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Install a custom access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            abstract_syntax_uids,
            transfer_syntax_uids,
            strict,
            promiscuous,
            protocol_version,
            max_pdu_length,
            socket_options,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            abstract_syntax_uids,
            transfer_syntax_uids,
            strict,
            promiscuous,
            protocol_version,
            max_pdu_length,
            socket_options,
        }
    }

    /// Set the AE title under which this node presents itself.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Add an abstract syntax to the set this node is willing to accept.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Add a transfer syntax to the candidates
    /// for each accepted presentation context.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Declare a different maximum PDU length
    /// for the peer to honor when sending PDUs to this node.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Choose whether an incoming PDU over the declared maximum length
    /// is an error (strict, the default) or merely a logged warning.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Choose whether to answer proposals
    /// for abstract syntaxes this node never declared
    /// (promiscuous mode, off by default).
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Process an association request,
    /// deciding each presentation context
    /// and gathering the negotiation answers into an association.
    ///
    /// In the success case, returns the A-ASSOCIATE-AC PDU to send back
    /// along with the negotiated association.
    /// In the error case, returns the A-ASSOCIATE-RJ or A-ABORT PDU
    /// to send back along with the error to surface.
    ///
    /// This decision procedure is deliberately transport-free
    /// so that blocking and asynchronous acceptors can share it.
    #[allow(clippy::result_large_err)]
    pub fn process_request(
        &self,
        rq: AssociationRQ,
        overrides: &NegotiationOverrides,
    ) -> std::result::Result<(Pdu, Association), (Pdu, Error)> {
        if rq.protocol_version != self.protocol_version {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderAcse(
                    crate::pdu::AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                ),
            };
            let pdu = Pdu::AssociationRJ(association_rj.clone());
            return Err((pdu, RejectedSnafu { association_rj }.build()));
        }

        if rq.application_context_name != DICOM_APPLICATION_CONTEXT_NAME {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            };
            let pdu = Pdu::AssociationRJ(association_rj.clone());
            return Err((pdu, RejectedSnafu { association_rj }.build()));
        }

        let mut association = match Association::from_request(&rq).context(NegotiationSnafu) {
            Ok(association) => association,
            Err(e) => {
                // structurally broken proposal:
                // abort instead of attempting a negotiation reply
                let pdu = Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::InvalidPduParameter,
                    ),
                };
                return Err((pdu, e));
            }
        };

        if let Err(reason) = self.ae_access_control.authorize(
            &self.ae_title,
            association.calling_ae_title(),
            association.called_ae_title(),
            association.user_identity().map(|u| u.identity()),
        ) {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            };
            let pdu = Pdu::AssociationRJ(association_rj.clone());
            return Err((pdu, RejectedSnafu { association_rj }.build()));
        }

        association.set_max_pdu_length(self.max_pdu_length);

        // decide each presentation context
        let decisions: Vec<(u8, ContextResult, Option<String>)> = association
            .presentation_contexts()
            .iter()
            .map(|pc| {
                let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax().to_string()));
                let (result, transfer_syntax) = if !self
                    .abstract_syntax_uids
                    .contains(&abstract_syntax)
                    && !self.promiscuous
                {
                    (ContextResult::RejectedAbstractSyntaxNotSupported, None)
                } else {
                    match self.choose_ts(pc.proposed_transfer_syntaxes().iter().cloned()) {
                        Some(ts) => (ContextResult::Accepted, Some(ts)),
                        None => (ContextResult::RejectedTransferSyntaxesNotSupported, None),
                    }
                };
                (pc.id(), result, transfer_syntax)
            })
            .collect();
        for (id, result, transfer_syntax) in decisions {
            if let Some(pc) = association.presentation_context_mut(id) {
                if let Err(e) = pc.set_result(result, transfer_syntax) {
                    return Err((
                        Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::InvalidPduParameter,
                            ),
                        },
                        Error::Negotiation { source: e },
                    ));
                }
            }
        }

        // answer extended negotiation items as directed by the upper layer;
        // unanswered items stay unconfirmed ("not supported")
        for (sop_class_uid, info) in &overrides.extended_negotiation_responses {
            if let Err(e) = association.accept_extended_negotiation(sop_class_uid, info.clone()) {
                warn!(
                    "Refusing extended negotiation answer for {}: {}",
                    sop_class_uid, e
                );
            }
        }

        // a positive user identity response, when requested
        if let Some(user_identity) = association.user_identity_mut() {
            if user_identity.identity().positive_response_requested() {
                let response = overrides
                    .user_identity_server_response
                    .clone()
                    .unwrap_or_default();
                user_identity.set_server_response(response);
            }
        }

        let ac = association.to_ac();
        Ok((Pdu::AssociationAC(ac), association))
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation<TcpStream>> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        socket
            .set_read_timeout(self.socket_options.read_timeout)
            .context(SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.socket_options.write_timeout)
            .context(SetWriteTimeoutSnafu)?;

        let mut read_buffer =
            BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        let mut write_buffer: Vec<u8> = Vec::with_capacity(self.max_pdu_length as usize);

        let msg = super::read_pdu_from_wire(
            &mut socket,
            &mut read_buffer,
            self.max_pdu_length,
            self.strict,
        )?;

        let mut state = StateMachine::new();
        match state.handle(Event::Received(&msg)) {
            Ok(Action::AskAcceptance) => {}
            Ok(_) => unreachable!("only an association request is legal in the idle state"),
            Err(_) => {
                // answer a stray release politely, abort anything else
                let (reply, error) = match msg {
                    Pdu::ReleaseRQ => (Pdu::ReleaseRP, AbortedSnafu.build()),
                    pdu @ Pdu::Unknown { .. } => (
                        Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::UnrecognizedPdu,
                            ),
                        },
                        UnknownPduSnafu { pdu }.build(),
                    ),
                    pdu => (
                        Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::UnexpectedPdu,
                            ),
                        },
                        UnexpectedPduSnafu { pdu }.build(),
                    ),
                };
                write_pdu(&mut write_buffer, &reply).context(SendPduSnafu)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;
                return Err(error);
            }
        }

        let rq = match msg {
            Pdu::AssociationRQ(rq) => rq,
            _ => unreachable!("the state machine validated the PDU type"),
        };

        match self.process_request(rq, &NegotiationOverrides::default()) {
            Ok((pdu, association)) => {
                let _ = state.handle(Event::Accept);
                write_pdu(&mut write_buffer, &pdu).context(SendPduSnafu)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;
                Ok(ServerAssociation {
                    association,
                    state,
                    socket,
                    read_buffer,
                    write_buffer,
                    strict: self.strict,
                })
            }
            Err((pdu, err)) => {
                let _ = state.handle(Event::Reject);
                write_pdu(&mut write_buffer, &pdu).context(SendPduSnafu)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;
                Err(err)
            }
        }
    }

    /// Pick the first proposed transfer syntax which is
    /// both on the options' candidate list (when one was given)
    /// and supported by the main transfer syntax registry.
    fn choose_ts<I, T>(&self, proposed: I) -> Option<T>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        if self.transfer_syntax_uids.is_empty() {
            return choose_supported(proposed);
        }
        proposed.into_iter().find(|ts| {
            let uid = ts.as_ref();
            self.transfer_syntax_uids.contains(&trim_uid(uid.into())) && is_supported(uid)
        })
    }
}

/// An established association in which this node is the acceptor.
///
/// PDUs are exchanged through [`send`](Self::send)
/// and [`receive`](Self::receive);
/// large data sets are better sent through the P-Data writer
/// obtained from [`send_pdata`](Self::send_pdata).
///
/// Dropping the value shuts down the underlying TCP connection.
#[derive(Debug)]
pub struct ServerAssociation<S> {
    /// The negotiated association
    association: Association,
    /// The association lifecycle state
    state: StateMachine,
    /// The stream to the other DICOM node
    socket: S,
    /// Buffer for incoming bytes not yet decoded into a PDU
    read_buffer: BytesMut,
    /// Reusable buffer to assemble PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
}

impl<S> ServerAssociation<S>
where
    S: std::io::Read + std::io::Write,
{
    /// Obtain a view of the negotiated association.
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn client_ae_title(&self) -> &str {
        self.association.calling_ae_title()
    }

    /// Retrieve the maximum PDU length to apply
    /// when sending PDUs to the peer.
    pub fn send_max_pdu_length(&self) -> u32 {
        self.association.send_max_pdu_length()
    }

    /// Send a PDU message to the other intervenient.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, msg).context(SendPduSnafu)?;
        let limit = self.send_max_pdu_length() as usize + PDU_HEADER_SIZE as usize;
        if self.write_buffer.len() > limit {
            return SendTooLongPduSnafu {
                length: self.write_buffer.len(),
            }
            .fail();
        }
        self.socket
            .write_all(&self.write_buffer)
            .context(WireSendSnafu)
    }

    /// Read a PDU message from the other intervenient,
    /// validating it against the association state.
    pub fn receive(&mut self) -> Result<Pdu> {
        let pdu = super::read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.association.max_pdu_length(),
            self.strict,
        )?;
        match self.state.handle(Event::Received(&pdu)) {
            Ok(_) => Ok(pdu),
            Err(_) => {
                let _ = self.send(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                });
                match pdu {
                    pdu @ Pdu::Unknown { .. } => UnknownPduSnafu { pdu }.fail(),
                    pdu => UnexpectedPduSnafu { pdu }.fail(),
                }
            }
        }
    }

    /// Send an abort message, terminating the association.
    pub fn abort(&mut self) -> Result<()> {
        let _ = self.state.handle(Event::Abort);
        self.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        })
    }

    /// Obtain access to the inner stream
    /// connected to the association requester.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut S> {
        let max_pdu_length = self.send_max_pdu_length();
        PDataWriter::new(&mut self.socket, presentation_context_id, max_pdu_length)
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        PDataReader::new(
            &mut self.socket,
            &mut self.read_buffer,
            self.association.max_pdu_length(),
        )
    }
}

/// Whether the given transfer syntax index
/// fully supports the transfer syntax with the given UID,
/// meaning that data sets in it can be parsed and decoded.
///
/// ```
/// # use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
/// # use radlink_ul::association::server::is_supported_with_repo;
/// // Implicit VR Little Endian is always supported
/// assert!(is_supported_with_repo(TransferSyntaxRegistry, "1.2.840.10008.1.2"));
/// ```
pub fn is_supported_with_repo<R>(registry: R, uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    registry.get(uid).is_some_and(|ts| !ts.is_unsupported())
}

/// Whether the main transfer syntax registry
/// fully supports the transfer syntax with the given UID.
///
/// ```
/// # use radlink_ul::association::server::is_supported;
/// // Implicit VR Little Endian is always supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, uid)
}

/// Pick the first of the given transfer syntaxes
/// supported by the given transfer syntax index.
pub fn choose_supported_with_repo<R, I, T>(registry: R, candidates: I) -> Option<T>
where
    R: TransferSyntaxIndex,
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    candidates
        .into_iter()
        .find(|ts| is_supported_with_repo(&registry, ts.as_ref()))
}

/// Pick the first of the given transfer syntaxes
/// supported by the main transfer syntax registry.
pub fn choose_supported<I, T>(candidates: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    candidates.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chooses_first_supported_transfer_syntax() {
        // unregistered UIDs yield nothing
        assert_eq!(choose_supported(vec!["1.1.1.1.1"]), None);

        assert_eq!(
            choose_supported(vec!["1.1.1.1.1", "1.2.840.10008.1.2"]),
            Some("1.2.840.10008.1.2"),
        );

        // proposal order wins over registry order
        assert_eq!(
            choose_supported(vec![
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string(),
            ]),
            Some("1.2.840.10008.1.2.1".to_string()),
        );
    }

    #[test]
    fn rejects_unknown_application_context() {
        let options = ServerAssociationOptions::new().with_abstract_syntax("1.2.840.10008.1.1");
        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.3.4".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        };
        let (pdu, _err) = options
            .process_request(rq, &NegotiationOverrides::default())
            .unwrap_err();
        assert!(matches!(pdu, Pdu::AssociationRJ(_)));
    }
}
