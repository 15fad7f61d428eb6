//! Requester (SCU) sessions.
//!
//! A [`ClientSessionOptions`] value describes the association to propose:
//! presentation contexts, extended negotiation,
//! role selection, user identity,
//! the asynchronous operations window
//! and the timing configuration.
//! [`establish`](ClientSessionOptions::establish)
//! negotiates the association over TCP
//! and yields a [`ClientSession`]
//! through which requests are sent
//! and server-initiated requests are served.
use std::borrow::Cow;
use std::sync::Arc;

use bytes::BytesMut;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::warn;

use radlink_ul::association::state::{Action, Event};
use radlink_ul::association::{Association, StateMachine};
use radlink_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, Pdu, UserIdentity, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

use crate::command::{CommandSet, Status};
use crate::config::ClientConfig;
use crate::connection::{
    AbortedSnafu, Connection, ConnectionConfig, ConnectSnafu, ConnectTimeoutSnafu, MessageSender,
    MissingAbstractSyntaxSnafu, MissingStatusSnafu, NegotiationSnafu,
    NoAcceptedPresentationContextsSnafu, ProtocolVersionMismatchSnafu, RejectedSnafu, Request,
    RequestSnafu, Result, UnexpectedPduSnafu,
};
use crate::correlator::ResponseStream;
use crate::service::{NoServices, ServiceProvider};
use crate::wire;

/// Trim trailing null padding from a UID value.
fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with('\0') {
        Cow::Owned(uid.trim_end_matches('\0').to_string())
    } else {
        uid
    }
}

/// A builder for requester sessions.
#[derive(Clone)]
pub struct ClientSessionOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// extended negotiation proposals, one per SOP class
    extended_negotiations: Vec<(Cow<'a, str>, Vec<u8>)>,
    /// role selection proposals, one per abstract syntax
    role_selections: Vec<(Cow<'a, str>, bool, bool)>,
    /// the user identity proposal
    user_identity: Option<UserIdentity>,
    /// the asynchronous operations window (invoked, performed)
    async_operations_window: Option<(u16, u16)>,
    /// the expected protocol version
    protocol_version: u16,
    /// timing and transport configuration
    config: ClientConfig,
    /// handler for server-initiated requests on this association
    provider: Arc<dyn ServiceProvider>,
}

impl Default for ClientSessionOptions<'_> {
    fn default() -> Self {
        ClientSessionOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            presentation_contexts: Vec::new(),
            extended_negotiations: Vec::new(),
            role_selections: Vec::new(),
            user_identity: None,
            async_operations_window: None,
            protocol_version: 1,
            config: ClientConfig::default(),
            provider: Arc::new(NoServices),
        }
    }
}

impl<'a> ClientSessionOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Propose extended negotiation application information
    /// for the given SOP class.
    pub fn with_extended_negotiation<T>(
        mut self,
        sop_class_uid: T,
        application_info: Vec<u8>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiations
            .push((trim_uid(sop_class_uid.into()), application_info));
        self
    }

    /// Propose SCU/SCP roles for the given abstract syntax.
    pub fn with_role_selection<T>(
        mut self,
        sop_class_uid: T,
        scu_role: bool,
        scp_role: bool,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.role_selections
            .push((trim_uid(sop_class_uid.into()), scu_role, scp_role));
        self
    }

    /// Propose a user identity to the acceptor.
    pub fn with_user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Propose an asynchronous operations window.
    pub fn with_async_operations_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_operations_window = Some((invoked, performed));
        self
    }

    /// Override the timing and transport configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler for requests the peer initiates
    /// over this association,
    /// such as storage commitment N-EVENT-REPORT pushes.
    pub fn with_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Connect to the given address
    /// and negotiate a new association.
    pub async fn establish<A>(self, address: A) -> Result<ClientSession>
    where
        A: ToSocketAddrs,
    {
        let ClientSessionOptions {
            calling_ae_title,
            called_ae_title,
            presentation_contexts,
            extended_negotiations,
            role_selections,
            user_identity,
            async_operations_window,
            protocol_version,
            config,
            provider,
        } = self;

        ensure!(
            !presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let mut association = Association::request(&*calling_ae_title, &*called_ae_title);
        association.set_max_pdu_length(config.max_pdu_length);
        for (abstract_syntax, transfer_syntaxes) in presentation_contexts {
            association
                .add_presentation_context(
                    abstract_syntax.to_string(),
                    transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
                )
                .context(NegotiationSnafu)?;
        }
        for (sop_class_uid, application_info) in extended_negotiations {
            association
                .add_extended_negotiation(sop_class_uid.to_string(), application_info)
                .context(NegotiationSnafu)?;
        }
        for (sop_class_uid, scu_role, scp_role) in role_selections {
            association.set_role_selection(&sop_class_uid, scu_role, scp_role);
        }
        if let Some(user_identity) = user_identity {
            association
                .set_user_identity(user_identity)
                .context(NegotiationSnafu)?;
        }
        if let Some((invoked, performed)) = async_operations_window {
            association.set_async_operations_window(invoked, performed);
        }

        let rq = association.to_request().context(NegotiationSnafu)?;

        let mut state = StateMachine::new();
        // infallible in the idle state
        let _ = state.handle(Event::RequestAssociation);

        let mut stream =
            match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(address))
                .await
            {
                Ok(result) => result.context(ConnectSnafu)?,
                Err(_) => return ConnectTimeoutSnafu.fail(),
            };

        let mut write_buffer: Vec<u8> = Vec::with_capacity(config.max_pdu_length as usize);
        wire::write_pdu_to_wire(
            &mut stream,
            &mut write_buffer,
            &Pdu::AssociationRQ(rq),
            config.write_timeout(),
        )
        .await?;

        let mut read_buffer =
            BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        let msg = wire::read_pdu_from_wire(
            &mut stream,
            &mut read_buffer,
            MAXIMUM_PDU_SIZE,
            config.strict,
        )
        .await?;

        match state.handle(Event::Received(&msg)) {
            Ok(Action::ConfirmEstablished) => {
                let ac = match msg {
                    Pdu::AssociationAC(ac) => ac,
                    _ => unreachable!("the state machine only confirms establishment on an AC"),
                };
                ensure!(
                    ac.protocol_version == protocol_version,
                    ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: ac.protocol_version,
                    }
                );

                association.apply_ac(&ac).context(NegotiationSnafu)?;

                if association.accepted_contexts().next().is_none() {
                    // nothing usable was negotiated: tear the connection down
                    let _ = wire::write_pdu_to_wire(
                        &mut stream,
                        &mut write_buffer,
                        &Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        },
                        config.write_timeout(),
                    )
                    .await;
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                let connection = Connection::spawn(
                    stream,
                    read_buffer,
                    association,
                    state,
                    provider,
                    ConnectionConfig {
                        max_receive_pdu: config.max_pdu_length,
                        strict: config.strict,
                        write_timeout: config.write_timeout(),
                        release_timeout: config.release_timeout(),
                        request_timeout: config.request_timeout(),
                        linger: config.linger(),
                    },
                );
                Ok(ClientSession { connection })
            }
            Ok(Action::ConfirmRejected) => {
                let association_rj = match msg {
                    Pdu::AssociationRJ(rj) => rj,
                    _ => unreachable!("the state machine only confirms rejection on an RJ"),
                };
                RejectedSnafu { association_rj }.fail()
            }
            Ok(Action::PeerAborted) => AbortedSnafu.fail(),
            Ok(_) => unreachable!("no other actions are reachable while negotiating"),
            Err(e) => {
                warn!("aborting association: {}", e);
                let _ = wire::write_pdu_to_wire(
                    &mut stream,
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                    config.write_timeout(),
                )
                .await;
                UnexpectedPduSnafu { pdu: msg }.fail()
            }
        }
    }
}

/// An established requester session.
pub struct ClientSession {
    connection: Connection,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession").finish_non_exhaustive()
    }
}

impl ClientSession {
    /// The negotiated association.
    pub fn association(&self) -> &Association {
        self.connection.association()
    }

    /// Obtain a cloneable message sender for this session.
    pub fn sender(&self) -> MessageSender {
        self.connection.sender()
    }

    /// Send a request and obtain the stream of its responses.
    ///
    /// A request for a SOP class
    /// whose presentation context was not accepted
    /// fails here without any network exchange.
    pub async fn send(&self, request: Request) -> Result<ResponseStream> {
        self.connection.send(request).await
    }

    /// Verify the association with a C-ECHO exchange,
    /// returning the response status.
    pub async fn echo(&self) -> Result<Status> {
        let mut responses = self
            .send(Request::new(CommandSet::c_echo_rq(0)))
            .await?;
        let message = responses
            .next()
            .await
            .context(AbortedSnafu)?
            .context(RequestSnafu)?;
        message.command.status().context(MissingStatusSnafu)
    }

    /// Gracefully release the association.
    pub async fn release(self) -> Result<()> {
        self.connection.release().await
    }

    /// Abort the association,
    /// failing every request still in flight.
    pub async fn abort(self) {
        self.connection.abort().await
    }

    /// Wait until the association has terminated,
    /// whether by release, abort or transport failure.
    pub async fn closed(&self) {
        self.connection.closed().await
    }
}
