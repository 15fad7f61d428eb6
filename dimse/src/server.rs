//! Acceptor (SCP) server.
//!
//! A [`DimseServer`] listens for incoming associations,
//! negotiates each proposal through the shared acceptor decision procedure
//! of the upper layer crate,
//! and drives the registered [`ServiceProvider`]
//! over every established association.
//! Each accepted connection is served on its own task;
//! the number of concurrently open associations is bounded
//! and further TCP accepts are refused until one drops.
use std::sync::Arc;

use bytes::BytesMut;
use snafu::ResultExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use radlink_ul::association::server::{
    AcceptAny, AccessControl, ServerAssociationOptions,
};
use radlink_ul::association::state::{Action, Event};
use radlink_ul::association::{Association, StateMachine};
use radlink_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, Pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};

use crate::config::ServerConfig;
use crate::connection::{
    AssociationSnafu, Connection, ConnectionConfig, ListenSnafu, NegotiationSnafu, Result,
    UnexpectedPduSnafu,
};
use crate::service::ServiceProvider;
use crate::wire;

/// A DIMSE service class provider server.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use radlink_dimse::server::DimseServer;
/// # use radlink_dimse::service::NoServices;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// DimseServer::new(Arc::new(NoServices))
///     .ae_title("ECHO-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .listen("0.0.0.0:11112")
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct DimseServer<A = AcceptAny> {
    options: ServerAssociationOptions<'static, A>,
    config: ServerConfig,
    provider: Arc<dyn ServiceProvider>,
}

impl DimseServer<AcceptAny> {
    /// Create a server driving the given service provider.
    pub fn new(provider: Arc<dyn ServiceProvider>) -> Self {
        DimseServer {
            options: ServerAssociationOptions::new(),
            config: ServerConfig::default(),
            provider,
        }
    }
}

impl<A> DimseServer<A>
where
    A: AccessControl + Send + Sync + 'static,
{
    /// Define the application entity title of this node.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.options = self.options.ae_title(ae_title.into());
        self
    }

    /// Include this abstract syntax
    /// in the list of abstract syntaxes to accept.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.options = self.options.with_abstract_syntax(abstract_syntax_uid.into());
        self
    }

    /// Include this transfer syntax
    /// in each accepted presentation context.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.options = self.options.with_transfer_syntax(transfer_syntax_uid.into());
        self
    }

    /// Accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.options = self.options.promiscuous(promiscuous);
        self
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> DimseServer<P>
    where
        P: AccessControl,
    {
        DimseServer {
            options: self.options.ae_access_control(access_control),
            config: self.config,
            provider: self.provider,
        }
    }

    /// Override the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.options = self
            .options
            .max_pdu_length(config.max_pdu_length)
            .strict(config.strict);
        self.config = config;
        self
    }

    /// Bind to the given address and serve associations indefinitely.
    pub async fn listen<T>(self, address: T) -> Result<()>
    where
        T: ToSocketAddrs,
    {
        let listener = TcpListener::bind(address).await.context(ListenSnafu)?;
        self.serve(listener).await
    }

    /// Serve associations from an existing listener indefinitely.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!("listening on tcp://{}", address);
        }
        let semaphore = Arc::new(Semaphore::new(self.config.max_clients));
        let this = Arc::new(self);

        loop {
            let (socket, peer) = listener.accept().await.context(ListenSnafu)?;
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(socket).await {
                            debug!("association with {} ended in error: {}", peer, e);
                        }
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(
                        "refusing connection from {}: client limit of {} reached",
                        peer, this.config.max_clients
                    );
                    drop(socket);
                }
            }
        }
    }

    /// Negotiate one incoming association and serve it until it ends.
    async fn handle_connection(self: Arc<Self>, mut socket: TcpStream) -> Result<()> {
        let mut read_buffer =
            BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        let mut write_buffer: Vec<u8> =
            Vec::with_capacity(self.config.max_pdu_length as usize);
        let write_timeout = self.config.write_timeout();

        let msg = wire::read_pdu_from_wire(
            &mut socket,
            &mut read_buffer,
            MAXIMUM_PDU_SIZE,
            self.config.strict,
        )
        .await?;

        let mut state = StateMachine::new();
        if state.handle(Event::Received(&msg)).is_err() {
            // answer a stray release politely, abort anything else
            let reply = match &msg {
                Pdu::ReleaseRQ => Pdu::ReleaseRP,
                Pdu::Unknown { .. } => Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnrecognizedPdu,
                    ),
                },
                _ => Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                },
            };
            let _ = wire::write_pdu_to_wire(&mut socket, &mut write_buffer, &reply, write_timeout)
                .await;
            return UnexpectedPduSnafu { pdu: msg }.fail();
        }

        let rq = match msg {
            Pdu::AssociationRQ(rq) => rq,
            _ => unreachable!("the state machine validated the PDU type"),
        };

        // give the provider a look at the proposal
        // so it can answer extended negotiation and user identity items
        let overrides = match Association::from_request(&rq) {
            Ok(proposal) => self.provider.negotiation_overrides(&proposal),
            Err(e) => {
                let _ = wire::write_pdu_to_wire(
                    &mut socket,
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::InvalidPduParameter,
                        ),
                    },
                    write_timeout,
                )
                .await;
                return Err(e).context(NegotiationSnafu);
            }
        };

        match self.options.process_request(rq, &overrides) {
            Ok((pdu, association)) => {
                let _ = state.handle(Event::Accept);
                wire::write_pdu_to_wire(&mut socket, &mut write_buffer, &pdu, write_timeout)
                    .await?;
                debug!(
                    "association established with {}",
                    association.calling_ae_title()
                );

                let connection = Connection::spawn(
                    socket,
                    read_buffer,
                    association,
                    state,
                    self.provider.clone(),
                    ConnectionConfig {
                        max_receive_pdu: self.config.max_pdu_length,
                        strict: self.config.strict,
                        write_timeout,
                        release_timeout: self.config.write_timeout(),
                        request_timeout: None,
                        linger: None,
                    },
                );
                connection.closed().await;
                Ok(())
            }
            Err((pdu, err)) => {
                let _ = state.handle(Event::Reject);
                let _ =
                    wire::write_pdu_to_wire(&mut socket, &mut write_buffer, &pdu, write_timeout)
                        .await;
                Err(err).context(AssociationSnafu)
            }
        }
    }
}
