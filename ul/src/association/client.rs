//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use std::{
    borrow::Cow,
    convert::TryFrom,
    io::Write,
    net::{TcpStream, ToSocketAddrs},
};

use bytes::BytesMut;
use snafu::{ensure, ResultExt};
use tracing::warn;

use crate::{
    association::{
        model::Association,
        state::{Action, Event, StateMachine},
        trim_uid, AbortedSnafu, ConnectSnafu, MissingAbstractSyntaxSnafu, NegotiationSnafu,
        NoAcceptedPresentationContextsSnafu, ProtocolVersionMismatchSnafu, RejectedSnafu, Result,
        SendPduSnafu, SendTooLongPduSnafu, SetReadTimeoutSnafu, SetWriteTimeoutSnafu,
        SocketOptions, UnexpectedPduSnafu, UnknownPduSnafu, WireSendSnafu,
    },
    pdu::{
        write_pdu, AbortRQServiceProviderReason, AbortRQSource, Pdu, UserIdentity,
        DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
    },
    AeAddr,
};

use super::pdata::{PDataReader, PDataWriter};

/// Options for requesting an association as the client node,
/// culminating in a [`ClientAssociation`].
///
/// This is the standard way of reaching another DICOM node,
/// usually one taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use radlink_ul::association::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("10.0.0.34:11112")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// or the helper [`with_abstract_syntax`](Self::with_abstract_syntax),
/// which proposes the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
///
/// Further negotiation items are available for service classes
/// which require them:
/// extended negotiation application information
/// ([`with_extended_negotiation`](Self::with_extended_negotiation)),
/// SCU/SCP role selection
/// ([`with_role_selection`](Self::with_role_selection)),
/// a user identity proposal
/// ([`with_user_identity`](Self::with_user_identity)),
/// and the asynchronous operations window
/// ([`with_async_operations_window`](Self::with_async_operations_window)).
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title, if provided apart from the address
    called_ae_title: Option<Cow<'a, str>>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// extended negotiation proposals, one per SOP class
    extended_negotiations: Vec<(Cow<'a, str>, Vec<u8>)>,
    /// common extended negotiation proposals
    common_extended_negotiations: Vec<(Cow<'a, str>, Cow<'a, str>, Vec<String>)>,
    /// role selection proposals, one per abstract syntax
    role_selections: Vec<(Cow<'a, str>, bool, bool)>,
    /// the user identity proposal
    user_identity: Option<UserIdentity>,
    /// the asynchronous operations window (invoked, performed)
    async_operations_window: Option<(u16, u16)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// options for the underlying TCP socket
    socket_options: SocketOptions,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            presentation_contexts: Vec::new(),
            extended_negotiations: Vec::new(),
            common_extended_negotiations: Vec::new(),
            role_selections: Vec::new(),
            user_identity: None,
            async_operations_window: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            socket_options: SocketOptions::default(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AE title under which this node presents itself.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Set the AE title of the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// An empty string resets the title to the default
    /// (or to the one carried by the address passed to
    /// [`establish_with`](Self::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = Some(called_ae_title.into()).filter(|aet| !aet.is_empty());
        self
    }

    /// Add a presentation context to propose,
    /// with the given abstract syntax
    /// and a non-empty list of candidate transfer syntaxes.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes = transfer_syntax_uids
            .into_iter()
            .map(|ts| trim_uid(ts.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Add a presentation context for the given abstract syntax,
    /// proposing the default transfer syntaxes
    /// (_Explicit_ and _Implicit VR Little Endian_).
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let defaults: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), defaults)
    }

    /// Propose extended negotiation application information
    /// for the given SOP class.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, application_info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiations
            .push((trim_uid(sop_class_uid.into()), application_info));
        self
    }

    /// Propose common extended negotiation information
    /// for the given SOP class.
    pub fn with_common_extended_negotiation<T>(
        mut self,
        sop_class_uid: T,
        service_class_uid: T,
        related_general_sop_classes: Vec<String>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.common_extended_negotiations.push((
            trim_uid(sop_class_uid.into()),
            trim_uid(service_class_uid.into()),
            related_general_sop_classes,
        ));
        self
    }

    /// Propose SCU/SCP roles for the given abstract syntax.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu_role: bool, scp_role: bool) -> Self
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

    /// Set the timeout for establishing the TCP connection.
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.connection_timeout = Some(timeout);
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        self.establish_impl(AeAddr::new_socket_addr(address))
    }

    /// Initiate the TCP connection to the given compound address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// The address may carry the called AE title
    /// with the syntax `AE-TITLE@host:port`
    /// (see [`AeAddr`](crate::AeAddr)),
    /// although any `called_ae_title` option set beforehand
    /// takes precedence.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use radlink_ul::association::ClientAssociationOptions;
    /// # fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let association = ClientAssociationOptions::new()
    ///     .with_abstract_syntax("1.2.840.10008.1.1")
    ///     .establish_with("MY-STORAGE@10.0.0.100:104")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation> {
        match AeAddr::try_from(ae_address) {
            Ok(addr) => self.establish_impl(addr),
            // not a compound address: treat it as a plain socket address
            Err(_) => self.establish_impl(AeAddr::new_socket_addr(ae_address)),
        }
    }

    fn establish_impl<T>(self, ae_address: AeAddr<T>) -> Result<ClientAssociation>
    where
        T: ToSocketAddrs,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            presentation_contexts,
            extended_negotiations,
            common_extended_negotiations,
            role_selections,
            user_identity,
            async_operations_window,
            protocol_version,
            max_pdu_length,
            strict,
            socket_options,
        } = self;

        // presentation contexts represent intent;
        // their absence cannot be meaningfully negotiated
        ensure!(
            !presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        // the `called_ae_title` option beats the one in the address
        let called_ae_title: &str = match (&called_ae_title, ae_address.ae_title()) {
            (Some(aet), addr_aet) => {
                if addr_aet.is_some() {
                    warn!("Option `called_ae_title` overrides the AE title to `{}`", aet);
                }
                aet
            }
            (None, Some(aet)) => aet,
            (None, None) => "ANY-SCP",
        };

        let mut association = Association::request(&*calling_ae_title, called_ae_title);
        association.set_max_pdu_length(max_pdu_length);
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
        for (sop_class_uid, service_class_uid, related) in common_extended_negotiations {
            association.add_common_extended_negotiation(
                sop_class_uid.to_string(),
                service_class_uid.to_string(),
                related,
            );
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
        // infallible in Idle
        let _ = state.handle(Event::RequestAssociation);

        let mut socket = match socket_options.connection_timeout {
            Some(timeout) => {
                let addresses = ae_address.to_socket_addrs().context(ConnectSnafu)?;
                let mut outcome = Err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "the address resolved to nothing",
                ));
                for address in addresses {
                    outcome = TcpStream::connect_timeout(&address, timeout);
                    if outcome.is_ok() {
                        break;
                    }
                }
                outcome.context(ConnectSnafu)?
            }
            None => TcpStream::connect(ae_address).context(ConnectSnafu)?,
        };
        socket
            .set_read_timeout(socket_options.read_timeout)
            .context(SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(socket_options.write_timeout)
            .context(SetWriteTimeoutSnafu)?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);
        write_pdu(&mut write_buffer, &Pdu::AssociationRQ(rq)).context(SendPduSnafu)?;
        socket.write_all(&write_buffer).context(WireSendSnafu)?;
        write_buffer.clear();

        let mut read_buffer = BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        let msg =
            super::read_pdu_from_wire(&mut socket, &mut read_buffer, MAXIMUM_PDU_SIZE, strict)?;

        match state.handle(Event::Received(&msg)) {
            Ok(Action::ConfirmEstablished) => {
                let ac = match msg {
                    Pdu::AssociationAC(ac) => ac,
                    _ => unreachable!("state machine only confirms establishment on an AC"),
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
                    // no contexts are usable, so the association
                    // serves no purpose: tear it down
                    let _ = write_pdu(
                        &mut write_buffer,
                        &Pdu::AbortRQ {
                            source: AbortRQSource::ServiceUser,
                        },
                    );
                    let _ = socket.write_all(&write_buffer);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                Ok(ClientAssociation {
                    association,
                    state,
                    socket,
                    read_buffer,
                    write_buffer,
                    strict,
                })
            }
            Ok(Action::ConfirmRejected) => {
                let association_rj = match msg {
                    Pdu::AssociationRJ(rj) => rj,
                    _ => unreachable!("state machine only confirms rejection on an RJ"),
                };
                RejectedSnafu { association_rj }.fail()
            }
            Ok(Action::PeerAborted) => AbortedSnafu.fail(),
            Ok(_) => unreachable!("no other actions are reachable while negotiating"),
            Err(_) => {
                // illegal PDU for this state: abort the association
                let _ = write_pdu(
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                );
                let _ = socket.write_all(&write_buffer);
                match msg {
                    pdu @ Pdu::Unknown { .. } => UnknownPduSnafu { pdu }.fail(),
                    pdu => UnexpectedPduSnafu { pdu }.fail(),
                }
            }
        }
    }
}

/// An established association in which this node is the requester.
///
/// PDUs are exchanged through [`send`](Self::send)
/// and [`receive`](Self::receive);
/// large data sets are better sent through the P-Data writer
/// obtained from [`send_pdata`](Self::send_pdata).
///
/// Dropping the value attempts a graceful release exchange
/// before shutting down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation {
    /// The negotiated association
    association: Association,
    /// The association lifecycle state
    state: StateMachine,
    /// The TCP stream to the other DICOM node
    socket: TcpStream,
    /// Buffer for incoming bytes not yet decoded into a PDU
    read_buffer: BytesMut,
    /// Reusable buffer to assemble PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
}

impl ClientAssociation {
    /// Obtain a view of the negotiated association.
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Retrieve the maximum PDU length to apply
    /// when sending PDUs to the peer.
    pub fn send_max_pdu_length(&self) -> u32 {
        self.association.send_max_pdu_length()
    }

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    pub fn receive_max_pdu_length(&self) -> u32 {
        self.association.max_pdu_length()
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
                let _ = self.socket.shutdown(std::net::Shutdown::Both);
                match pdu {
                    pdu @ Pdu::Unknown { .. } => UnknownPduSnafu { pdu }.fail(),
                    pdu => UnexpectedPduSnafu { pdu }.fail(),
                }
            }
        }
    }

    /// Gracefully terminate the association by exchanging release messages
    /// and then shutting down the TCP connection.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let _ = self.state.handle(Event::Abort);
        let out = self.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }

    /// Borrow the inner TCP stream directly,
    /// for sending a PDU in semantic fragments of the message
    /// without assembling it in memory first.
    ///
    /// Reading and writing must respect PDU boundaries,
    /// otherwise the association state becomes inconsistent;
    /// do not interleave with `send` or `receive`.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Prepare a writer of one logical stream of data,
    /// automatically split into separate P-Data PDUs
    /// sized against the peer's maximum PDU length.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut TcpStream> {
        let max_pdu_length = self.send_max_pdu_length();
        PDataWriter::new(&mut self.socket, presentation_context_id, max_pdu_length)
    }

    /// Prepare a reader of one logical stream of data,
    /// pulling more P-Data PDUs from the peer
    /// as the collected bytes are consumed.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut TcpStream> {
        PDataReader::new(
            &mut self.socket,
            &mut self.read_buffer,
            self.association.max_pdu_length(),
        )
    }

    /// Release implementation function,
    /// which tries to send a release request and receive a release response.
    /// This is in a separate private function because
    /// terminating a connection should still close the connection
    /// if the exchange fails.
    fn release_impl(&mut self) -> Result<()> {
        if self.state.handle(Event::RequestRelease).is_err() {
            // not in a state which permits a release exchange
            return Ok(());
        }
        self.send(&Pdu::ReleaseRQ)?;
        loop {
            let pdu = super::read_pdu_from_wire(
                &mut self.socket,
                &mut self.read_buffer,
                self.association.max_pdu_length(),
                self.strict,
            )?;
            match self.state.handle(Event::Received(&pdu)) {
                Ok(Action::ConfirmReleased) => return Ok(()),
                Ok(Action::SendReleaseRp) => {
                    // release collision
                    self.send(&Pdu::ReleaseRP)?;
                }
                Ok(Action::DispatchPData) => {
                    warn!("Discarding P-DATA received while releasing the association");
                }
                Ok(Action::PeerAborted) => return AbortedSnafu.fail(),
                Ok(_) => unreachable!("no other actions are reachable while releasing"),
                Err(_) => {
                    return match pdu {
                        pdu @ Pdu::Unknown { .. } => UnknownPduSnafu { pdu }.fail(),
                        pdu => UnexpectedPduSnafu { pdu }.fail(),
                    };
                }
            }
        }
    }
}

/// Automatically release the association and shut down the connection.
impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if !self.state.is_terminated() {
            let _ = self.release_impl();
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
