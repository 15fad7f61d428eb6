//! The per-association connection shell.
//!
//! A [`Connection`] owns exactly one duplex transport stream.
//! A single sequential read-loop task decodes PDUs,
//! validates them against the association state machine,
//! reassembles P-DATA into complete DIMSE messages
//! and routes them through the correlator:
//! responses go to their pending requests,
//! inbound requests are dispatched to the registered service provider.
//! Writes are serialized through a dedicated writer task
//! fed by a channel,
//! so that the PDU sequences of logically concurrent sends
//! never interleave on the wire.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use radlink_ul::association::state::{Action, Event};
use radlink_ul::association::{Association, StateMachine};
use radlink_ul::pdu::{
    write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu,
    DEFAULT_MAX_PDU,
};

use crate::command::CommandSet;
use crate::correlator::{Correlator, Inbound, RequestError, ResponseStream};
use crate::framer::{self, PushOutcome, Reassembler};
use crate::message::Message;
use crate::service::{self, ProviderContext, ServiceProvider};
use crate::wire;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// timed out connecting to peer
    ConnectTimeout { backtrace: Backtrace },

    /// failed to listen for incoming connections
    Listen {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode an outgoing PDU
    SendPdu {
        #[snafu(backtrace)]
        source: radlink_ul::pdu::writer::Error,
    },

    /// failed to decode an incoming PDU
    ReceivePdu {
        #[snafu(backtrace)]
        source: radlink_ul::pdu::reader::Error,
    },

    /// transport failure
    Wire {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// timed out writing to the transport
    WriteTimeout { backtrace: Backtrace },

    /// connection closed by peer before a full PDU was received
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("association rejected by the peer: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// association aborted
    Aborted { backtrace: Backtrace },

    #[snafu(display("unexpected PDU from peer `{:?}`", pdu))]
    #[non_exhaustive]
    UnexpectedPdu { pdu: Box<Pdu> },

    /// invalid association negotiation
    #[snafu(display("invalid association negotiation: {}", source))]
    Negotiation {
        source: radlink_ul::association::model::Error,
    },

    /// association layer error
    Association {
        #[snafu(backtrace)]
        source: radlink_ul::association::Error,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// the command set carries no SOP class UID
    MissingSopClassUid { backtrace: Backtrace },

    #[snafu(display(
        "no accepted presentation context for SOP class {}",
        sop_class_uid
    ))]
    SopClassNotSupported {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context {} was not accepted", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// invalid command set
    Command { source: crate::command::Error },

    /// could not serialize the data set
    SerializeDataset { source: dicom_object::WriteError },

    #[snafu(display("transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// the response carried no status field
    MissingStatus { backtrace: Backtrace },

    /// the peer did not confirm the release in time
    ReleaseTimeout { backtrace: Backtrace },

    /// the request failed before completion
    #[snafu(display("request failed: {}", source))]
    Request { source: RequestError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Timing and transport parameters of one connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    /// the maximum PDU length admitted when receiving
    pub max_receive_pdu: u32,
    /// whether received PDUs may not surpass the maximum PDU length
    pub strict: bool,
    /// bound on each socket write
    pub write_timeout: Duration,
    /// how long to await the peer's release confirmation
    pub release_timeout: Duration,
    /// default deadline applied to each request
    pub request_timeout: Option<Duration>,
    /// idle period after which the connection releases itself
    /// (requester side only)
    pub linger: Option<Duration>,
}

/// One DIMSE request about to be sent:
/// a command set, an optional data set,
/// and per-request timeout and cancellation controls.
#[derive(Debug)]
pub struct Request {
    command: CommandSet,
    dataset: Option<InMemDicomObject>,
    timeout: Option<Duration>,
    token: Option<CancellationToken>,
}

impl Request {
    pub fn new(command: CommandSet) -> Self {
        Request {
            command,
            dataset: None,
            timeout: None,
            token: None,
        }
    }

    /// Attach a data set to the request.
    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Set a deadline for this request,
    /// overriding the connection's default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token;
    /// cancelling it retires the request
    /// without affecting the association.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// A handle for sending DIMSE messages on one established association.
///
/// Cloneable and cheap to share;
/// all clones feed the same serialized writer.
#[derive(Clone)]
pub struct MessageSender {
    association: Arc<Association>,
    correlator: Arc<Mutex<Correlator>>,
    writer_tx: mpsc::Sender<Vec<Pdu>>,
    shutdown: CancellationToken,
    request_timeout: Option<Duration>,
    last_activity: Arc<Mutex<Instant>>,
}

impl MessageSender {
    /// The negotiated association this sender operates on.
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Send a request and obtain the stream of its responses.
    ///
    /// The presentation context is chosen
    /// by the SOP class UID of the command set;
    /// a SOP class without an accepted context
    /// fails here without any network exchange.
    pub async fn send_request(&self, request: Request) -> Result<ResponseStream> {
        let Request {
            mut command,
            dataset,
            timeout,
            token,
        } = request;

        let sop_class_uid = command.sop_class_uid().context(MissingSopClassUidSnafu)?;
        let context = self
            .association
            .context_for_abstract_syntax(&sop_class_uid)
            .context(SopClassNotSupportedSnafu {
                sop_class_uid: sop_class_uid.clone(),
            })?;
        let presentation_context_id = context.id();
        let transfer_syntax = context
            .accepted_transfer_syntax()
            .unwrap_or_default()
            .to_string();

        let command_field = command.command_field().context(CommandSnafu)?;
        let deadline = timeout
            .or(self.request_timeout)
            .map(|t| Instant::now() + t);
        let (message_id, rx) = lock(&self.correlator).register(command_field, deadline);
        command.set_message_id(message_id);

        let payload = match &dataset {
            Some(obj) => Some(serialize_dataset(obj, &transfer_syntax)?),
            None => None,
        };
        command.set_has_dataset(payload.is_some());
        let command_bytes = match command.encode().context(CommandSnafu) {
            Ok(bytes) => bytes,
            Err(e) => {
                lock(&self.correlator).cancel(message_id);
                return Err(e);
            }
        };

        let pdus = framer::fragment(
            presentation_context_id,
            &command_bytes,
            payload.as_deref(),
            self.association.send_max_pdu_length(),
        );
        if self.writer_tx.send(pdus).await.is_err() {
            lock(&self.correlator).cancel(message_id);
            return ConnectionClosedSnafu.fail();
        }
        *lock(&self.last_activity) = Instant::now();

        if let Some(token) = token {
            let correlator = self.correlator.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = token.cancelled() => {
                        lock(&correlator).cancel(message_id);
                    }
                }
            });
        }

        Ok(ResponseStream::new(
            message_id,
            rx,
            Arc::downgrade(&self.correlator),
        ))
    }

    /// Send a response message on the given presentation context.
    pub async fn send_response(
        &self,
        presentation_context_id: u8,
        mut command: CommandSet,
        dataset: Option<&InMemDicomObject>,
    ) -> Result<()> {
        let context = self
            .association
            .presentation_context(presentation_context_id)
            .filter(|pc| pc.is_accepted())
            .context(UnknownPresentationContextSnafu {
                id: presentation_context_id,
            })?;
        let transfer_syntax = context
            .accepted_transfer_syntax()
            .unwrap_or_default()
            .to_string();

        let payload = match dataset {
            Some(obj) => Some(serialize_dataset(obj, &transfer_syntax)?),
            None => None,
        };
        command.set_has_dataset(payload.is_some());
        let command_bytes = command.encode().context(CommandSnafu)?;

        let pdus = framer::fragment(
            presentation_context_id,
            &command_bytes,
            payload.as_deref(),
            self.association.send_max_pdu_length(),
        );
        if self.writer_tx.send(pdus).await.is_err() {
            return ConnectionClosedSnafu.fail();
        }
        *lock(&self.last_activity) = Instant::now();
        Ok(())
    }
}

fn serialize_dataset(obj: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    let mut out = Vec::new();
    obj.write_dataset_with_ts(&mut out, ts)
        .context(SerializeDatasetSnafu)?;
    Ok(out)
}

/// An established association with its connection tasks.
///
/// Dropping the value does not tear the connection down by itself;
/// use [`release`](Self::release) or [`abort`](Self::abort).
pub struct Connection {
    association: Arc<Association>,
    sender: MessageSender,
    state: Arc<Mutex<StateMachine>>,
    correlator: Arc<Mutex<Correlator>>,
    writer_tx: mpsc::Sender<Vec<Pdu>>,
    shutdown: CancellationToken,
    release_timeout: Duration,
}

impl Connection {
    /// Take ownership of an established transport stream
    /// and spawn the connection tasks.
    pub(crate) fn spawn<S>(
        stream: S,
        read_buffer: BytesMut,
        association: Association,
        state: StateMachine,
        provider: Arc<dyn ServiceProvider>,
        config: ConnectionConfig,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let association = Arc::new(association);
        let state = Arc::new(Mutex::new(state));
        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let (writer_tx, writer_rx) = mpsc::channel::<Vec<Pdu>>(16);
        let shutdown = CancellationToken::new();
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let sender = MessageSender {
            association: association.clone(),
            correlator: correlator.clone(),
            writer_tx: writer_tx.clone(),
            shutdown: shutdown.clone(),
            request_timeout: config.request_timeout,
            last_activity: last_activity.clone(),
        };

        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(run_writer(
            writer_rx,
            writer,
            config.write_timeout,
            shutdown.clone(),
        ));
        tokio::spawn(run_read_loop(ReadLoop {
            reader,
            read_buffer,
            association: association.clone(),
            state: state.clone(),
            correlator: correlator.clone(),
            writer_tx: writer_tx.clone(),
            provider,
            sender: sender.clone(),
            shutdown: shutdown.clone(),
            last_activity: last_activity.clone(),
            max_receive_pdu: config.max_receive_pdu,
            strict: config.strict,
        }));
        tokio::spawn(run_deadline_sweeper(
            correlator.clone(),
            shutdown.clone(),
        ));
        if let Some(linger) = config.linger {
            tokio::spawn(run_linger(
                linger,
                state.clone(),
                correlator.clone(),
                writer_tx.clone(),
                shutdown.clone(),
                last_activity,
                config.release_timeout,
            ));
        }

        Connection {
            association,
            sender,
            state,
            correlator,
            writer_tx,
            shutdown,
            release_timeout: config.release_timeout,
        }
    }

    /// The negotiated association.
    pub fn association(&self) -> &Association {
        &self.association
    }

    /// Obtain a cloneable message sender for this connection.
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Send a request and obtain the stream of its responses.
    pub async fn send(&self, request: Request) -> Result<ResponseStream> {
        self.sender.send_request(request).await
    }

    /// Gracefully release the association
    /// and wait for the peer's confirmation.
    pub async fn release(&self) -> Result<()> {
        release_connection(
            &self.state,
            &self.writer_tx,
            &self.shutdown,
            self.release_timeout,
        )
        .await
    }

    /// Abort the association:
    /// every pending request fails
    /// and the connection is torn down.
    pub async fn abort(&self) {
        let _ = lock(&self.state).handle(Event::Abort);
        let _ = self
            .writer_tx
            .send(vec![Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            }])
            .await;
        lock(&self.correlator).fail_all(RequestError::Aborted);
        self.shutdown.cancel();
    }

    /// Wait until the connection has fully terminated.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Request a graceful release and await the peer's confirmation,
/// aborting if the confirmation does not arrive in time.
pub(crate) async fn release_connection(
    state: &Arc<Mutex<StateMachine>>,
    writer_tx: &mpsc::Sender<Vec<Pdu>>,
    shutdown: &CancellationToken,
    release_timeout: Duration,
) -> Result<()> {
    if lock(state).handle(Event::RequestRelease).is_err() {
        // not in a state which permits a release exchange
        return Ok(());
    }
    if writer_tx.send(vec![Pdu::ReleaseRQ]).await.is_err() {
        return ConnectionClosedSnafu.fail();
    }
    match tokio::time::timeout(release_timeout, shutdown.cancelled()).await {
        Ok(()) => Ok(()),
        Err(_) => {
            warn!("peer did not confirm the association release; aborting");
            let _ = lock(state).handle(Event::Abort);
            let _ = writer_tx
                .send(vec![Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                }])
                .await;
            shutdown.cancel();
            ReleaseTimeoutSnafu.fail()
        }
    }
}

struct ReadLoop<R> {
    reader: R,
    read_buffer: BytesMut,
    association: Arc<Association>,
    state: Arc<Mutex<StateMachine>>,
    correlator: Arc<Mutex<Correlator>>,
    writer_tx: mpsc::Sender<Vec<Pdu>>,
    provider: Arc<dyn ServiceProvider>,
    sender: MessageSender,
    shutdown: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
    max_receive_pdu: u32,
    strict: bool,
}

async fn run_read_loop<R>(mut ctx: ReadLoop<R>)
where
    R: AsyncRead + Unpin,
{
    let mut reassembler = Reassembler::for_association(&ctx.association);

    loop {
        let result = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            r = wire::read_pdu_from_wire(
                &mut ctx.reader,
                &mut ctx.read_buffer,
                ctx.max_receive_pdu,
                ctx.strict,
            ) => r,
        };

        let pdu = match result {
            Ok(pdu) => pdu,
            Err(e @ Error::ReceivePdu { .. }) => {
                // malformed bytes are fatal to the connection, not the process
                warn!("aborting association on decode failure: {}", e);
                let _ = lock(&ctx.state).handle(Event::Abort);
                let _ = ctx
                    .writer_tx
                    .send(vec![Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::InvalidPduParameter,
                        ),
                    }])
                    .await;
                fail_pending(&ctx.correlator, &e);
                break;
            }
            Err(e) => {
                let _ = lock(&ctx.state).handle(Event::TransportError);
                fail_pending(&ctx.correlator, &e);
                break;
            }
        };

        *lock(&ctx.last_activity) = Instant::now();
        trace!("received {}", pdu.short_description());

        let action = lock(&ctx.state).handle(Event::Received(&pdu));
        match action {
            Ok(Action::DispatchPData) => {
                let data = match pdu {
                    Pdu::PData { data } => data,
                    _ => continue,
                };
                let mut violated = false;
                for pdv in data {
                    match reassembler.push(pdv) {
                        Ok(PushOutcome::Incomplete) => {}
                        Ok(PushOutcome::CommandComplete {
                            presentation_context_id,
                        }) => {
                            if let Some(command) =
                                reassembler.command_for(presentation_context_id)
                            {
                                if let Some(sink) = ctx.provider.dataset_sink(command) {
                                    if let Err(e) =
                                        reassembler.divert(presentation_context_id, sink)
                                    {
                                        warn!("could not divert data set: {}", e);
                                        violated = true;
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(PushOutcome::Message(message)) => {
                            if !route_message(&ctx, message) {
                                violated = true;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("aborting association on reassembly failure: {}", e);
                            violated = true;
                            break;
                        }
                    }
                }
                if violated {
                    let _ = lock(&ctx.state).handle(Event::Abort);
                    let _ = ctx
                        .writer_tx
                        .send(vec![Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::InvalidPduParameter,
                            ),
                        }])
                        .await;
                    lock(&ctx.correlator).fail_all(RequestError::Aborted);
                    break;
                }
            }
            Ok(Action::SendReleaseRp) => {
                let _ = ctx.writer_tx.send(vec![Pdu::ReleaseRP]).await;
            }
            Ok(Action::ConfirmReleased) => {
                debug!("association released");
                break;
            }
            Ok(Action::PeerAborted) => {
                debug!("association aborted by the peer");
                lock(&ctx.correlator).fail_all(RequestError::Aborted);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("aborting association: {}", e);
                let reason = match e {
                    radlink_ul::association::state::Error::UnrecognizedPdu { .. } => {
                        AbortRQServiceProviderReason::UnrecognizedPdu
                    }
                    _ => AbortRQServiceProviderReason::UnexpectedPdu,
                };
                let _ = ctx
                    .writer_tx
                    .send(vec![Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(reason),
                    }])
                    .await;
                lock(&ctx.correlator).fail_all(RequestError::Aborted);
                break;
            }
        }

        if lock(&ctx.state).is_terminated() {
            break;
        }
    }

    ctx.shutdown.cancel();
    lock(&ctx.correlator).fail_all(RequestError::Aborted);
}

fn fail_pending(correlator: &Arc<Mutex<Correlator>>, error: &Error) {
    lock(correlator).fail_all(RequestError::Transport {
        message: error.to_string(),
    });
}

/// Route one complete inbound message.
///
/// Returns `false` on a protocol violation
/// that must abort the association.
fn route_message<R>(ctx: &ReadLoop<R>, message: Message) -> bool {
    match lock(&ctx.correlator).dispatch(message) {
        Ok(Inbound::Delivered) => true,
        Ok(Inbound::Unmatched(message)) => {
            // a stray response is dropped rather than aborting the association
            warn!(
                "discarding response to unknown message ID {:?}",
                message.command.message_id_being_responded_to().ok()
            );
            true
        }
        Ok(Inbound::Request(message)) => {
            let provider = ctx.provider.clone();
            let provider_ctx = ProviderContext {
                association: ctx.association.clone(),
                presentation_context_id: message.presentation_context_id,
                requester: ctx.sender.clone(),
            };
            tokio::spawn(async move {
                service::run_provider(provider, provider_ctx, message).await;
            });
            true
        }
        Err(e) => {
            warn!("invalid inbound command set: {}", e);
            false
        }
    }
}

async fn run_writer<W>(
    mut rx: mpsc::Receiver<Vec<Pdu>>,
    mut writer: W,
    write_timeout: Duration,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => {
                // flush messages already queued, e.g. a final abort
                while let Ok(batch) = rx.try_recv() {
                    if write_batch(&mut writer, &mut buffer, &batch, write_timeout)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                break;
            }
            item = rx.recv() => match item {
                Some(batch) => batch,
                None => break,
            },
        };
        if write_batch(&mut writer, &mut buffer, &batch, write_timeout)
            .await
            .is_err()
        {
            shutdown.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_batch<W>(
    writer: &mut W,
    buffer: &mut Vec<u8>,
    batch: &[Pdu],
    write_timeout: Duration,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    for pdu in batch {
        buffer.clear();
        if let Err(e) = write_pdu(buffer, pdu) {
            warn!("failed to encode outgoing PDU: {}", e);
            return Err(());
        }
        match tokio::time::timeout(write_timeout, writer.write_all(buffer)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("transport write failed: {}", e);
                return Err(());
            }
            Err(_) => {
                warn!("transport write timed out");
                return Err(());
            }
        }
    }
    Ok(())
}

/// Periodically expire pending requests whose deadline has passed.
async fn run_deadline_sweeper(
    correlator: Arc<Mutex<Correlator>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                lock(&correlator).sweep(Instant::now());
            }
        }
    }
}

/// Release the association after a configurable idle period
/// with no requests in flight.
async fn run_linger(
    linger: Duration,
    state: Arc<Mutex<StateMachine>>,
    correlator: Arc<Mutex<Correlator>>,
    writer_tx: mpsc::Sender<Vec<Pdu>>,
    shutdown: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
    release_timeout: Duration,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let idle = lock(&correlator).is_idle();
        let last = *lock(&last_activity);
        if idle && last.elapsed() >= linger {
            debug!("releasing association after {:?} idle", linger);
            let _ = release_connection(&state, &writer_tx, &shutdown, release_timeout).await;
            return;
        }
    }
}
