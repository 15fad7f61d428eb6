//! DIMSE service providers.
//!
//! Higher-level services (C-ECHO, C-FIND, C-STORE, C-GET, C-MOVE, N-*)
//! register as a [`ServiceProvider`]:
//! when a complete inbound request arrives on an established association,
//! the connection dispatches it to the method
//! matching its command field.
//! Multi-response operations return a lazy stream of responses
//! which the connection frames and sends one at a time,
//! preserving order.
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

use radlink_ul::association::server::NegotiationOverrides;
use radlink_ul::association::Association;

use crate::command::{CommandField, CommandSet, Status};
use crate::connection::MessageSender;
use crate::message::Message;

/// One response to an inbound DIMSE request.
#[derive(Debug)]
pub struct Response {
    pub command: CommandSet,
    pub dataset: Option<InMemDicomObject>,
}

impl Response {
    pub fn new(command: CommandSet) -> Self {
        Response {
            command,
            dataset: None,
        }
    }

    pub fn with_dataset(command: CommandSet, dataset: InMemDicomObject) -> Self {
        Response {
            command,
            dataset: Some(dataset),
        }
    }
}

/// A lazy sequence of responses,
/// consumed by the connection one item at a time.
pub type Responses = BoxStream<'static, Response>;

/// A sequence of exactly one response.
pub fn single(response: Response) -> Responses {
    stream::iter([response]).boxed()
}

/// An empty response sequence,
/// for requests that must not be answered
/// (e.g. C-CANCEL).
pub fn none() -> Responses {
    stream::empty().boxed()
}

/// Answer a request with a status and nothing else.
fn status_only(request: &Message, status: Status) -> Responses {
    match CommandSet::response_to(&request.command, status) {
        Ok(command) => single(Response::new(command)),
        Err(e) => {
            warn!("cannot answer inbound request: {}", e);
            none()
        }
    }
}

/// What an inbound request handler gets to work with:
/// the negotiated association,
/// the presentation context the request arrived on,
/// and a sender for issuing requests of its own
/// over the same association
/// (e.g. storage commitment N-EVENT-REPORT pushes).
pub struct ProviderContext {
    pub association: Arc<Association>,
    pub presentation_context_id: u8,
    pub requester: MessageSender,
}

/// The callback surface of a DIMSE service class provider.
///
/// Every method has a conservative default:
/// verification succeeds,
/// everything else is refused with
/// _SOP class not supported_ or _unrecognized operation_.
/// Implementations override the operations they actually serve.
#[async_trait]
pub trait ServiceProvider: Send + Sync + 'static {
    async fn c_echo(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::SUCCESS)
    }

    async fn c_store(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::SOP_CLASS_NOT_SUPPORTED)
    }

    async fn c_find(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::SOP_CLASS_NOT_SUPPORTED)
    }

    async fn c_get(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::SOP_CLASS_NOT_SUPPORTED)
    }

    async fn c_move(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::SOP_CLASS_NOT_SUPPORTED)
    }

    /// Handle a C-CANCEL for an operation in progress.
    ///
    /// C-CANCEL carries no response of its own.
    async fn c_cancel(&self, _ctx: &ProviderContext, _request: Message) -> Responses {
        none()
    }

    /// Handle an inbound N-* request
    /// (N-EVENT-REPORT, N-GET, N-SET, N-ACTION, N-CREATE, N-DELETE).
    ///
    /// The concrete operation is discriminated
    /// by the command field of the request.
    async fn n_request(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        status_only(&request, Status::UNRECOGNIZED_OPERATION)
    }

    /// Provide a sink for the data set of an incoming request
    /// (typically a large C-STORE),
    /// called once its command set has been reassembled.
    ///
    /// Returning `None` buffers and decodes the data set in memory.
    fn dataset_sink(&self, _command: &CommandSet) -> Option<Box<dyn Write + Send>> {
        None
    }

    /// Answer the negotiation items of an incoming association proposal:
    /// accepted extended-negotiation application info
    /// and the user identity server response payload.
    fn negotiation_overrides(&self, _association: &Association) -> NegotiationOverrides {
        NegotiationOverrides::default()
    }
}

/// A provider with no services of its own:
/// it answers verification and refuses everything else.
///
/// Used by requester sessions which do not expect
/// server-initiated operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

#[async_trait]
impl ServiceProvider for NoServices {}

/// Route an inbound request to the matching provider callback.
pub(crate) async fn dispatch(
    provider: &dyn ServiceProvider,
    ctx: &ProviderContext,
    message: Message,
) -> Responses {
    match message.command.command_field() {
        Ok(CommandField::CEchoRq) => provider.c_echo(ctx, message).await,
        Ok(CommandField::CStoreRq) => provider.c_store(ctx, message).await,
        Ok(CommandField::CFindRq) => provider.c_find(ctx, message).await,
        Ok(CommandField::CGetRq) => provider.c_get(ctx, message).await,
        Ok(CommandField::CMoveRq) => provider.c_move(ctx, message).await,
        Ok(CommandField::CCancelRq) => provider.c_cancel(ctx, message).await,
        Ok(field) if field.is_request() => provider.n_request(ctx, message).await,
        Ok(field) => {
            warn!("response {:?} routed to the provider side", field);
            none()
        }
        Err(e) => {
            warn!("inbound request with no usable command field: {}", e);
            none()
        }
    }
}

/// Drive one inbound request through the provider
/// and send every produced response in order.
pub(crate) async fn run_provider(
    provider: Arc<dyn ServiceProvider>,
    ctx: ProviderContext,
    message: Message,
) {
    let presentation_context_id = message.presentation_context_id;
    let mut responses = dispatch(provider.as_ref(), &ctx, message).await;
    while let Some(response) = responses.next().await {
        if let Err(e) = ctx
            .requester
            .send_response(
                presentation_context_id,
                response.command,
                response.dataset.as_ref(),
            )
            .await
        {
            warn!("failed to send DIMSE response: {}", e);
            break;
        }
    }
}
