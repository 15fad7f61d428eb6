//! End-to-end exchanges over loopback TCP:
//! echo verification, store, find with pending responses,
//! server-initiated event reports,
//! and negotiation-driven framing limits.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use futures::stream::{self, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use radlink_dimse::server::DimseServer;
use radlink_dimse::service::{self, ProviderContext, Response, Responses, ServiceProvider};
use radlink_dimse::ul::association::appinfo::CFindApplicationInfo;
use radlink_dimse::ul::association::server::{AccessControl, NegotiationOverrides};
use radlink_dimse::ul::association::Association;
use radlink_dimse::{
    ClientConfig, ClientSession, ClientSessionOptions, CommandSet, Error, Message, Priority,
    Request, ServerConfig, Status,
};

const VERIFICATION: &str = "1.2.840.10008.1.1";
const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
const STUDY_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
const STORAGE_COMMITMENT: &str = "1.2.840.10008.1.20.1";

async fn spawn_server<A>(server: DimseServer<A>) -> SocketAddr
where
    A: AccessControl + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    address
}

async fn connect(options: ClientSessionOptions<'_>, address: SocketAddr) -> ClientSession {
    options
        .calling_ae_title("TEST-SCU")
        .establish(address)
        .await
        .unwrap()
}

#[tokio::test]
async fn echo_round_trips_with_success() {
    let address = spawn_server(
        DimseServer::new(Arc::new(service::NoServices))
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new().with_abstract_syntax(VERIFICATION),
        address,
    )
    .await;

    assert!(session
        .association()
        .context_for_abstract_syntax(VERIFICATION)
        .is_some());
    assert_eq!(session.echo().await.unwrap(), Status::SUCCESS);
    session.release().await.unwrap();
}

#[tokio::test]
async fn store_on_rejected_context_fails_without_network_round_trip() {
    // the acceptor only knows verification
    let address = spawn_server(
        DimseServer::new(Arc::new(service::NoServices))
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .with_abstract_syntax(MR_STORAGE),
        address,
    )
    .await;

    // the MR storage context came back rejected
    assert!(session
        .association()
        .context_for_abstract_syntax(MR_STORAGE)
        .is_none());

    let command = CommandSet::c_store_rq(0, MR_STORAGE, "1.2.3.4", Priority::Medium);
    let err = session
        .send(Request::new(command).with_dataset(sample_identifier("Doe^John")))
        .await
        .unwrap_err();
    matches::assert_matches!(
        err,
        Error::SopClassNotSupported { ref sop_class_uid, .. } if sop_class_uid == MR_STORAGE
    );

    // the association is still usable for accepted contexts
    assert_eq!(session.echo().await.unwrap(), Status::SUCCESS);
    session.release().await.unwrap();
}

fn sample_identifier(name: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, name),
    )])
}

struct FindScp;

#[async_trait]
impl ServiceProvider for FindScp {
    async fn c_find(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        let pending1 = CommandSet::response_to(&request.command, Status::PENDING).unwrap();
        let pending2 = CommandSet::response_to(&request.command, Status::PENDING).unwrap();
        let done = CommandSet::response_to(&request.command, Status::SUCCESS).unwrap();
        stream::iter(vec![
            Response::with_dataset(pending1, sample_identifier("Doe^John")),
            Response::with_dataset(pending2, sample_identifier("Doe^Jane")),
            Response::new(done),
        ])
        .boxed()
    }
}

#[tokio::test]
async fn find_delivers_pending_responses_in_order() {
    let address = spawn_server(
        DimseServer::new(Arc::new(FindScp))
            .ae_title("FIND-SCP")
            .with_abstract_syntax(STUDY_FIND),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new().with_abstract_syntax(STUDY_FIND),
        address,
    )
    .await;

    let command = CommandSet::c_find_rq(0, STUDY_FIND, Priority::Medium);
    let responses = session
        .send(Request::new(command).with_dataset(sample_identifier("Doe^*")))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    // exactly three deliveries: Pending, Pending, Success
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].command.status(), Some(Status::PENDING));
    assert_eq!(responses[1].command.status(), Some(Status::PENDING));
    assert_eq!(responses[2].command.status(), Some(Status::SUCCESS));

    let first = responses[0].dataset().unwrap();
    assert_eq!(
        first.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
        "Doe^John"
    );
    assert!(responses[2].dataset().is_none());

    session.release().await.unwrap();
}

struct StoreScp {
    received: mpsc::UnboundedSender<(String, InMemDicomObject)>,
}

#[async_trait]
impl ServiceProvider for StoreScp {
    async fn c_store(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        let response = CommandSet::response_to(&request.command, Status::SUCCESS).unwrap();
        let instance_uid = request.command.affected_sop_instance_uid().unwrap_or_default();
        if let Some(dataset) = request.dataset() {
            let _ = self.received.send((instance_uid, dataset.clone()));
        }
        service::single(Response::new(response))
    }
}

#[tokio::test]
async fn peer_max_pdu_length_governs_large_stores() {
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    let address = spawn_server(
        DimseServer::new(Arc::new(StoreScp {
            received: received_tx,
        }))
        .ae_title("STORE-SCP")
        .with_abstract_syntax(MR_STORAGE)
        .config(ServerConfig {
            // the server advertises a much larger limit
            // than the client's own configured value
            max_pdu_length: 400_000,
            ..ServerConfig::default()
        }),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new().with_abstract_syntax(MR_STORAGE),
        address,
    )
    .await;

    // once established, the server's advertised maximum
    // overrides the client's configured value for sending
    assert_eq!(session.association().peer_max_pdu_length(), Some(400_000));
    assert_eq!(session.association().send_max_pdu_length(), 400_000);

    let pixel_data = vec![0x5Au8; 100_000];
    let dataset = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
        DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            PrimitiveValue::from(pixel_data.clone()),
        ),
    ]);

    let command = CommandSet::c_store_rq(0, MR_STORAGE, "1.2.3.4", Priority::Medium);
    let responses = session
        .send(Request::new(command).with_dataset(dataset))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].command.status(), Some(Status::SUCCESS));

    let (instance_uid, received) = received_rx.recv().await.unwrap();
    assert_eq!(instance_uid, "1.2.3.4");
    let received_pixels = received
        .element(tags::PIXEL_DATA)
        .unwrap()
        .to_bytes()
        .unwrap();
    assert_eq!(received_pixels.as_ref(), &pixel_data[..]);

    session.release().await.unwrap();
}

struct CommitmentScp {
    push_statuses: mpsc::UnboundedSender<Status>,
}

#[async_trait]
impl ServiceProvider for CommitmentScp {
    async fn n_request(&self, ctx: &ProviderContext, request: Message) -> Responses {
        let response = CommandSet::response_to(&request.command, Status::SUCCESS).unwrap();

        // push an event report back over the same association
        let requester = ctx.requester.clone();
        let push_statuses = self.push_statuses.clone();
        tokio::spawn(async move {
            let event = CommandSet::n_event_report_rq(0, STORAGE_COMMITMENT, "1.2.3.9", 1);
            if let Ok(mut responses) = requester.send_request(Request::new(event)).await {
                if let Some(Ok(message)) = responses.next().await {
                    if let Some(status) = message.command.status() {
                        let _ = push_statuses.send(status);
                    }
                }
            }
        });

        service::single(Response::new(response))
    }
}

struct EventSink {
    events: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ServiceProvider for EventSink {
    async fn n_request(&self, _ctx: &ProviderContext, request: Message) -> Responses {
        let response = CommandSet::response_to(&request.command, Status::SUCCESS).unwrap();
        let _ = self.events.send(request);
        service::single(Response::new(response))
    }
}

#[tokio::test]
async fn unsolicited_event_report_reaches_the_request_handler() {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let address = spawn_server(
        DimseServer::new(Arc::new(CommitmentScp {
            push_statuses: push_tx,
        }))
        .ae_title("COMMIT-SCP")
        .with_abstract_syntax(STORAGE_COMMITMENT),
    )
    .await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let session = connect(
        ClientSessionOptions::new()
            .with_abstract_syntax(STORAGE_COMMITMENT)
            .with_provider(Arc::new(EventSink { events: event_tx })),
        address,
    )
    .await;

    // the SCU asks for storage commitment with N-ACTION
    let command = CommandSet::n_action_rq(0, STORAGE_COMMITMENT, "1.2.3.9", 1);
    let responses = session
        .send(Request::new(command))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].command.status(), Some(Status::SUCCESS));

    // the SCP pushed an N-EVENT-REPORT over the still-open association;
    // it was dispatched as a request, not matched against a pending entry
    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event.command.command_field().unwrap(),
        radlink_dimse::CommandField::NEventReportRq
    );
    assert_eq!(event.command.event_type_id(), Some(1));

    // and the SCP saw the SCU's success response to its push
    let status = tokio::time::timeout(Duration::from_secs(5), push_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, Status::SUCCESS);

    session.release().await.unwrap();
}

struct RelationalFindScp;

#[async_trait]
impl ServiceProvider for RelationalFindScp {
    fn negotiation_overrides(&self, association: &Association) -> NegotiationOverrides {
        let mut overrides = NegotiationOverrides::default();
        if let Some(proposal) = association.extended_negotiation(STUDY_FIND) {
            let requested =
                CFindApplicationInfo::from_bytes(proposal.requested_application_info());
            // confirm relational queries, decline everything else
            let accepted = CFindApplicationInfo {
                relational_queries: requested.relational_queries,
                ..CFindApplicationInfo::default()
            };
            overrides
                .extended_negotiation_responses
                .push((STUDY_FIND.to_string(), accepted.to_bytes()));
        }
        overrides
    }
}

#[tokio::test]
async fn extended_negotiation_confirms_the_supported_subset() {
    let address = spawn_server(
        DimseServer::new(Arc::new(RelationalFindScp))
            .ae_title("FIND-SCP")
            .with_abstract_syntax(STUDY_FIND),
    )
    .await;

    let proposed = CFindApplicationInfo {
        relational_queries: true,
        date_time_matching: true,
        fuzzy_semantic_matching: true,
        ..CFindApplicationInfo::default()
    };
    let session = connect(
        ClientSessionOptions::new()
            .with_abstract_syntax(STUDY_FIND)
            .with_extended_negotiation(STUDY_FIND, proposed.to_bytes()),
        address,
    )
    .await;

    let negotiation = session
        .association()
        .extended_negotiation(STUDY_FIND)
        .expect("the proposal should be kept in the association");
    let accepted = CFindApplicationInfo::from_bytes(
        negotiation
            .accepted_application_info()
            .expect("the acceptor answered the item"),
    );
    assert!(accepted.relational_queries);
    assert!(!accepted.date_time_matching);
    assert!(!accepted.fuzzy_semantic_matching);

    session.release().await.unwrap();
}

struct SilentScp;

#[async_trait]
impl ServiceProvider for SilentScp {
    async fn c_find(&self, _ctx: &ProviderContext, _request: Message) -> Responses {
        // never answers
        service::none()
    }
}

#[tokio::test]
async fn request_timeout_fails_only_the_affected_request() {
    let address = spawn_server(
        DimseServer::new(Arc::new(SilentScp))
            .ae_title("SILENT-SCP")
            .with_abstract_syntax(STUDY_FIND)
            .with_abstract_syntax(VERIFICATION),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new()
            .with_abstract_syntax(STUDY_FIND)
            .with_abstract_syntax(VERIFICATION),
        address,
    )
    .await;

    let command = CommandSet::c_find_rq(0, STUDY_FIND, Priority::Medium);
    let mut responses = session
        .send(
            Request::new(command)
                .with_dataset(sample_identifier("Doe^*"))
                .timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), responses.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        Err(radlink_dimse::RequestError::TimedOut)
    ));

    // a timeout does not abort the association
    assert_eq!(session.echo().await.unwrap(), Status::SUCCESS);
    session.release().await.unwrap();
}

#[tokio::test]
async fn idle_association_lingers_then_releases_itself() {
    let address = spawn_server(
        DimseServer::new(Arc::new(service::NoServices))
            .ae_title("ECHO-SCP")
            .with_abstract_syntax(VERIFICATION),
    )
    .await;

    let session = connect(
        ClientSessionOptions::new()
            .with_abstract_syntax(VERIFICATION)
            .config(ClientConfig {
                linger_ms: Some(300),
                ..ClientConfig::default()
            }),
        address,
    )
    .await;

    assert_eq!(session.echo().await.unwrap(), Status::SUCCESS);

    // with no requests in flight, the session releases itself
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("association should have been released after the linger period");
}

#[tokio::test]
async fn rejected_association_surfaces_the_rejection() {
    let address = spawn_server(
        DimseServer::new(Arc::new(service::NoServices))
            .ae_title("PICKY-SCP")
            .with_abstract_syntax(VERIFICATION)
            .ae_access_control(radlink_dimse::ul::association::server::AcceptCalledAeTitle),
    )
    .await;

    let err = ClientSessionOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("WRONG-SCP")
        .with_abstract_syntax(VERIFICATION)
        .establish(address)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected { .. }));
}
