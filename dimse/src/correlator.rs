//! Request/response correlation.
//!
//! Every outgoing request is assigned a message ID
//! unique within the association's lifetime
//! and recorded in a pending-request table.
//! Incoming messages are routed by their
//! Message ID Being Responded To:
//! responses with a Pending status are delivered
//! without retiring the entry,
//! terminal statuses retire it,
//! and inbound *requests* (such as an unsolicited N-EVENT-REPORT
//! on a requester-initiated association)
//! are handed to the service-provider side instead,
//! independent of the pending table.
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Instant;

use snafu::Snafu;
use tokio::sync::mpsc;
use tracing::debug;

use crate::command::CommandField;
use crate::message::Message;

/// The terminal failure of one pending request.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[non_exhaustive]
pub enum RequestError {
    /// the request deadline expired before a terminal response arrived
    TimedOut,

    /// the request was cancelled locally
    Cancelled,

    /// the association was aborted before the operation concluded
    Aborted,

    #[snafu(display("connection failure: {}", message))]
    Transport { message: String },
}

type ResponseResult = Result<Message, RequestError>;

struct PendingRequest {
    command: CommandField,
    tx: mpsc::UnboundedSender<ResponseResult>,
    deadline: Option<Instant>,
}

/// How an inbound message was routed.
#[derive(Debug)]
pub enum Inbound {
    /// A response was delivered to its pending request.
    Delivered,
    /// A response arrived with no matching pending request;
    /// the caller decides whether to drop or log it.
    Unmatched(Message),
    /// The peer issued a request of its own,
    /// to be dispatched to the registered service provider.
    Request(Message),
}

/// The pending-request table of one association.
pub struct Correlator {
    next_message_id: u16,
    pending: HashMap<u16, PendingRequest>,
}

impl Default for Correlator {
    fn default() -> Self {
        Correlator::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            next_message_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Whether no requests are in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Allocate a message ID and record a pending request for it.
    ///
    /// IDs ascend monotonically and wrap around,
    /// skipping any ID still in flight.
    pub fn register(
        &mut self,
        command: CommandField,
        deadline: Option<Instant>,
    ) -> (u16, mpsc::UnboundedReceiver<ResponseResult>) {
        let message_id = loop {
            let candidate = self.next_message_id;
            self.next_message_id = match self.next_message_id.checked_add(1) {
                Some(id) => id,
                None => 1,
            };
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(
            message_id,
            PendingRequest {
                command,
                tx,
                deadline,
            },
        );
        (message_id, rx)
    }

    /// Route one complete inbound message.
    ///
    /// Fails when the message carries no usable command field,
    /// which the connection treats as a protocol violation.
    pub fn dispatch(&mut self, message: Message) -> Result<Inbound, crate::command::Error> {
        let field = message.command.command_field()?;
        if field.is_request() {
            return Ok(Inbound::Request(message));
        }

        let responded_to = message.command.message_id_being_responded_to()?;
        let is_pending = message
            .command
            .status()
            .map(|s| s.is_pending())
            .unwrap_or(false);

        match self.pending.get(&responded_to) {
            Some(entry) => {
                debug!(
                    "response to message {} ({:?}, pending: {})",
                    responded_to, entry.command, is_pending
                );
                if is_pending {
                    // deliver without retiring; more responses will follow
                    let _ = entry.tx.send(Ok(message));
                } else if let Some(entry) = self.pending.remove(&responded_to) {
                    let _ = entry.tx.send(Ok(message));
                }
                Ok(Inbound::Delivered)
            }
            None => Ok(Inbound::Unmatched(message)),
        }
    }

    /// Retire a pending request without delivering anything further.
    ///
    /// Returns whether an entry was removed.
    pub fn cancel(&mut self, message_id: u16) -> bool {
        match self.pending.remove(&message_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(RequestError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail and retire every request whose deadline has passed.
    ///
    /// A timeout concludes only the affected request;
    /// aborting the association on timeout is the caller's policy.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                debug!("request {} ({:?}) timed out", id, entry.command);
                let _ = entry.tx.send(Err(RequestError::TimedOut));
            }
        }
        expired.len()
    }

    /// Fail and retire every pending request,
    /// used when the association aborts or the transport fails.
    pub fn fail_all(&mut self, error: RequestError) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }
}

/// The stream of responses to one outgoing request.
///
/// Yields zero or more Pending responses
/// followed by exactly one terminal response,
/// then ends.
/// A request failure (timeout, cancellation, abort)
/// is yielded as an error in place of the terminal response.
pub struct ResponseStream {
    message_id: u16,
    rx: mpsc::UnboundedReceiver<ResponseResult>,
    correlator: Weak<Mutex<Correlator>>,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

impl ResponseStream {
    pub(crate) fn new(
        message_id: u16,
        rx: mpsc::UnboundedReceiver<ResponseResult>,
        correlator: Weak<Mutex<Correlator>>,
    ) -> Self {
        ResponseStream {
            message_id,
            rx,
            correlator,
        }
    }

    /// The message ID assigned to the request.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Await the next response,
    /// or `None` once the terminal response has been consumed.
    pub async fn next(&mut self) -> Option<ResponseResult> {
        self.rx.recv().await
    }

    /// Collect all remaining responses,
    /// ending with the terminal one.
    pub async fn collect(mut self) -> Result<Vec<Message>, RequestError> {
        let mut out = Vec::new();
        while let Some(result) = self.next().await {
            out.push(result?);
        }
        Ok(out)
    }

    /// Cancel the request locally.
    ///
    /// The pending entry is retired and no further responses are delivered;
    /// the association and its other requests are unaffected.
    pub fn cancel(&mut self) {
        if let Some(correlator) = self.correlator.upgrade() {
            let mut correlator = correlator
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            correlator.cancel(self.message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{CommandSet, Priority, Status};
    use crate::message::{Message, MessageDataset};

    use super::*;

    const STUDY_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

    fn response_message(request: &CommandSet, status: Status) -> Message {
        Message {
            presentation_context_id: 1,
            command: CommandSet::response_to(request, status).unwrap(),
            dataset: MessageDataset::Absent,
        }
    }

    #[test]
    fn pending_responses_do_not_retire_the_entry() {
        let mut correlator = Correlator::new();
        let (id, mut rx) = correlator.register(CommandField::CFindRq, None);
        let request = CommandSet::c_find_rq(id, STUDY_FIND, Priority::Medium);

        // two Pending responses followed by one Success
        for status in [Status::PENDING, Status::PENDING, Status::SUCCESS] {
            let routed = correlator
                .dispatch(response_message(&request, status))
                .unwrap();
            assert!(matches!(routed, Inbound::Delivered));
        }

        // exactly three deliveries, in order, and the channel is closed
        let statuses: Vec<Status> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.unwrap().command.status().unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![Status::PENDING, Status::PENDING, Status::SUCCESS]
        );
        assert!(correlator.is_idle());
    }

    #[test]
    fn inbound_requests_bypass_the_pending_table() {
        let mut correlator = Correlator::new();
        // a pending request whose ID happens to collide with the event report
        let (id, mut rx) = correlator.register(CommandField::NActionRq, None);

        let event = Message {
            presentation_context_id: 1,
            command: CommandSet::n_event_report_rq(id, "1.2.840.10008.1.20.1", "1.2.3", 1),
            dataset: MessageDataset::Absent,
        };
        let routed = correlator.dispatch(event).unwrap();
        assert!(matches!(routed, Inbound::Request(_)));

        // the pending request was not touched
        assert_eq!(correlator.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unmatched_responses_are_surfaced() {
        let mut correlator = Correlator::new();
        let request = CommandSet::c_echo_rq(42);
        let routed = correlator
            .dispatch(response_message(&request, Status::SUCCESS))
            .unwrap();
        assert!(matches!(routed, Inbound::Unmatched(_)));
    }

    #[test]
    fn expired_deadlines_fail_only_the_affected_request() {
        let mut correlator = Correlator::new();
        let now = Instant::now();
        let (_expired, mut expired_rx) =
            correlator.register(CommandField::CEchoRq, Some(now));
        let (_alive, mut alive_rx) = correlator.register(
            CommandField::CFindRq,
            Some(now + std::time::Duration::from_secs(3600)),
        );

        assert_eq!(correlator.sweep(now), 1);
        assert!(matches!(
            expired_rx.try_recv().unwrap(),
            Err(RequestError::TimedOut)
        ));
        assert!(alive_rx.try_recv().is_err());
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn fail_all_drains_the_table() {
        let mut correlator = Correlator::new();
        let (_, mut rx1) = correlator.register(CommandField::CStoreRq, None);
        let (_, mut rx2) = correlator.register(CommandField::CFindRq, None);

        correlator.fail_all(RequestError::Aborted);
        assert!(correlator.is_idle());
        assert!(matches!(rx1.try_recv().unwrap(), Err(RequestError::Aborted)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(RequestError::Aborted)));
    }

    #[test]
    fn allocation_skips_ids_still_in_flight() {
        let mut correlator = Correlator::new();
        let (first, _rx) = correlator.register(CommandField::CEchoRq, None);
        assert_eq!(first, 1);

        // force the counter to wrap around onto the in-flight ID
        correlator.next_message_id = first;
        let (second, _rx2) = correlator.register(CommandField::CEchoRq, None);
        assert_eq!(second, 2);
    }

    #[test]
    fn cancel_retires_and_notifies() {
        let mut correlator = Correlator::new();
        let (id, mut rx) = correlator.register(CommandField::CMoveRq, None);
        assert!(correlator.cancel(id));
        assert!(!correlator.cancel(id));
        assert!(matches!(rx.try_recv().unwrap(), Err(RequestError::Cancelled)));
        assert!(correlator.is_idle());
    }
}
