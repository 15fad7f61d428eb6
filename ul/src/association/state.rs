//! Association lifecycle state machine.
//!
//! The upper layer protocol requires PDUs to arrive fully ordered
//! on the underlying TCP stream,
//! so no reordering logic is needed here:
//! the machine only tracks which phase the association is in
//! and validates that each local action or received PDU
//! is legal for the current phase (PS3.8 §9.2).
//! A PDU that is illegal for the current state yields an error,
//! which connection layers translate into an A-ABORT
//! with an "unexpected PDU" reason.
use snafu::Snafu;

use crate::pdu::Pdu;

/// Which side of the association this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This node requested the association.
    Requester,
    /// This node accepted (or is deciding on) the association.
    Acceptor,
}

/// The lifecycle phase of one association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// No association activity yet.
    Idle,
    /// Negotiation is in progress.
    Negotiating(Role),
    /// The association is established and P-DATA may flow.
    Established,
    /// A release was requested and its confirmation is pending.
    Releasing,
    /// The association was aborted, locally or by the peer.
    Aborted,
    /// The association ended and the connection is to be closed.
    Closed,
}

/// A local action or protocol input driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// Local request to open an association (requester side).
    RequestAssociation,
    /// Local decision to accept the proposed association (acceptor side).
    Accept,
    /// Local decision to reject the proposed association (acceptor side).
    Reject,
    /// Local request to gracefully release the association.
    RequestRelease,
    /// Local request to abort the association.
    Abort,
    /// The transport failed (reset, EOF, TLS failure).
    TransportError,
    /// A PDU arrived from the peer.
    Received(&'a Pdu),
}

/// What the caller must do after a successful transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing beyond the state change.
    None,
    /// Send an A-ASSOCIATE-RQ to the peer.
    SendAssociateRq,
    /// Hand the received A-ASSOCIATE-RQ to the application
    /// for an accept/reject decision.
    AskAcceptance,
    /// Send the A-ASSOCIATE-AC to the peer.
    SendAssociateAc,
    /// Send the A-ASSOCIATE-RJ to the peer.
    SendAssociateRj,
    /// The peer accepted; expose the negotiated association.
    ConfirmEstablished,
    /// The peer rejected; surface result, source and reason to the caller.
    ConfirmRejected,
    /// Dispatch the P-DATA-TF to the data layer.
    DispatchPData,
    /// Send an A-RELEASE-RQ and await the reply.
    SendReleaseRq,
    /// Send an A-RELEASE-RP; the association is then closed.
    SendReleaseRp,
    /// The peer confirmed the release; close the connection.
    ConfirmReleased,
    /// Send an A-ABORT and fail all pending work.
    SendAbort,
    /// The peer aborted (or the transport failed); fail all pending work.
    PeerAborted,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("PDU {} not permitted in state {:?}", pdu, state))]
    UnexpectedPdu {
        state: AssociationState,
        pdu: &'static str,
    },

    #[snafu(display("unrecognized PDU type {} received in state {:?}", pdu_type, state))]
    UnrecognizedPdu {
        state: AssociationState,
        pdu_type: u8,
    },

    #[snafu(display("event {:?} not permitted in state {:?}", event, state))]
    IllegalEvent {
        state: AssociationState,
        event: &'static str,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn pdu_name(pdu: &Pdu) -> &'static str {
    match pdu {
        Pdu::Unknown { .. } => "Unknown",
        Pdu::AssociationRQ(..) => "A-ASSOCIATE-RQ",
        Pdu::AssociationAC(..) => "A-ASSOCIATE-AC",
        Pdu::AssociationRJ(..) => "A-ASSOCIATE-RJ",
        Pdu::PData { .. } => "P-DATA-TF",
        Pdu::ReleaseRQ => "A-RELEASE-RQ",
        Pdu::ReleaseRP => "A-RELEASE-RP",
        Pdu::AbortRQ { .. } => "A-ABORT",
    }
}

/// The per-connection association state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    state: AssociationState,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: AssociationState::Idle,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// Whether the association reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.state,
            AssociationState::Aborted | AssociationState::Closed
        )
    }

    /// Apply an event to the machine,
    /// returning the action the caller must carry out.
    ///
    /// On error the state is left unchanged,
    /// except that an unexpected or unrecognized PDU
    /// moves the machine to `Aborted`
    /// (the caller is expected to emit the A-ABORT).
    pub fn handle(&mut self, event: Event<'_>) -> Result<Action> {
        use AssociationState as S;

        let (next, action) = match (self.state, event) {
            // abort and transport failure win from any live state
            (s, Event::Received(Pdu::AbortRQ { .. })) if !Self::terminal(s) => {
                (S::Aborted, Action::PeerAborted)
            }
            (s, Event::Abort) if !Self::terminal(s) => (S::Aborted, Action::SendAbort),
            (s, Event::TransportError) if !Self::terminal(s) => (S::Aborted, Action::PeerAborted),

            (S::Idle, Event::RequestAssociation) => {
                (S::Negotiating(Role::Requester), Action::SendAssociateRq)
            }
            (S::Idle, Event::Received(Pdu::AssociationRQ(..))) => {
                (S::Negotiating(Role::Acceptor), Action::AskAcceptance)
            }

            (S::Negotiating(Role::Requester), Event::Received(Pdu::AssociationAC(..))) => {
                (S::Established, Action::ConfirmEstablished)
            }
            (S::Negotiating(Role::Requester), Event::Received(Pdu::AssociationRJ(..))) => {
                (S::Closed, Action::ConfirmRejected)
            }

            (S::Negotiating(Role::Acceptor), Event::Accept) => {
                (S::Established, Action::SendAssociateAc)
            }
            (S::Negotiating(Role::Acceptor), Event::Reject) => (S::Closed, Action::SendAssociateRj),

            (S::Established, Event::Received(Pdu::PData { .. })) => {
                (S::Established, Action::DispatchPData)
            }
            (S::Established, Event::RequestRelease) => (S::Releasing, Action::SendReleaseRq),
            (S::Established, Event::Received(Pdu::ReleaseRQ)) => {
                (S::Closed, Action::SendReleaseRp)
            }

            // the peer may still deliver data queued before our release request
            (S::Releasing, Event::Received(Pdu::PData { .. })) => {
                (S::Releasing, Action::DispatchPData)
            }
            (S::Releasing, Event::Received(Pdu::ReleaseRP)) => (S::Closed, Action::ConfirmReleased),
            // release collision: answer the peer and keep waiting for our reply
            (S::Releasing, Event::Received(Pdu::ReleaseRQ)) => {
                (S::Releasing, Action::SendReleaseRp)
            }

            (state, Event::Received(Pdu::Unknown { pdu_type, .. })) => {
                self.state = S::Aborted;
                return UnrecognizedPduSnafu {
                    state,
                    pdu_type: *pdu_type,
                }
                .fail();
            }
            (state, Event::Received(pdu)) => {
                self.state = S::Aborted;
                return UnexpectedPduSnafu {
                    state,
                    pdu: pdu_name(pdu),
                }
                .fail();
            }
            (state, event) => {
                return IllegalEventSnafu {
                    state,
                    event: match event {
                        Event::RequestAssociation => "RequestAssociation",
                        Event::Accept => "Accept",
                        Event::Reject => "Reject",
                        Event::RequestRelease => "RequestRelease",
                        Event::Abort => "Abort",
                        Event::TransportError => "TransportError",
                        Event::Received(_) => unreachable!(),
                    },
                }
                .fail();
            }
        };

        self.state = next;
        Ok(action)
    }

    fn terminal(state: AssociationState) -> bool {
        matches!(state, AssociationState::Aborted | AssociationState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ};
    use crate::pdu::{
        AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, PDataValue,
        PDataValueType,
    };

    fn sample_rq() -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        })
    }

    fn sample_ac() -> Pdu {
        Pdu::AssociationAC(AssociationAC {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        })
    }

    fn sample_pdata() -> Pdu {
        Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 8],
            }],
        }
    }

    #[test]
    fn requester_happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(
            sm.handle(Event::RequestAssociation).unwrap(),
            Action::SendAssociateRq
        );
        assert_eq!(sm.state(), AssociationState::Negotiating(Role::Requester));

        assert_eq!(
            sm.handle(Event::Received(&sample_ac())).unwrap(),
            Action::ConfirmEstablished
        );
        assert!(sm.is_established());

        assert_eq!(
            sm.handle(Event::Received(&sample_pdata())).unwrap(),
            Action::DispatchPData
        );

        assert_eq!(
            sm.handle(Event::RequestRelease).unwrap(),
            Action::SendReleaseRq
        );
        assert_eq!(
            sm.handle(Event::Received(&Pdu::ReleaseRP)).unwrap(),
            Action::ConfirmReleased
        );
        assert_eq!(sm.state(), AssociationState::Closed);
    }

    #[test]
    fn acceptor_happy_path() {
        let mut sm = StateMachine::new();
        assert_eq!(
            sm.handle(Event::Received(&sample_rq())).unwrap(),
            Action::AskAcceptance
        );
        assert_eq!(sm.handle(Event::Accept).unwrap(), Action::SendAssociateAc);
        assert!(sm.is_established());

        // peer requests release
        assert_eq!(
            sm.handle(Event::Received(&Pdu::ReleaseRQ)).unwrap(),
            Action::SendReleaseRp
        );
        assert_eq!(sm.state(), AssociationState::Closed);
    }

    #[test]
    fn rejection_closes_the_association() {
        let mut sm = StateMachine::new();
        sm.handle(Event::RequestAssociation).unwrap();
        let rj = Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        });
        assert_eq!(
            sm.handle(Event::Received(&rj)).unwrap(),
            Action::ConfirmRejected
        );
        assert_eq!(sm.state(), AssociationState::Closed);
    }

    #[test]
    fn abort_reachable_from_any_live_state() {
        let abort = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        let ac = sample_ac();

        let setups: [&[Event]; 4] = [
            &[],
            &[Event::RequestAssociation],
            &[Event::RequestAssociation, Event::Received(&ac)],
            &[
                Event::RequestAssociation,
                Event::Received(&ac),
                Event::RequestRelease,
            ],
        ];

        for setup in setups {
            let mut sm = StateMachine::new();
            for ev in setup {
                sm.handle(*ev).unwrap();
            }
            assert_eq!(
                sm.handle(Event::Received(&abort)).unwrap(),
                Action::PeerAborted
            );
            assert_eq!(sm.state(), AssociationState::Aborted);
        }
    }

    #[test]
    fn transport_error_aborts() {
        let mut sm = StateMachine::new();
        sm.handle(Event::RequestAssociation).unwrap();
        sm.handle(Event::Received(&sample_ac())).unwrap();
        assert_eq!(
            sm.handle(Event::TransportError).unwrap(),
            Action::PeerAborted
        );
        assert_eq!(sm.state(), AssociationState::Aborted);
    }

    #[test]
    fn illegal_pdu_for_state_aborts() {
        // P-DATA before the association is established
        let mut sm = StateMachine::new();
        sm.handle(Event::RequestAssociation).unwrap();
        let err = sm.handle(Event::Received(&sample_pdata())).unwrap_err();
        assert!(matches!(err, Error::UnexpectedPdu { .. }));
        assert_eq!(sm.state(), AssociationState::Aborted);

        // A-ASSOCIATE-AC out of nowhere
        let mut sm = StateMachine::new();
        let err = sm.handle(Event::Received(&sample_ac())).unwrap_err();
        assert!(matches!(err, Error::UnexpectedPdu { .. }));
        assert_eq!(sm.state(), AssociationState::Aborted);
    }

    #[test]
    fn release_collision_is_answered() {
        let mut sm = StateMachine::new();
        sm.handle(Event::RequestAssociation).unwrap();
        sm.handle(Event::Received(&sample_ac())).unwrap();
        sm.handle(Event::RequestRelease).unwrap();

        // both sides requested release at the same time
        assert_eq!(
            sm.handle(Event::Received(&Pdu::ReleaseRQ)).unwrap(),
            Action::SendReleaseRp
        );
        assert_eq!(sm.state(), AssociationState::Releasing);
        assert_eq!(
            sm.handle(Event::Received(&Pdu::ReleaseRP)).unwrap(),
            Action::ConfirmReleased
        );
        assert_eq!(sm.state(), AssociationState::Closed);
    }

    #[test]
    fn unrecognized_pdu_aborts() {
        let mut sm = StateMachine::new();
        sm.handle(Event::RequestAssociation).unwrap();
        sm.handle(Event::Received(&sample_ac())).unwrap();
        let unknown = Pdu::Unknown {
            pdu_type: 0xAA,
            data: vec![],
        };
        let err = sm.handle(Event::Received(&unknown)).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedPdu { pdu_type: 0xAA, .. }));
        assert_eq!(sm.state(), AssociationState::Aborted);
    }
}
