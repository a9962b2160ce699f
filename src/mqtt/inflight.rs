//! In-flight QoS 1/2 publish tracking
//!
//! Packet identifiers come from 1..=65535 and are never handed out while
//! still awaiting an acknowledgement.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::PublishError;
use crate::protocol::{QoS, ReasonCode};

pub(crate) type Reply = oneshot::Sender<Result<(), PublishError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// QoS 1, waiting for PUBACK
    AwaitingPubAck,
    /// QoS 2, waiting for PUBREC
    AwaitingPubRec,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    AwaitingPubComp,
}

struct Pending {
    stage: Stage,
    reply: Reply,
}

/// What to do after a PUBREC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PubRecAction {
    /// Send PUBREL for the identifier
    Release,
    /// The broker refused the message; the publish has been completed
    Refused,
    /// The identifier is not in flight
    Unknown,
}

/// Outcome of asking for a packet identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Free(u16),
    /// Window full with callers still waiting
    Full,
    /// Window full and every caller has given up: the broker has stopped
    /// acknowledging
    Stalled,
}

pub(crate) struct Inflight {
    next_id: u16,
    limit: usize,
    pending: HashMap<u16, Pending>,
}

impl Inflight {
    pub fn new(limit: u16) -> Self {
        Self {
            next_id: 1,
            limit: limit.max(1) as usize,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Allocate a free packet identifier.
    ///
    /// Identifiers of abandoned publishes stay reserved until the broker
    /// answers or the connection goes, since reusing one the broker still
    /// holds would collide with its QoS 2 state.
    pub fn allocate(&mut self) -> Slot {
        if self.pending.len() >= self.limit {
            let abandoned = self.pending.values().all(|p| p.reply.is_closed());
            return if abandoned { Slot::Stalled } else { Slot::Full };
        }
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.pending.contains_key(&id) {
                return Slot::Free(id);
            }
        }
        Slot::Full
    }

    /// Track a publish that has been written with `packet_id`
    pub fn insert(&mut self, packet_id: u16, qos: QoS, reply: Reply) {
        let stage = match qos {
            QoS::ExactlyOnce => Stage::AwaitingPubRec,
            _ => Stage::AwaitingPubAck,
        };
        self.pending.insert(packet_id, Pending { stage, reply });
    }

    /// Complete a publish on PUBACK (QoS 1) or PUBCOMP (QoS 2).
    /// Returns false if the identifier was not waiting for that packet.
    pub fn complete(&mut self, packet_id: u16, expected: Stage, reason: ReasonCode) -> bool {
        match self.pending.get(&packet_id) {
            Some(p) if p.stage == expected => {}
            _ => return false,
        }
        if let Some(pending) = self.pending.remove(&packet_id) {
            let result = if reason.is_error() {
                Err(PublishError::Rejected(reason))
            } else {
                Ok(())
            };
            let _ = pending.reply.send(result);
        }
        true
    }

    /// Advance a QoS 2 publish on PUBREC
    pub fn on_pubrec(&mut self, packet_id: u16, reason: ReasonCode) -> PubRecAction {
        let Some(pending) = self.pending.get_mut(&packet_id) else {
            return PubRecAction::Unknown;
        };
        match pending.stage {
            Stage::AwaitingPubRec if reason.is_error() => {
                if let Some(pending) = self.pending.remove(&packet_id) {
                    let _ = pending.reply.send(Err(PublishError::Rejected(reason)));
                }
                PubRecAction::Refused
            }
            Stage::AwaitingPubRec => {
                pending.stage = Stage::AwaitingPubComp;
                PubRecAction::Release
            }
            // Retransmitted PUBREC: answer with PUBREL again
            Stage::AwaitingPubComp => PubRecAction::Release,
            Stage::AwaitingPubAck => PubRecAction::Unknown,
        }
    }

    /// Fail every in-flight publish with `error`
    pub fn fail_all(&mut self, error: PublishError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }
}
