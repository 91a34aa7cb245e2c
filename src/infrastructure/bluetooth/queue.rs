//! Operation Queue
//!
//! Per-connection FIFO that keeps at most one GATT operation in flight and
//! matches transport completions back to it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{CharacteristicKey, OperationKind, OperationOutcome};
use crate::error::{BleError, TransportError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{LinkHandle, Transport};

pub type OperationReply = oneshot::Sender<Result<OperationOutcome, BleError>>;

/// What a queued operation asks of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Read,
    Write {
        value: Vec<u8>,
        with_response: bool,
    },
    /// Toggle followed by a configuration descriptor write, carried as one
    /// operation.
    SetNotify {
        enabled: bool,
        descriptor_value: [u8; 2],
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
            Self::SetNotify { .. } => OperationKind::SetNotify,
        }
    }
}

/// A caller request waiting for (or awaiting) the transport.
#[derive(Debug)]
pub struct PendingOperation {
    pub id: u64,
    pub target: CharacteristicKey,
    pub request: OperationRequest,
    reply: OperationReply,
}

impl PendingOperation {
    pub fn new(
        id: u64,
        target: CharacteristicKey,
        request: OperationRequest,
        reply: OperationReply,
    ) -> Self {
        Self {
            id,
            target,
            request,
            reply,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    /// Hand the outcome to the caller. A dropped receiver is not an error.
    pub fn resolve(self, result: Result<OperationOutcome, BleError>) {
        let _ = self.reply.send(result);
    }

    fn expected_completion(&self) -> Completion {
        match self.request {
            OperationRequest::Read => Completion::Read(self.target),
            OperationRequest::Write { .. } => Completion::Write(self.target),
            OperationRequest::SetNotify { .. } => {
                Completion::Descriptor(self.target, protocol::cccd_uuid())
            }
        }
    }

    fn submit(&self, transport: &mut dyn Transport, link: LinkHandle) -> Result<(), TransportError> {
        match &self.request {
            OperationRequest::Read => transport.submit_read(link, &self.target),
            OperationRequest::Write {
                value,
                with_response,
            } => transport.submit_write(link, &self.target, value, *with_response),
            OperationRequest::SetNotify {
                enabled,
                descriptor_value,
            } => {
                transport.submit_set_notify(link, &self.target, *enabled)?;
                transport.submit_descriptor_write(
                    link,
                    &self.target,
                    protocol::cccd_uuid(),
                    descriptor_value,
                )
            }
        }
    }
}

/// A completion callback, reduced to what is needed for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Read(CharacteristicKey),
    Write(CharacteristicKey),
    Descriptor(CharacteristicKey, Uuid),
}

#[derive(Debug)]
enum InFlight {
    Active {
        op: PendingOperation,
        deadline: Instant,
    },
    /// Timed out on our side but still outstanding at the radio. Holds the
    /// slot until the late completion arrives or a second bound passes.
    Abandoned {
        completion: Completion,
        deadline: Instant,
    },
}

impl InFlight {
    fn deadline(&self) -> Instant {
        match self {
            Self::Active { deadline, .. } | Self::Abandoned { deadline, .. } => *deadline,
        }
    }

    fn expects(&self, completion: Completion) -> bool {
        match self {
            Self::Active { op, .. } => op.expected_completion() == completion,
            Self::Abandoned {
                completion: expected,
                ..
            } => *expected == completion,
        }
    }
}

/// How a completion callback relates to the in-flight slot.
#[derive(Debug)]
pub enum Matched {
    Operation(PendingOperation),
    /// Late reply to a timed-out operation; the slot is free again.
    Abandoned,
    Unmatched,
}

/// What passed its deadline on `expire`.
#[derive(Debug)]
pub enum Expired {
    Nothing,
    /// The caller's wait is over; the radio still owes a reply.
    Operation(PendingOperation),
    /// The radio never answered an abandoned operation.
    Stalled,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    waiting: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PendingOperation) {
        debug!("Queued {} {} (#{})", op.kind(), op.target, op.id);
        self.waiting.push_back(op);
    }

    /// Submit the head if nothing is in flight.
    ///
    /// Operations the transport refuses are returned with their error; the
    /// next head is tried until one is accepted or the queue is empty.
    pub fn pump(
        &mut self,
        transport: &mut dyn Transport,
        link: LinkHandle,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(PendingOperation, BleError)> {
        let mut refused = Vec::new();
        while self.in_flight.is_none() {
            let Some(op) = self.waiting.pop_front() else {
                break;
            };
            match op.submit(transport, link) {
                Ok(()) => {
                    debug!("Submitted {} {} (#{})", op.kind(), op.target, op.id);
                    self.in_flight = Some(InFlight::Active {
                        op,
                        deadline: now + timeout,
                    });
                }
                Err(e) => refused.push((op, e.into_rejection())),
            }
        }
        refused
    }

    /// Release the in-flight slot if the completion belongs to it.
    pub fn complete(&mut self, completion: Completion) -> Matched {
        if !self.in_flight.as_ref().is_some_and(|f| f.expects(completion)) {
            return Matched::Unmatched;
        }
        match self.in_flight.take() {
            Some(InFlight::Active { op, .. }) => Matched::Operation(op),
            Some(InFlight::Abandoned { .. }) => Matched::Abandoned,
            None => Matched::Unmatched,
        }
    }

    /// Expire the in-flight slot if its deadline has passed.
    ///
    /// A timed-out operation keeps the slot for another `timeout` so nothing
    /// new reaches the radio while it may still answer.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Expired {
        if !self.in_flight.as_ref().is_some_and(|f| f.deadline() <= now) {
            return Expired::Nothing;
        }
        match self.in_flight.take() {
            Some(InFlight::Active { op, .. }) => {
                self.in_flight = Some(InFlight::Abandoned {
                    completion: op.expected_completion(),
                    deadline: now + timeout,
                });
                Expired::Operation(op)
            }
            Some(InFlight::Abandoned { .. }) => Expired::Stalled,
            None => Expired::Nothing,
        }
    }

    /// Empty the queue, in-flight operation first, then in FIFO order.
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        let mut ops: Vec<_> = match self.in_flight.take() {
            Some(InFlight::Active { op, .. }) => vec![op],
            _ => Vec::new(),
        };
        ops.extend(self.waiting.drain(..));
        ops
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(InFlight::deadline)
    }

    /// The caller operation currently at the radio, if any.
    pub fn in_flight(&self) -> Option<&PendingOperation> {
        match &self.in_flight {
            Some(InFlight::Active { op, .. }) => Some(op),
            _ => None,
        }
    }

    /// Caller operations not yet resolved.
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight().is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
