//! Architect effects: async request/response behind a call-and-return shape
//!
//! A handler that needs the architect builds an `Effect`, and the runtime
//! sends the outbound envelope and blocks until the correlated reply
//! arrives. Exactly one effect may be in flight per agent; replies are
//! matched by correlation id and message type, and anything unmatched is an
//! invariant violation. A duplicate of the previously completed reply is
//! dropped so redelivery cannot mutate state twice.

use crate::message::{ApprovalType, Envelope, MessageType, Payload, QuestionPayload, ReviewResult};
use crate::workflow::{PendingApproval, PendingMerge, PendingQuestion};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What kind of exchange an effect is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Question,
    Approval,
    Merge,
}

/// An outbound request awaiting a correlated reply
#[derive(Debug, Clone)]
pub enum Effect {
    Question {
        correlation_id: Uuid,
        payload: QuestionPayload,
    },
    Approval {
        correlation_id: Uuid,
        approval_type: ApprovalType,
        content: Value,
    },
    Merge {
        correlation_id: Uuid,
        story_id: String,
        workspace_path: String,
    },
}

impl Effect {
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Effect::Question { correlation_id, .. }
            | Effect::Approval { correlation_id, .. }
            | Effect::Merge { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Question { .. } => EffectKind::Question,
            Effect::Approval { .. } => EffectKind::Approval,
            Effect::Merge { .. } => EffectKind::Merge,
        }
    }
}

impl From<&PendingQuestion> for Effect {
    fn from(pending: &PendingQuestion) -> Self {
        Effect::Question {
            correlation_id: pending.correlation_id,
            payload: pending.payload.clone(),
        }
    }
}

impl From<&PendingApproval> for Effect {
    fn from(pending: &PendingApproval) -> Self {
        Effect::Approval {
            correlation_id: pending.correlation_id,
            approval_type: pending.approval_type,
            content: pending.content.clone(),
        }
    }
}

impl From<&PendingMerge> for Effect {
    fn from(pending: &PendingMerge) -> Self {
        Effect::Merge {
            correlation_id: pending.correlation_id,
            story_id: pending.story_id.clone(),
            workspace_path: pending.workspace_path.clone(),
        }
    }
}

/// The correlated reply
#[derive(Debug, Clone, PartialEq)]
pub enum EffectReply {
    Answer { text: String },
    Review(ReviewResult),
}

/// Effect runtime errors
#[derive(Debug, Error)]
pub enum EffectError {
    #[error("an effect is already in flight ({0:?})")]
    AlreadyInFlight(EffectKind),
    #[error("no effect is in flight")]
    NotInFlight,
    #[error("effect timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled while waiting for a reply")]
    Cancelled,
    #[error("reply channel closed")]
    ReplyChannelClosed,
    #[error("outbound channel closed")]
    OutboundClosed,
    #[error("correlation mismatch: expected {expected}, got {got} ({msg_type:?})")]
    CorrelationMismatch {
        expected: Uuid,
        got: Uuid,
        msg_type: MessageType,
    },
    #[error("reply payload does not match a {kind:?} effect")]
    PayloadMismatch { kind: EffectKind },
}

impl EffectError {
    /// Timeouts and service loss are transient; everything else is fatal
    /// for the running story.
    pub fn is_transient(&self) -> bool {
        matches!(self, EffectError::Timeout(_) | EffectError::ReplyChannelClosed)
    }
}

/// Owns the single in-flight exchange with the architect
pub struct EffectRuntime {
    agent_id: String,
    architect_id: String,
    outbound: mpsc::Sender<Envelope>,
    in_flight: Option<(Uuid, EffectKind)>,
    last_completed: Option<Uuid>,
}

impl EffectRuntime {
    pub fn new(
        agent_id: impl Into<String>,
        architect_id: impl Into<String>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            architect_id: architect_id.into(),
            outbound,
            in_flight: None,
            last_completed: None,
        }
    }

    pub fn in_flight(&self) -> Option<(Uuid, EffectKind)> {
        self.in_flight
    }

    fn envelope_for(&self, effect: &Effect) -> Envelope {
        match effect {
            Effect::Question {
                correlation_id,
                payload,
            } => Envelope::question(
                &self.agent_id,
                &self.architect_id,
                *correlation_id,
                payload.clone(),
            ),
            Effect::Approval {
                correlation_id,
                approval_type,
                content,
            } => Envelope::approval_request(
                &self.agent_id,
                &self.architect_id,
                *correlation_id,
                *approval_type,
                content.clone(),
            ),
            Effect::Merge {
                correlation_id,
                story_id,
                workspace_path,
            } => Envelope::merge_request(
                &self.agent_id,
                &self.architect_id,
                *correlation_id,
                story_id,
                workspace_path,
            ),
        }
    }

    /// Send the outbound request and record it as in flight. Starting a
    /// second effect while one is outstanding is a programming error.
    pub async fn begin(&mut self, effect: &Effect) -> Result<(), EffectError> {
        if let Some((_, kind)) = self.in_flight {
            return Err(EffectError::AlreadyInFlight(kind));
        }
        let envelope = self.envelope_for(effect);
        tracing::debug!(
            agent_id = %self.agent_id,
            correlation_id = %effect.correlation_id(),
            kind = ?effect.kind(),
            "sending effect request"
        );
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| EffectError::OutboundClosed)?;
        self.in_flight = Some((effect.correlation_id(), effect.kind()));
        Ok(())
    }

    /// Block until the correlated reply arrives, the deadline expires, or
    /// the context is cancelled. A mismatched reply is fatal; a duplicate
    /// of the previously completed correlation id is dropped.
    pub async fn wait(
        &mut self,
        reply_rx: &mut mpsc::Receiver<Envelope>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<EffectReply, EffectError> {
        let Some((expected, kind)) = self.in_flight else {
            return Err(EffectError::NotInFlight);
        };
        let deadline_at = Instant::now() + deadline;

        loop {
            let envelope = tokio::select! {
                () = cancel.cancelled() => return Err(EffectError::Cancelled),
                () = tokio::time::sleep_until(deadline_at) => {
                    return Err(EffectError::Timeout(deadline));
                }
                received = reply_rx.recv() => {
                    received.ok_or(EffectError::ReplyChannelClosed)?
                }
            };

            if Some(envelope.correlation_id) == self.last_completed {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    correlation_id = %envelope.correlation_id,
                    "dropping duplicate reply for a completed effect"
                );
                continue;
            }
            if envelope.correlation_id != expected {
                return Err(EffectError::CorrelationMismatch {
                    expected,
                    got: envelope.correlation_id,
                    msg_type: envelope.msg_type,
                });
            }

            let reply = match (kind, envelope.msg_type, envelope.payload) {
                (EffectKind::Question, MessageType::Answer, Payload::Answer { text }) => {
                    EffectReply::Answer { text }
                }
                (
                    EffectKind::Approval | EffectKind::Merge,
                    MessageType::Result,
                    Payload::Result(result),
                ) => EffectReply::Review(result),
                _ => return Err(EffectError::PayloadMismatch { kind }),
            };

            self.in_flight = None;
            self.last_completed = Some(expected);
            return Ok(reply);
        }
    }

    /// Send and wait in one call
    pub async fn execute(
        &mut self,
        effect: &Effect,
        reply_rx: &mut mpsc::Receiver<Envelope>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<EffectReply, EffectError> {
        self.begin(effect).await?;
        self.wait(reply_rx, deadline, cancel).await
    }
}
