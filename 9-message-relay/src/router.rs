use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, field, info, warn};

use crate::{
    backend::{BackendClient, BackendError, Participants},
    event::{self, DecodeError, EventKind, Id, OutboundEvent},
    registry::{Connection, Frame, Push, Registry},
};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed frame: {0}")]
    Decode(#[source] DecodeError),
    #[error("ignored unknown event kind `{0}`")]
    UnknownKind(String),
    #[error("{kind} event failed: {source}")]
    Backend {
        kind: EventKind,
        conversation: Option<Id>,
        source: BackendError,
    },
    #[error("failed to encode outbound {kind} payload: {source}")]
    Encode {
        kind: EventKind,
        source: serde_json::Error,
    },
}

impl From<DecodeError> for RouteError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownKind(kind) => RouteError::UnknownKind(kind),
            other => RouteError::Decode(other),
        }
    }
}

impl RouteError {
    /// Short reason reported to the sender, if the sender is told at all.
    pub fn client_reason(&self) -> Option<&'static str> {
        match self {
            RouteError::Decode(_) => Some("malformed_frame"),
            RouteError::UnknownKind(_) => None,
            RouteError::Backend { source, .. } if source.is_contract() => Some("backend_contract"),
            RouteError::Backend { .. } => Some("backend_unavailable"),
            RouteError::Encode { .. } => Some("internal"),
        }
    }

    pub fn conversation(&self) -> Option<&Id> {
        match self {
            RouteError::Backend { conversation, .. } => conversation.as_ref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            RouteError::Decode(DecodeError::InvalidEnvelope { kind, .. }) => Some(*kind),
            RouteError::Backend { kind, .. } | RouteError::Encode { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// What happened to one fanned-out payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// Frames queued on an open target connection.
    pub delivered: usize,
    /// Targets with no open connection.
    pub skipped: usize,
    /// Targets whose outbound queue was full.
    pub dropped: usize,
}

/// Forwards each inbound event to the backend, then pushes the derived
/// payload to both conversation participants.
pub struct EventRouter {
    registry: Arc<Registry>,
    backend: BackendClient,
    error_frames: bool,
}

impl EventRouter {
    pub fn new(registry: Arc<Registry>, backend: BackendClient, error_frames: bool) -> Self {
        Self {
            registry,
            backend,
            error_frames,
        }
    }

    /// Routes one frame from `origin`, logging failures instead of returning
    /// them. Nothing here closes the origin connection.
    pub async fn handle(&self, origin: &Connection, frame: &[u8]) {
        match self.route(origin, frame).await {
            Ok(report) => debug!(
                device_id = origin.device_id(),
                delivered = report.delivered,
                skipped = report.skipped,
                dropped = report.dropped,
                "event relayed"
            ),
            Err(RouteError::UnknownKind(kind)) => {
                info!(device_id = origin.device_id(), %kind, "ignoring unknown event kind");
            }
            Err(err) => {
                warn!(
                    device_id = origin.device_id(),
                    kind = err.kind().map_or("unknown", EventKind::as_str),
                    conversation_id = err.conversation().map(field::display),
                    error = %err,
                    "dropping event"
                );
                self.notify_sender(origin, &err);
            }
        }
    }

    pub async fn route(&self, origin: &Connection, frame: &[u8]) -> Result<FanoutReport, RouteError> {
        let event = event::decode(frame)?;
        let kind = event.kind();

        let participants = self
            .backend
            .forward(&event.backend_request())
            .await
            .map_err(|source| RouteError::Backend {
                kind,
                conversation: event.conversation_id().cloned(),
                source,
            })?;

        let payload = event
            .outbound(origin.device_id())
            .encode()
            .map_err(|source| RouteError::Encode { kind, source })?;

        Ok(self.fan_out(&participants, &payload))
    }

    /// Pushes `payload` to the open connections of both participants. A
    /// participant holding both roles gets the frame once.
    pub fn fan_out(&self, participants: &Participants, payload: &str) -> FanoutReport {
        let mut report = FanoutReport::default();
        let user = self.registry.lookup_by_user(&participants.user_id.to_string());
        let admin = self.registry.lookup_by_user(&participants.admin_id.to_string());

        let admin = match (&user, admin) {
            (Some(user), Some(admin)) if user.id() == admin.id() => None,
            (_, admin) => admin,
        };

        for target in [user, admin] {
            let Some(target) = target else {
                report.skipped += 1;
                continue;
            };
            match target.push(Frame::Text(payload.to_string())) {
                Push::Queued => report.delivered += 1,
                Push::Closed => report.skipped += 1,
                Push::Full => {
                    warn!(
                        user_id = target.user_id(),
                        device_id = target.device_id(),
                        "outbound queue full, dropping frame"
                    );
                    report.dropped += 1;
                }
            }
        }

        report
    }

    fn notify_sender(&self, origin: &Connection, err: &RouteError) {
        if !self.error_frames {
            return;
        }
        let Some(reason) = err.client_reason() else {
            return;
        };

        let notice = OutboundEvent::Error {
            reason: reason.to_string(),
            event: err.kind().map(|kind| kind.as_str().to_string()),
        };
        match notice.encode() {
            Ok(text) => {
                if origin.push(Frame::Text(text)) != Push::Queued {
                    debug!(device_id = origin.device_id(), "could not queue error frame");
                }
            }
            Err(err) => debug!(?err, "failed to encode error frame"),
        }
    }
}
