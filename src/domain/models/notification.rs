//! Parsed invocation-cache notifications.
//!
//! The cache publishes raw aggregate updates; the listener parses them into
//! this envelope before routing. Terminal-vs-progress ordering per
//! invocation is preserved by the single-threaded listener.

use uuid::Uuid;

/// Event type carried by a cache notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    InvocationCreated,
    InvocationCompleted,
    InvocationCanceled,
    InvocationFailed,
    TaskSucceeded,
    TaskFailed,
    /// Anything the controller does not react to.
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvocationCreated => "invocation_created",
            Self::InvocationCompleted => "invocation_completed",
            Self::InvocationCanceled => "invocation_canceled",
            Self::InvocationFailed => "invocation_failed",
            Self::TaskSucceeded => "task_succeeded",
            Self::TaskFailed => "task_failed",
            Self::Other(name) => name,
        }
    }

    /// Whether this event moves the invocation to a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvocationCompleted | Self::InvocationCanceled | Self::InvocationFailed
        )
    }

    /// Whether this event should trigger a new evaluation.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::InvocationCreated | Self::TaskSucceeded | Self::TaskFailed
        )
    }
}

/// One update published by the invocation cache.
#[derive(Debug, Clone)]
pub struct CacheNotification {
    pub kind: NotificationKind,
    pub invocation_id: Uuid,
    /// Upstream tracing span, attached to the evaluation state on first
    /// creation so evaluations appear as children of the source event.
    pub span: Option<tracing::Span>,
}

impl CacheNotification {
    pub fn new(kind: NotificationKind, invocation_id: Uuid) -> Self {
        Self {
            kind,
            invocation_id,
            span: None,
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_progress_are_disjoint() {
        let kinds = [
            NotificationKind::InvocationCreated,
            NotificationKind::InvocationCompleted,
            NotificationKind::InvocationCanceled,
            NotificationKind::InvocationFailed,
            NotificationKind::TaskSucceeded,
            NotificationKind::TaskFailed,
            NotificationKind::Other("heartbeat".into()),
        ];
        for kind in kinds {
            assert!(
                !(kind.is_terminal() && kind.is_progress()),
                "{} is both terminal and progress",
                kind.as_str()
            );
        }
    }
}
