use std::fmt;

/// Error taxonomy for the sync engine. Kinds, not concrete causes: callers
/// attach a kind to an `anyhow::Error` via `.context()` or construct one
/// directly, then classify at retry/dispatch sites with
/// `err.downcast_ref::<SyncErrorKind>()`, the same marker-error pattern the
/// workspace lock uses for `WorkspaceLockedError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Network timeout, 5xx, retryable disk-full. Retried locally with
    /// exponential backoff, capped at 10 attempts per operation.
    Transient(String),
    /// Etag mismatch, ACL denied, path not allowed by subscription.
    /// Causes a re-reconcile, never a retry.
    Precondition(String),
    /// Malformed ACL/subscription, oversize frame. Surfaced in
    /// control-plane status and quarantined until the file changes.
    Invalid(String),
    /// Diverged content; handed to the Conflict Resolver.
    Conflict(String),
    /// Watcher lost, session corrupt. Triggers full resync of the scope.
    Lost(String),
    /// User-initiated; final and silent.
    Cancelled,
}

impl SyncErrorKind {
    pub fn transient(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Transient(msg.into()))
    }

    pub fn precondition(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Precondition(msg.into()))
    }

    pub fn invalid(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Invalid(msg.into()))
    }

    pub fn conflict(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Conflict(msg.into()))
    }

    pub fn lost(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Lost(msg.into()))
    }

    pub fn cancelled() -> anyhow::Error {
        anyhow::Error::new(SyncErrorKind::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncErrorKind::Transient(_))
    }

    /// Classify an HTTP status the way the relay client does: 5xx and 429
    /// are transient, 412/409/428 are preconditions, everything else is
    /// left to the caller (often `Invalid`).
    pub fn from_http_status(status: u16, body: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::classify_http_status(status, body))
    }

    /// Same classification as `from_http_status`, returning the bare kind
    /// so callers can attach it as `.context()` on their own error object
    /// (e.g. to keep both the kind and a status-carrying error downcastable).
    pub fn classify_http_status(status: u16, body: impl Into<String>) -> SyncErrorKind {
        let body = body.into();
        if status == 429 || (500..600).contains(&status) {
            SyncErrorKind::Transient(format!("http {status}: {body}"))
        } else if status == 412 || status == 409 || status == 428 || status == 403 || status == 401
        {
            SyncErrorKind::Precondition(format!("http {status}: {body}"))
        } else {
            SyncErrorKind::Invalid(format!("http {status}: {body}"))
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErrorKind::Transient(m) => write!(f, "transient: {m}"),
            SyncErrorKind::Precondition(m) => write!(f, "precondition failed: {m}"),
            SyncErrorKind::Invalid(m) => write!(f, "invalid: {m}"),
            SyncErrorKind::Conflict(m) => write!(f, "conflict: {m}"),
            SyncErrorKind::Lost(m) => write!(f, "lost: {m}"),
            SyncErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for SyncErrorKind {}

/// Find a `SyncErrorKind` anywhere in an anyhow error's cause chain.
pub fn classify(err: &anyhow::Error) -> Option<&SyncErrorKind> {
    for cause in err.chain() {
        if let Some(k) = cause.downcast_ref::<SyncErrorKind>() {
            return Some(k);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        let err = SyncErrorKind::from_http_status(503, "unavailable");
        assert!(matches!(
            classify(&err),
            Some(SyncErrorKind::Transient(_))
        ));

        let err = SyncErrorKind::from_http_status(412, "etag mismatch");
        assert!(matches!(
            classify(&err),
            Some(SyncErrorKind::Precondition(_))
        ));

        let err = SyncErrorKind::from_http_status(418, "teapot");
        assert!(matches!(classify(&err), Some(SyncErrorKind::Invalid(_))));
    }

    #[test]
    fn classify_finds_wrapped_kind() {
        let base = SyncErrorKind::transient("timeout");
        let wrapped = base.context("uploading part 3");
        assert!(classify(&wrapped).unwrap().is_retryable());
    }
}
