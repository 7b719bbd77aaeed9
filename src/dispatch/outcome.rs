use crate::max::MaxApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    Empty,
    Unsupported,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::Empty => "empty",
            SkipReason::Unsupported => "unsupported",
        }
    }
}

/// Per-link result of pushing one post to its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: String, latency_ms: i64 },
    Skipped(SkipReason),
    Failed(String),
}

impl SendOutcome {
    pub fn from_error(err: &MaxApiError) -> Self {
        if err.is_unsupported() {
            SendOutcome::Skipped(SkipReason::Unsupported)
        } else {
            SendOutcome::Failed(err.to_string())
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}
