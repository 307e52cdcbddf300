//! Forward record state machine and retry backoff.
//!
//! ```text
//! PendingNew ──ok──→ SentOk
//!     │ err
//!     ▼
//! PendingRetry ──ok──→ SentOk
//!     │ tries >= max_tries
//!     ▼
//! FailingOver ──ok──→ SentOk
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    /// Created, never attempted.
    PendingNew,
    /// Attempted and failed; more attempts allowed on the primary destination.
    PendingRetry,
    /// Out of tries; the next attempt goes to the failure destination.
    FailingOver,
    /// Delivered. Terminal.
    SentOk,
}

impl ForwardState {
    pub fn of(success: bool, tries: i64, max_tries: i64) -> Self {
        if success {
            ForwardState::SentOk
        } else if tries == 0 {
            ForwardState::PendingNew
        } else if tries >= max_tries {
            ForwardState::FailingOver
        } else {
            ForwardState::PendingRetry
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ForwardState::SentOk
    }

    /// Whether the next attempt should target the failure destination.
    pub fn uses_failure_destination(self) -> bool {
        self == ForwardState::FailingOver
    }
}

/// Backoff after `tries` failed attempts: `retry_frequency * tries²`, capped at
/// `max_retry_delay`.
pub fn retry_delay_ms(tries: i64, retry_frequency_ms: i64, max_retry_delay_ms: i64) -> i64 {
    let tries = tries.max(0);
    retry_frequency_ms
        .saturating_mul(tries.saturating_mul(tries))
        .min(max_retry_delay_ms)
}

/// Whether a record last tried at `last_try_ms` may be attempted at `now_ms`.
pub fn is_retry_due(
    now_ms: i64,
    last_try_ms: i64,
    tries: i64,
    retry_frequency_ms: i64,
    max_retry_delay_ms: i64,
) -> bool {
    now_ms >= last_try_ms.saturating_add(retry_delay_ms(tries, retry_frequency_ms, max_retry_delay_ms))
}
