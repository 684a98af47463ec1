use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The kind of mutating action an operation performs against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    CreateBooking,
    UpdateBooking,
    CancelBooking,
    UpdateProfile,
    SyncLocation,
    Custom,
}

impl From<&str> for OperationType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "create_booking" => Self::CreateBooking,
            "update_booking" => Self::UpdateBooking,
            "cancel_booking" => Self::CancelBooking,
            "update_profile" => Self::UpdateProfile,
            "sync_location" => Self::SyncLocation,
            _ => Self::Custom,
        }
    }
}

impl From<OperationType> for String {
    fn from(kind: OperationType) -> Self {
        match kind {
            OperationType::CreateBooking => "create_booking".to_string(),
            OperationType::UpdateBooking => "update_booking".to_string(),
            OperationType::CancelBooking => "cancel_booking".to_string(),
            OperationType::UpdateProfile => "update_profile".to_string(),
            OperationType::SyncLocation => "sync_location".to_string(),
            OperationType::Custom => "custom".to_string(),
        }
    }
}

/// Lifecycle state of a queued operation.
///
/// Completed, Failed and Cancelled are terminal; a Failed operation only
/// re-enters the queue through an explicit resubmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<&str> for OperationStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending, // Default to pending for unknown values
        }
    }
}

impl From<OperationStatus> for String {
    fn from(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Pending => "pending".to_string(),
            OperationStatus::InProgress => "in_progress".to_string(),
            OperationStatus::Completed => "completed".to_string(),
            OperationStatus::Failed => "failed".to_string(),
            OperationStatus::Cancelled => "cancelled".to_string(),
        }
    }
}

/// A durable record of a write the client intends to replay against the
/// backend. The payload is opaque JSON owned by the domain layer; the queue
/// only cares about ordering, status and the retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique identifier, generated at enqueue time. Doubles as the
    /// idempotency key for every network attempt.
    pub id: String,
    pub operation_type: OperationType,
    /// Serialized operation-specific data, opaque to the queue.
    pub payload: String,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Last failure description, set on failed attempts.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Lower value is processed sooner; ties broken by created_at ascending.
    pub priority: i32,
    /// Correlation key used to serialize operations targeting the same
    /// logical entity (e.g. a booking id).
    pub related_entity_id: Option<String>,
}

impl PendingOperation {
    pub fn new(operation_type: OperationType, payload: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            payload,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: 5,
            error_message: None,
            created_at: Utc::now(),
            last_attempt_at: None,
            priority: 10,
            related_entity_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.related_entity_id = Some(entity_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The idempotency key sent with every network attempt for this
    /// operation. Derived from the id and never regenerated, so retries
    /// cannot create duplicate server-side effects.
    pub fn idempotency_key(&self) -> &str {
        &self.id
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Retry strategy with exponential backoff and jitter.
///
/// The deterministic part (`delay_for`) gates when a failed operation becomes
/// eligible again; the jittered part (`jittered_delay`) spaces out drain
/// cycles so concurrent clients do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Base delay in seconds for exponential backoff
    pub base_delay_seconds: u64,
    /// Maximum delay in seconds (cap for exponential growth)
    pub max_delay_seconds: u64,
    /// Upper bound of the random jitter added between drain cycles
    pub jitter_seconds: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 2,
            max_delay_seconds: 300,
            jitter_seconds: 5,
        }
    }
}

impl RetryStrategy {
    /// Deterministic backoff delay before attempt `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(16); // avoid overflow on pathological counts
        let delay = self
            .base_delay_seconds
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_seconds);
        Duration::from_secs(delay)
    }

    /// Backoff with `random(0, jitter)` added, used when scheduling the next
    /// drain cycle after failures.
    pub fn jittered_delay(&self, retry_count: u32) -> Duration {
        let jitter = if self.jitter_seconds > 0 {
            Duration::from_millis(rand::random::<u64>() % (self.jitter_seconds * 1000))
        } else {
            Duration::ZERO
        };
        self.delay_for(retry_count) + jitter
    }

    /// Whether a failed operation is eligible for another attempt at `now`.
    pub fn eligible(
        &self,
        retry_count: u32,
        last_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match last_attempt_at {
            None => true,
            Some(last) => {
                let delay = chrono::Duration::from_std(self.delay_for(retry_count))
                    .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay_seconds as i64));
                now >= last + delay
            }
        }
    }
}
