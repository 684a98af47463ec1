//! HaulSync client core
//!
//! Offline-first operation queue and concurrency-safe token lifecycle for
//! the HaulSync truck booking platform. Booking mutations made while offline
//! are persisted to a durable SQLite queue and drained against the backend
//! once connectivity returns, with single-flight token refresh so concurrent
//! requests never consume the same refresh token twice.

pub mod api;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod logger;
pub mod operation;
pub mod queue;
pub mod sync;
pub mod token;

// Re-export commonly used types for easier access
pub use api::{ApiClient, ApiError, ResilientClient};
pub use cli::Cli;
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use operation::{OperationStatus, OperationType, PendingOperation, RetryStrategy};
pub use queue::{OperationStore, QueueStats};
pub use sync::{DrainResult, SyncConfig, SyncManager};
pub use token::TokenManager;
