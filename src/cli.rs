use clap::{Parser, Subcommand};

/// Offline-first sync client for the HaulSync truck booking platform
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Optional config file. Defaults to '~/.haulsync.cfg'.
    #[arg(long, default_value = "~/.haulsync.cfg", global = true)]
    pub config: String,

    /// API base url. Overrides api_url from the config file.
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Turns on debug messages in the log file.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in with phone number and OTP
    Login {
        /// Phone number in E.164 format
        phone: String,
        /// One-time password received via SMS
        otp: String,
    },
    /// Sign out and erase stored credentials
    Logout,
    /// Add an operation to the durable queue
    Enqueue {
        /// Operation type: create_booking, update_booking, cancel_booking,
        /// update_profile, sync_location or custom
        operation_type: String,
        /// JSON payload sent to the backend as-is
        payload: String,
        /// Lower value drains first
        #[arg(long, default_value = "10")]
        priority: i32,
        /// Entity id; operations on the same entity are applied in order
        #[arg(long)]
        entity: Option<String>,
        /// Retry budget before the operation fails terminally
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Drain the queue against the backend once
    Sync {
        /// Drain even when the connectivity probe says offline
        #[arg(long)]
        force: bool,
    },
    /// Run the background drain loop until interrupted
    Watch,
    /// Show queue and session status
    Status,
    /// Return failed operations to the queue with a fresh retry budget
    Retry {
        /// Operation id; omit with --all to retry everything
        id: Option<String>,
        /// Retry all failed operations
        #[arg(long)]
        all: bool,
    },
    /// Cancel a pending or failed operation
    Cancel {
        /// Operation id
        id: String,
    },
    /// Delete old completed, failed and cancelled operations
    Cleanup {
        /// Minimum age in days; 0 deletes all terminal operations
        #[arg(long, default_value = "7")]
        days: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::parse_from([
            "haulsync",
            "enqueue",
            "create_booking",
            r#"{"pickup":"a"}"#,
            "--priority",
            "5",
            "--entity",
            "booking-1",
        ]);
        match cli.command {
            Command::Enqueue {
                operation_type,
                payload,
                priority,
                entity,
                max_retries,
            } => {
                assert_eq!(operation_type, "create_booking");
                assert_eq!(payload, r#"{"pickup":"a"}"#);
                assert_eq!(priority, 5);
                assert_eq!(entity.as_deref(), Some("booking-1"));
                assert!(max_retries.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sync_force() {
        let cli = Cli::parse_from(["haulsync", "sync", "--force"]);
        assert!(matches!(cli.command, Command::Sync { force: true }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["haulsync", "status", "--verbose", "--config", "/tmp/h.cfg"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, "/tmp/h.cfg");
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_parse_retry_all() {
        let cli = Cli::parse_from(["haulsync", "retry", "--all"]);
        match cli.command {
            Command::Retry { id, all } => {
                assert!(id.is_none());
                assert!(all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
