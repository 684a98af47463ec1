use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haulsync::api::{ApiClient, ResilientClient};
use haulsync::cli::{Cli, Command};
use haulsync::config::Config;
use haulsync::connectivity::ConnectivityMonitor;
use haulsync::credentials::FileCredentialStore;
use haulsync::operation::{OperationType, PendingOperation};
use haulsync::queue::OperationStore;
use haulsync::sync::SyncManager;
use haulsync::token::TokenManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("Failed to load configuration")?;
    // Debug logging can come from the flag or the config file.
    let _guard =
        haulsync::logger::setup_logging(cli.verbose || config.debug, config.log_file.as_deref())
            .context("Failed to set up logging")?;

    let api_url = config.get_api_url(cli.api_url.as_ref());
    let db_path = match &config.queue_db {
        Some(path) => PathBuf::from(path),
        None => OperationStore::default_db_path()?,
    };

    let credential_store = Arc::new(FileCredentialStore::new()?);
    let tokens = Arc::new(TokenManager::new(credential_store));
    tokens
        .load_from_store()
        .await
        .context("Failed to load stored credentials")?;

    let api = ApiClient::new(api_url);
    let client = Arc::new(ResilientClient::new(api.clone(), Arc::clone(&tokens)));
    let connectivity = ConnectivityMonitor::new();
    let manager = Arc::new(SyncManager::with_config(
        config.sync_config.clone(),
        Arc::clone(&client),
        Arc::clone(&connectivity),
        db_path.clone(),
    ));

    match cli.command {
        Command::Login { phone, otp } => {
            client
                .login(&phone, &otp)
                .await
                .context("Login failed")?;
            println!("Signed in as {}", phone);
        }
        Command::Logout => {
            client.logout().await.context("Logout failed")?;
            println!("Signed out");
        }
        Command::Enqueue {
            operation_type,
            payload,
            priority,
            entity,
            max_retries,
        } => {
            serde_json::from_str::<serde_json::Value>(&payload)
                .context("Payload is not valid JSON")?;

            let mut op = PendingOperation::new(
                OperationType::from(operation_type.as_str()),
                payload,
            )
            .with_priority(priority);
            if let Some(entity) = entity {
                op = op.with_entity(entity);
            }
            if let Some(max_retries) = max_retries {
                op = op.with_max_retries(max_retries);
            }

            let id = op.id.clone();
            let store = OperationStore::open(db_path)?;
            store.enqueue(&op)?;
            println!("Queued {} as {}", operation_type, id);
        }
        Command::Sync { force } => {
            let online = api.check_connectivity().await;
            connectivity.set_online(online);

            let result = if force {
                manager.force_drain().await?
            } else {
                manager.drain().await?
            };

            if result.skipped_offline {
                println!("Offline, nothing synced (use --force to override)");
            } else {
                println!(
                    "Synced {} of {} operations ({} retried, {} failed, {} reclaimed)",
                    result.completed,
                    result.attempted,
                    result.retried,
                    result.failed,
                    result.reclaimed
                );
            }
            if result.session_expired {
                println!("Session expired: run 'haulsync login' to re-authenticate");
            }
        }
        Command::Watch => {
            connectivity.start_probing(
                api.clone(),
                Duration::from_secs(config.probe_interval_seconds),
            );
            manager.start_background();

            let mut expiry = manager.subscribe_session_expiry();
            println!("Watching queue; press Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("Stopping");
                        break;
                    }
                    changed = expiry.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *expiry.borrow() {
                            eprintln!("Session expired: run 'haulsync login' to re-authenticate");
                        }
                    }
                }
            }
        }
        Command::Status => {
            match tokens.current().await {
                Some(session) => {
                    let phone = session.user_phone.as_deref().unwrap_or("unknown");
                    let state = if session.is_usable() {
                        "active"
                    } else if session.is_expired() {
                        "expired"
                    } else {
                        "refresh required"
                    };
                    println!("Session: {} ({})", phone, state);
                }
                None => println!("Session: signed out"),
            }

            let stats = manager.status().await?;
            println!("Queue:");
            println!("  Pending: {}", stats.pending);
            println!("  In progress: {}", stats.in_progress);
            println!("  Completed: {}", stats.completed);
            println!("  Failed: {}", stats.failed);
            println!("  Cancelled: {}", stats.cancelled);
            println!("  Total: {}", stats.total);
        }
        Command::Retry { id, all } => {
            let store = OperationStore::open(db_path)?;
            if all {
                let failed = store.failed_operations()?;
                let mut requeued = 0;
                for op in failed {
                    if store.resubmit(&op.id)? {
                        requeued += 1;
                    }
                }
                println!("Requeued {} operations", requeued);
            } else if let Some(id) = id {
                if store.resubmit(&id)? {
                    println!("Requeued {}", id);
                } else {
                    bail!("operation {} is not in a failed state", id);
                }
            } else {
                bail!("provide an operation id or --all");
            }
        }
        Command::Cancel { id } => {
            let store = OperationStore::open(db_path)?;
            if store.cancel(&id)? {
                println!("Cancelled {}", id);
            } else {
                bail!("operation {} is not pending or failed", id);
            }
        }
        Command::Cleanup { days } => {
            let removed = manager.cleanup(days).await?;
            println!("Removed {} terminal operations", removed);
        }
    }

    Ok(())
}
