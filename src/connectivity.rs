use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::ApiClient;

/// Tracks network reachability and publishes transitions to subscribers.
///
/// The actual reachability source is external: the mobile shell pushes
/// platform signals through `set_online`, and `start_probing` adds a
/// periodic HEAD probe against the API for environments without one.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new() -> Arc<Self> {
        // Start as disconnected until a signal or probe says otherwise.
        let (tx, _rx) = watch::channel(false);
        Arc::new(Self {
            online: AtomicBool::new(false),
            tx,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Feed an external reachability signal. Subscribers are only woken on
    /// actual transitions.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(
                online = online,
                "Connectivity transition: {}",
                if online { "offline -> online" } else { "online -> offline" }
            );
            let _ = self.tx.send(online);
        }
    }

    /// Watch channel carrying the current online state; `changed().await`
    /// wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically probe the API server and feed the result into the
    /// monitor. Runs until the process exits.
    pub fn start_probing(self: &Arc<Self>, api_client: ApiClient, interval: Duration) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reachable = api_client.check_connectivity().await;
                monitor.set_online(reachable);
                tracing::debug!(
                    reachable = reachable,
                    "Connectivity probe completed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_offline() {
        let monitor = ConnectivityMonitor::new();
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_transition_wakes_subscriber() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_no_wake_without_transition() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        // Already offline; setting offline again is not a transition.
        monitor.set_online(false);
        let woke = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(woke.is_err(), "subscriber woke without a transition");
    }

    #[tokio::test]
    async fn test_offline_online_round_trip() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_probe_marks_online_when_server_reachable() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let monitor = ConnectivityMonitor::new();
        let api_client = ApiClient::new(mock_server.uri());
        monitor.start_probing(api_client, Duration::from_millis(20));

        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("probe never reported connectivity")
            .unwrap();
        assert!(monitor.is_online());
    }
}
