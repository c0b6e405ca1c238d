//! Connectivity monitoring
//!
//! Tracks whether the host reports the device as online and how good the link
//! is. Online/offline comes from host signals; link quality is classified
//! from periodic latency probes and is advisory only.

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::error::{ProbeError, TransportBuildError};

/// Network connectivity state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    /// Connected to network
    Online,

    /// Disconnected from network
    Offline,

    /// No host signal received yet
    Unknown,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => write!(f, "online"),
            NetworkState::Offline => write!(f, "offline"),
            NetworkState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Link quality bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkQuality {
    /// Low latency
    Excellent,
    /// Usable latency
    Good,
    /// High latency or failing probes
    Poor,
    /// No connectivity
    Offline,
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkQuality::Excellent => write!(f, "excellent"),
            LinkQuality::Good => write!(f, "good"),
            LinkQuality::Poor => write!(f, "poor"),
            LinkQuality::Offline => write!(f, "offline"),
        }
    }
}

/// Latency bounds for each quality bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// Latencies below this are excellent
    pub excellent: Duration,
    /// Latencies below this (and not excellent) are good
    pub good: Duration,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self { excellent: Duration::from_millis(100), good: Duration::from_millis(300) }
    }
}

impl QualityThresholds {
    /// Bucket a measured latency
    pub fn classify(&self, latency: Duration) -> LinkQuality {
        if latency < self.excellent {
            LinkQuality::Excellent
        } else if latency < self.good {
            LinkQuality::Good
        } else {
            LinkQuality::Poor
        }
    }
}

/// Connectivity change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Host reported a different network state
    StateChanged {
        /// Previous state
        from: NetworkState,
        /// New state
        to: NetworkState,
    },
    /// Link quality bucket changed
    QualityChanged {
        /// Previous quality
        from: LinkQuality,
        /// New quality
        to: LinkQuality,
    },
}

/// Measures round-trip latency to the backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Measure one round trip
    async fn probe(&self) -> Result<Duration, ProbeError>;
}

/// Probe that times a GET against a health URL
///
/// Any HTTP response counts as reachable; only the round trip matters.
#[derive(Debug, Clone)]
pub struct HttpLatencyProbe {
    client: ReqwestClient,
    url: String,
    timeout: Duration,
}

impl HttpLatencyProbe {
    /// Create a probe for `url`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportBuildError> {
        let client = ReqwestClient::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), timeout })
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn probe(&self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(_) => Ok(started.elapsed()),
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout(self.timeout)),
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}

/// Handle to a running probe loop
#[derive(Debug)]
pub struct ProbeHandle {
    task: JoinHandle<()>,
}

impl ProbeHandle {
    /// Stop probing
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tracks network state and link quality and broadcasts changes
pub struct ConnectivityMonitor {
    state: RwLock<NetworkState>,
    quality: RwLock<LinkQuality>,
    thresholds: QualityThresholds,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor in the `Unknown` state
    pub fn new(thresholds: QualityThresholds) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(NetworkState::Unknown),
            quality: RwLock::new(LinkQuality::Good),
            thresholds,
            events,
        }
    }

    /// Subscribe to connectivity events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Current network state
    pub async fn network_state(&self) -> NetworkState {
        *self.state.read().await
    }

    /// Current link quality
    pub async fn link_quality(&self) -> LinkQuality {
        *self.quality.read().await
    }

    /// Whether the host last reported the device online
    pub async fn is_online(&self) -> bool {
        self.network_state().await == NetworkState::Online
    }

    /// Apply a host online/offline signal
    pub async fn set_network_state(&self, state: NetworkState) {
        let previous = {
            let mut current = self.state.write().await;
            if *current == state {
                return;
            }
            std::mem::replace(&mut *current, state)
        };

        tracing::info!(from = %previous, to = %state, "Network state changed");

        if state == NetworkState::Offline {
            self.set_quality(LinkQuality::Offline).await;
        } else if self.link_quality().await == LinkQuality::Offline {
            self.set_quality(LinkQuality::Good).await;
        }

        let _ = self.events.send(ConnectivityEvent::StateChanged { from: previous, to: state });
    }

    /// Run one probe and update link quality from its result
    ///
    /// While the host reports offline the quality stays `Offline`.
    pub async fn probe_once(&self, probe: &dyn LatencyProbe) -> LinkQuality {
        let result = probe.probe().await;

        if self.network_state().await == NetworkState::Offline {
            return LinkQuality::Offline;
        }

        let quality = match result {
            Ok(latency) => {
                tracing::trace!("Probe latency {:?}", latency);
                self.thresholds.classify(latency)
            }
            Err(e) => {
                tracing::debug!("Latency probe failed: {}", e);
                LinkQuality::Poor
            }
        };

        self.set_quality(quality).await;
        quality
    }

    /// Probe every `interval` until the returned handle is stopped or dropped
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        probe: Arc<dyn LatencyProbe>,
        interval: Duration,
    ) -> ProbeHandle {
        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.probe_once(probe.as_ref()).await;
            }
        });
        ProbeHandle { task }
    }

    async fn set_quality(&self, quality: LinkQuality) {
        let previous = {
            let mut current = self.quality.write().await;
            if *current == quality {
                return;
            }
            std::mem::replace(&mut *current, quality)
        };

        tracing::debug!(from = %previous, to = %quality, "Link quality changed");
        let _ = self.events.send(ConnectivityEvent::QualityChanged { from: previous, to: quality });
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_returning(latency_ms: u64) -> MockLatencyProbe {
        let mut probe = MockLatencyProbe::new();
        probe.expect_probe().returning(move || Ok(Duration::from_millis(latency_ms)));
        probe
    }

    #[test]
    fn test_classify() {
        let thresholds = QualityThresholds::default();
        assert_eq!(thresholds.classify(Duration::from_millis(20)), LinkQuality::Excellent);
        assert_eq!(thresholds.classify(Duration::from_millis(100)), LinkQuality::Good);
        assert_eq!(thresholds.classify(Duration::from_millis(299)), LinkQuality::Good);
        assert_eq!(thresholds.classify(Duration::from_secs(2)), LinkQuality::Poor);
    }

    #[tokio::test]
    async fn test_state_changes_are_broadcast() {
        let monitor = ConnectivityMonitor::default();
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.network_state().await, NetworkState::Unknown);

        monitor.set_network_state(NetworkState::Online).await;
        assert!(monitor.is_online().await);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectivityEvent::StateChanged { from: NetworkState::Unknown, to: NetworkState::Online }
        );

        // Same state twice is not an event
        monitor.set_network_state(NetworkState::Online).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_forces_offline_quality() {
        let monitor = ConnectivityMonitor::default();
        monitor.set_network_state(NetworkState::Offline).await;
        assert_eq!(monitor.link_quality().await, LinkQuality::Offline);

        let probe = probe_returning(10);
        assert_eq!(monitor.probe_once(&probe).await, LinkQuality::Offline);

        monitor.set_network_state(NetworkState::Online).await;
        assert_eq!(monitor.link_quality().await, LinkQuality::Good);
    }

    #[tokio::test]
    async fn test_probe_updates_quality() {
        let monitor = ConnectivityMonitor::default();
        monitor.set_network_state(NetworkState::Online).await;

        assert_eq!(monitor.probe_once(&probe_returning(30)).await, LinkQuality::Excellent);
        assert_eq!(monitor.probe_once(&probe_returning(900)).await, LinkQuality::Poor);
        assert_eq!(monitor.link_quality().await, LinkQuality::Poor);
    }

    #[tokio::test]
    async fn test_failed_probe_is_poor_not_offline() {
        let monitor = ConnectivityMonitor::default();
        monitor.set_network_state(NetworkState::Online).await;

        let mut probe = MockLatencyProbe::new();
        probe
            .expect_probe()
            .times(1)
            .returning(|| Err(ProbeError::Unreachable("connection refused".to_string())));

        assert_eq!(monitor.probe_once(&probe).await, LinkQuality::Poor);
        assert!(monitor.is_online().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_runs_until_stopped() {
        let monitor = Arc::new(ConnectivityMonitor::default());
        monitor.set_network_state(NetworkState::Online).await;
        let mut rx = monitor.subscribe();

        let handle = monitor.spawn_probe_loop(Arc::new(probe_returning(500)), Duration::from_secs(5));

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectivityEvent::QualityChanged { from: LinkQuality::Good, to: LinkQuality::Poor }
        );

        handle.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_finished());
    }
}
