//! Networking layer for the clinic sync core
//!
//! This crate provides the transport contract the sync engine talks to, an
//! HTTP implementation of it, pluggable retry and endpoint selection
//! policies, and connectivity monitoring.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod retry;
pub mod transport;

pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, HttpLatencyProbe, LatencyProbe, LinkQuality,
    NetworkState, ProbeHandle, QualityThresholds,
};
pub use endpoint::{EndpointSelectionPolicy, Failover, RoundRobin};
pub use error::{ConflictDetails, ProbeError, SendError, TransportBuildError};
pub use http::{HttpTransport, HttpTransportConfig};
pub use retry::{ExponentialRetry, RetryPolicy};
pub use transport::{OperationRequest, OperationResponse, RequestKind, Transport};
