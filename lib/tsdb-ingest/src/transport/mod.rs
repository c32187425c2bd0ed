//! RPC transport.
//!
//! Each worker owns one [`RpcTransport`], which owns at most one live session to the worker's endpoint. Sends are
//! retried with a reconnect between attempts, and every failed attempt is reported to the backoff tracker as
//! congestion.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt as _, Snafu};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{backoff::BackoffSignal, codec::WirePoint, endpoint::Endpoint, registry::FieldOrderRegistry};

mod grpc;
pub use self::grpc::{GrpcConnector, GrpcSession, MULTI_FIELD_PUT_PATH};

pub mod proto;
use self::proto::MultiFieldPutRequest;

mod shape;
pub use self::shape::{shape_request, ProtocolError};

/// Default number of dial attempts before a connection is considered failed.
pub const DEFAULT_MAX_DIAL_ATTEMPTS: usize = 4;

/// Default number of attempts per batch submission.
pub const DEFAULT_MAX_SEND_ATTEMPTS: usize = 4;

/// Default base interval between retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Session-level error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SessionError {
    /// The connection to the endpoint could not be established.
    #[snafu(display("failed to connect to {}", endpoint))]
    Connect {
        endpoint: Endpoint,
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The connection was not ready to accept a call.
    #[snafu(display("connection not ready"))]
    NotReady { source: tonic::transport::Error },

    /// The call itself failed.
    #[snafu(display("call failed"))]
    Call { source: tonic::Status },
}

/// Transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransportError {
    /// The batch could not be shaped into a request.
    #[snafu(display("invalid batch for {}", endpoint))]
    Protocol { endpoint: Endpoint, source: ProtocolError },

    /// Every dial attempt failed.
    #[snafu(display("failed to connect to {} after {} attempts", endpoint, attempts))]
    DialExhausted {
        endpoint: Endpoint,
        attempts: usize,
        source: SessionError,
    },

    /// Every send attempt failed.
    #[snafu(display("failed to send batch to {} after {} attempts", endpoint, attempts))]
    SendExhausted {
        endpoint: Endpoint,
        attempts: usize,
        source: SessionError,
    },
}

/// Opens sessions to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: Session;

    /// Dials `endpoint`, returning a live session.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session, SessionError>;
}

/// A live session to one endpoint.
#[async_trait]
pub trait Session: Send {
    /// Sends a multi-value put request.
    ///
    /// Returns the target's success flag. A call that completes with `false` is still a completed call.
    async fn multi_put(&mut self, request: MultiFieldPutRequest) -> Result<bool, SessionError>;
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    /// No session, and none has been attempted yet.
    #[default]
    Disconnected,

    /// Dialing for the first time.
    Connecting,

    /// A session is live.
    Connected,

    /// Dialing again after a failed send.
    Reconnecting,

    /// Dial or send attempts were exhausted. Terminal.
    Failed,
}

/// Retry policy for dialing and sending.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of dial attempts per (re)connect.
    pub max_dial_attempts: usize,

    /// Maximum number of attempts per batch submission.
    pub max_send_attempts: usize,

    /// Base retry interval. The sleep after the Nth failed attempt is N times this.
    pub interval: Duration,
}

impl RetryPolicy {
    fn dial_delay(&self, attempt: usize) -> Duration {
        self.interval.saturating_mul(attempt as u32)
    }

    fn send_delay(&self, remaining_attempts: usize) -> Duration {
        let failed_attempts = self.max_send_attempts.saturating_sub(remaining_attempts);
        self.interval.saturating_mul(failed_attempts as u32)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_dial_attempts: DEFAULT_MAX_DIAL_ATTEMPTS,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Transport counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportStats {
    /// Sessions successfully established.
    pub connects: u64,

    /// Send attempts that failed and were retried.
    pub retries: u64,

    /// Calls that completed but were rejected by the target.
    pub soft_failures: u64,
}

/// RPC transport for a single worker.
pub struct RpcTransport<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    policy: RetryPolicy,
    registry: Arc<FieldOrderRegistry>,
    backoff: BackoffSignal,
    state: ConnectionState,
    session: Option<C::Session>,
    stats: TransportStats,
}

impl<C: Connector> RpcTransport<C> {
    /// Creates a new `RpcTransport`.
    ///
    /// No connection is made until the first send.
    pub fn new(
        connector: C, endpoint: Endpoint, policy: RetryPolicy, registry: Arc<FieldOrderRegistry>,
        backoff: BackoffSignal,
    ) -> Self {
        Self {
            connector,
            endpoint,
            policy,
            registry,
            backoff,
            state: ConnectionState::Disconnected,
            session: None,
            stats: TransportStats::default(),
        }
    }

    /// Returns the endpoint this transport sends to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the transport counters.
    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Establishes a session if there isn't one.
    ///
    /// # Errors
    ///
    /// If every dial attempt fails, the transport moves to [`ConnectionState::Failed`] and an error is returned.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }

        self.state = match self.state {
            ConnectionState::Disconnected => ConnectionState::Connecting,
            _ => ConnectionState::Reconnecting,
        };

        let mut attempt = 1;
        loop {
            match self.connector.connect(&self.endpoint).await {
                Ok(session) => {
                    debug!(endpoint = %self.endpoint, attempt, "Session established.");
                    self.session = Some(session);
                    self.state = ConnectionState::Connected;
                    self.stats.connects += 1;
                    return Ok(());
                }
                Err(e) if attempt >= self.policy.max_dial_attempts => {
                    self.state = ConnectionState::Failed;
                    return Err(e).context(DialExhausted {
                        endpoint: self.endpoint.clone(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    let delay = self.policy.dial_delay(attempt);
                    warn!(endpoint = %self.endpoint, attempt, error = %e, "Failed to connect. Retrying in {:?}.", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Sends a batch of points as a single multi-value put request.
    ///
    /// Returns the latency of the call that completed. A call that completes but is rejected by the target is logged and
    /// counted, not retried.
    ///
    /// # Errors
    ///
    /// If the batch cannot be shaped into a request, or every send attempt fails, an error is returned. Exhausting the
    /// attempts leaves the transport in [`ConnectionState::Failed`].
    pub async fn send(&mut self, points: &[WirePoint]) -> Result<Duration, TransportError> {
        let request = shape_request(points, &self.registry).context(Protocol {
            endpoint: self.endpoint.clone(),
        })?;

        let mut remaining_attempts = self.policy.max_send_attempts.max(1);
        loop {
            self.connect().await?;
            let Some(session) = self.session.as_mut() else {
                continue;
            };

            let started = Instant::now();
            let result = session.multi_put(request.clone()).await;
            let latency = started.elapsed();

            match result {
                Ok(true) => return Ok(latency),
                Ok(false) => {
                    self.stats.soft_failures += 1;
                    warn!(endpoint = %self.endpoint, points = points.len(), "Target rejected batch.");
                    return Ok(latency);
                }
                Err(e) => {
                    remaining_attempts -= 1;
                    self.session = None;

                    if remaining_attempts == 0 {
                        self.state = ConnectionState::Failed;
                        return Err(e).context(SendExhausted {
                            endpoint: self.endpoint.clone(),
                            attempts: self.policy.max_send_attempts,
                        });
                    }

                    let delay = self.policy.send_delay(remaining_attempts);
                    warn!(endpoint = %self.endpoint, remaining_attempts, error = %e, "Failed to send batch. Reconnecting in {:?}.", delay);

                    self.stats.retries += 1;
                    self.state = ConnectionState::Reconnecting;
                    self.backoff.signal(true).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl<C: Connector> Drop for RpcTransport<C> {
    fn drop(&mut self) {
        if self.stats.connects > 0 {
            info!(
                endpoint = %self.endpoint,
                connects = self.stats.connects,
                retries = self.stats.retries,
                soft_failures = self.stats.soft_failures,
                "Closing transport."
            );
        }
    }
}
