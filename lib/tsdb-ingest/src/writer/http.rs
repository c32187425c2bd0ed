use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{CONTENT_ENCODING, CONTENT_TYPE},
    Client, StatusCode,
};
use snafu::ResultExt as _;
use tokio::time::Instant;
use tracing::debug;

use super::{BatchWriter, Http, WriteError};
use crate::{backoff::BackoffSignal, batch::Batch, endpoint::Endpoint, transport::ProtocolError};

/// Path of the multi-point put endpoint.
pub const MULTI_PUT_PATH: &str = "/api/mput";

/// Writes gzip-compressed JSON batches over HTTP.
///
/// A `429 Too Many Requests` or `503 Service Unavailable` response is backpressure: the writer signals congestion,
/// waits for the backoff interval, and sends the same batch again until the target accepts it.
pub struct HttpWriter {
    client: Client,
    endpoint: Endpoint,
    url: String,
    backoff_interval: Duration,
    backoff: BackoffSignal,
}

impl HttpWriter {
    /// Creates a new `HttpWriter`.
    pub fn new(client: Client, endpoint: Endpoint, backoff_interval: Duration, backoff: BackoffSignal) -> Self {
        let url = endpoint.http_url(MULTI_PUT_PATH);
        Self {
            client,
            endpoint,
            url,
            backoff_interval,
            backoff,
        }
    }
}

#[async_trait]
impl BatchWriter for HttpWriter {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn submit(&mut self, batch: Batch) -> Result<Duration, WriteError> {
        let batch = match batch {
            Batch::Compressed(batch) => batch,
            other => {
                return Err(WriteError::Protocol {
                    endpoint: self.endpoint.clone(),
                    source: ProtocolError::UnsupportedBatch { kind: other.kind() },
                })
            }
        };

        loop {
            let started = Instant::now();
            let response = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "gzip")
                .body(batch.payload.clone())
                .send()
                .await
                .context(Http {
                    endpoint: self.endpoint.clone(),
                })?;
            let latency = started.elapsed();

            let status = response.status();
            if status.is_success() {
                return Ok(latency);
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
                debug!(endpoint = %self.endpoint, %status, "Target is pushing back. Backing off for {:?}.", self.backoff_interval);
                self.backoff.signal(true).await;
                tokio::time::sleep(self.backoff_interval).await;
                continue;
            }

            let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
            return Err(WriteError::UnexpectedStatus {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex,
    };

    use async_compression::tokio::bufread::GzipDecoder;
    use axum::{body::Bytes, extract::State, http::HeaderMap, routing::post, Router};
    use tokio::{io::AsyncReadExt as _, net::TcpListener};

    use super::*;
    use crate::{backoff::BackoffTracker, batch::CompressedBatch};

    #[derive(Clone, Default)]
    struct TargetState {
        pushbacks_left: Arc<AtomicUsize>,
        reject_with: Option<u16>,
        bodies: Arc<Mutex<Vec<(Option<String>, Bytes)>>>,
    }

    async fn handle_mput(State(state): State<TargetState>, headers: HeaderMap, body: Bytes) -> StatusCode {
        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        state.bodies.lock().unwrap().push((encoding, body));

        if let Some(status) = state.reject_with {
            return StatusCode::from_u16(status).unwrap();
        }

        let pushback = state
            .pushbacks_left
            .fetch_update(Relaxed, Relaxed, |left| left.checked_sub(1))
            .is_ok();
        if pushback {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn spawn_target(state: TargetState) -> Endpoint {
        let app = Router::new().route(MULTI_PUT_PATH, post(handle_mput)).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Endpoint::new("127.0.0.1", port)
    }

    async fn gzip_batch(json: &str) -> Batch {
        use async_compression::tokio::write::GzipEncoder;
        use tokio::io::AsyncWriteExt as _;

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(json.as_bytes()).await.unwrap();
        encoder.shutdown().await.unwrap();
        Batch::Compressed(CompressedBatch {
            payload: encoder.into_inner().into(),
            items: 1,
            values: 1,
        })
    }

    async fn gunzip(body: &[u8]) -> String {
        let mut decoder = GzipDecoder::new(body);
        let mut out = String::new();
        decoder.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn posts_gzip_payload() {
        let state = TargetState::default();
        let endpoint = spawn_target(state.clone()).await;
        let (signal, tracker) = BackoffTracker::spawn(16);

        let json = r#"[
{"metric":"vehicle","timestamp":1546300800000,"tags":{},"fields":{"speed":1.0}}
]"#;
        let mut writer = HttpWriter::new(Client::new(), endpoint, Duration::from_millis(10), signal);
        writer.submit(gzip_batch(json).await).await.unwrap();
        drop(writer);

        let bodies = state.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0.as_deref(), Some("gzip"));
        assert_eq!(gunzip(&bodies[0].1).await, json);
        assert_eq!(tracker.wait().await.total, Duration::ZERO);
    }

    #[tokio::test]
    async fn backs_off_on_pushback() {
        let state = TargetState {
            pushbacks_left: Arc::new(AtomicUsize::new(2)),
            ..TargetState::default()
        };
        let endpoint = spawn_target(state.clone()).await;
        let (signal, tracker) = BackoffTracker::spawn(16);

        let backoff_interval = Duration::from_millis(20);
        let mut writer = HttpWriter::new(Client::new(), endpoint, backoff_interval, signal.clone());
        writer.submit(gzip_batch("[\n{}\n]").await).await.unwrap();
        signal.signal(false).await;
        drop(signal);
        drop(writer);

        assert_eq!(state.bodies.lock().unwrap().len(), 3);
        let totals = tracker.wait().await;
        assert_eq!(totals.intervals, 1);
        assert!(totals.total >= backoff_interval * 2);
    }

    #[tokio::test]
    async fn unexpected_status_is_an_error() {
        let state = TargetState {
            reject_with: Some(400),
            ..TargetState::default()
        };
        let endpoint = spawn_target(state).await;
        let (signal, _tracker) = BackoffTracker::spawn(16);

        let mut writer = HttpWriter::new(Client::new(), endpoint, Duration::from_millis(10), signal);
        let result = writer.submit(gzip_batch("[\n{}\n]").await).await;
        assert!(matches!(result, Err(WriteError::UnexpectedStatus { status: 400, .. })));
    }

    #[tokio::test]
    async fn rejects_point_batches() {
        let (signal, _tracker) = BackoffTracker::spawn(16);
        let mut writer = HttpWriter::new(Client::new(), Endpoint::new("db", 4242), Duration::from_millis(10), signal);

        let result = writer.submit(Batch::Points(Vec::new())).await;
        assert!(matches!(
            result,
            Err(WriteError::Protocol {
                source: ProtocolError::UnsupportedBatch { .. },
                ..
            })
        ));
    }
}
