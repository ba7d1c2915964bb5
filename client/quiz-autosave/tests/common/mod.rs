#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quiz_autosave::{
    config::AutosaveSettings,
    create_dev_router,
    models::{AutosaveRequest, SaveConfirmation},
    services::{DevServerState, GatewayError, SaveGateway},
    utils::retry::RetryPolicy,
};
use url::Url;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Default pipeline timings: 3s debounce, three attempts, 1s base backoff.
pub fn test_settings() -> AutosaveSettings {
    AutosaveSettings {
        debounce: Duration::from_millis(3000),
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            jitter_max: None,
        },
        success_display: Duration::from_millis(2000),
        request_timeout: Duration::from_secs(10),
        flush_timeout: Duration::from_secs(5),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Fail,
    /// Never completes; only a timeout or cancellation ends the call.
    Hang,
}

/// Gateway double that records every request and plays back scripted
/// outcomes. Once the script is exhausted every call succeeds.
#[derive(Default)]
pub struct RecordingGateway {
    script: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<AutosaveRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Mutex<Duration>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: &[Outcome]) -> Arc<Self> {
        let gateway = Self::default();
        gateway.script.lock().unwrap().extend(outcomes.iter().copied());
        Arc::new(gateway)
    }

    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock().unwrap() = latency;
        self
    }

    pub fn calls(&self) -> Vec<AutosaveRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn as_gateway(self: &Arc<Self>) -> Arc<dyn SaveGateway> {
        self.clone()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SaveGateway for RecordingGateway {
    async fn send(&self, request: &AutosaveRequest) -> Result<SaveConfirmation, GatewayError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Ok);
        match outcome {
            Outcome::Ok => Ok(SaveConfirmation {
                success: true,
                timestamp: Some(Utc::now()),
                saved: request.changes.len() as u32,
                message: None,
            }),
            Outcome::Fail => Err(GatewayError::Status {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

/// Serves the dev router on an ephemeral local port.
/// Returns the state and the `/api` base URL.
pub async fn spawn_dev_server(auth_token: Option<&str>) -> (Arc<DevServerState>, Url) {
    let state = Arc::new(DevServerState::new(auth_token.map(str::to_string)));
    let app = create_dev_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr: SocketAddr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = Url::parse(&format!("http://{}/api", addr)).unwrap();
    (state, base)
}
