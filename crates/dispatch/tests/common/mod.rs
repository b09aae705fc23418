//! In-process scan node used by the dispatcher integration tests.
//!
//! Each [`MockNode`] serves `/stat/engines`, `/file` and `/file/{data_id}`
//! on an ephemeral port. Its behaviour can be changed while a test runs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use scanfleet_dispatch::DispatchConfig;

/// How the node answers `POST /file`.
#[derive(Debug, Clone)]
pub enum SubmitMode {
    Accept,
    Reject(u16, &'static str),
    Hang(Duration),
}

/// How the node answers `GET /file/{data_id}`.
#[derive(Debug, Clone)]
pub enum PollMode {
    /// Report 50% for `pending_polls` polls, then the given report.
    Complete { pending_polls: usize, report: Value },
    /// Answer 200 without `scan_results.progress_percentage`.
    MissingProgress,
    /// Answer with a fixed status and payload.
    Status(u16, Value),
}

#[derive(Debug, Clone)]
struct Behaviour {
    engines: Value,
    submit: SubmitMode,
    poll: PollMode,
}

#[derive(Debug)]
struct MockState {
    behaviour: Mutex<Behaviour>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    engine_fetches: AtomicUsize,
    api_keys: Mutex<Vec<String>>,
    poll_counts: Mutex<HashMap<String, usize>>,
}

pub struct MockNode {
    pub url: String,
    state: Arc<MockState>,
}

/// Two healthy AV engines.
pub fn healthy_engines() -> Value {
    json!([
        {"eng_name": "ClamAV", "eng_ver": "1.2.0", "def_time": "2024-03-10T00:00:00.000Z",
         "engine_type": "av", "active": true, "state": "production"},
        {"eng_name": "Avira AV", "eng_ver": "8.3", "def_time": "2024-03-14T06:00:00.000Z",
         "engine_type": "av", "active": true, "state": "production"}
    ])
}

/// A finished job with one infected engine.
pub fn infected_report(queue_time: u64) -> Value {
    json!({
        "scan_results": {
            "progress_percentage": 100,
            "scan_details": {
                "ClamAV": {"scan_result_i": 1, "threat_found": "a variant of Test.Virus", "scan_time": 4}
            }
        },
        "file_info": {"file_size": 68},
        "process_info": {
            "queue_time": queue_time,
            "processing_time": 25,
            "post_processing": {"actions_ran": "", "actions_failed": ""}
        }
    })
}

impl MockNode {
    /// A healthy node that finishes every job after one pending poll.
    pub async fn healthy() -> Self {
        Self::spawn(
            healthy_engines(),
            SubmitMode::Accept,
            PollMode::Complete {
                pending_polls: 1,
                report: infected_report(120),
            },
        )
        .await
    }

    /// A node that answers but reports no engines.
    pub async fn without_engines() -> Self {
        let node = Self::healthy().await;
        node.set_engines(json!([]));
        node
    }

    pub async fn spawn(engines: Value, submit: SubmitMode, poll: PollMode) -> Self {
        let state = Arc::new(MockState {
            behaviour: Mutex::new(Behaviour {
                engines,
                submit,
                poll,
            }),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            engine_fetches: AtomicUsize::new(0),
            api_keys: Mutex::new(Vec::new()),
            poll_counts: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/stat/engines", get(engines_handler))
            .route("/file", post(submit_handler))
            .route("/file/{data_id}", get(status_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn set_engines(&self, engines: Value) {
        self.state.behaviour.lock().unwrap().engines = engines;
    }

    pub fn set_submit(&self, mode: SubmitMode) {
        self.state.behaviour.lock().unwrap().submit = mode;
    }

    pub fn set_poll(&self, mode: PollMode) {
        self.state.behaviour.lock().unwrap().poll = mode;
    }

    pub fn submits(&self) -> usize {
        self.state.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.state.polls.load(Ordering::SeqCst)
    }

    pub fn engine_fetches(&self) -> usize {
        self.state.engine_fetches.load(Ordering::SeqCst)
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.state.api_keys.lock().unwrap().clone()
    }
}

/// URL of a port nothing listens on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Dispatcher settings scaled down for tests.
pub fn test_config(urls: &[&str]) -> DispatchConfig {
    let mut config = DispatchConfig::new(urls.iter().copied());
    config.request_timeout = Duration::from_secs(2);
    config.poll_interval = Duration::from_millis(10);
    config.scan_deadline = Duration::from_secs(5);
    config.single_node_pause = Duration::from_millis(10);
    config.startup_fetch_retries = 0;
    config.startup_retry_delay = Duration::ZERO;
    config
}

fn record_api_key(state: &MockState, headers: &HeaderMap) {
    if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
        state.api_keys.lock().unwrap().push(key.to_string());
    }
}

async fn engines_handler(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Json<Value> {
    record_api_key(&state, &headers);
    state.engine_fetches.fetch_add(1, Ordering::SeqCst);
    let engines = state.behaviour.lock().unwrap().engines.clone();
    Json(engines)
}

async fn submit_handler(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    record_api_key(&state, &headers);
    let n = state.submits.fetch_add(1, Ordering::SeqCst);
    let mode = state.behaviour.lock().unwrap().submit.clone();

    match mode {
        SubmitMode::Accept => Json(json!({"data_id": format!("job-{n}")})).into_response(),
        SubmitMode::Reject(status, message) => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({"err": message})),
        )
            .into_response(),
        SubmitMode::Hang(delay) => {
            tokio::time::sleep(delay).await;
            Json(json!({"data_id": format!("job-{n}")})).into_response()
        }
    }
}

async fn status_handler(
    State(state): State<Arc<MockState>>,
    Path(data_id): Path<String>,
) -> Response {
    state.polls.fetch_add(1, Ordering::SeqCst);
    let mode = state.behaviour.lock().unwrap().poll.clone();

    match mode {
        PollMode::Complete {
            pending_polls,
            report,
        } => {
            let seen = {
                let mut counts = state.poll_counts.lock().unwrap();
                let count = counts.entry(data_id).or_insert(0);
                *count += 1;
                *count
            };
            if seen <= pending_polls {
                Json(json!({"scan_results": {"progress_percentage": 50}})).into_response()
            } else {
                Json(report).into_response()
            }
        }
        PollMode::MissingProgress => Json(json!({"file_info": {"file_size": 68}})).into_response(),
        PollMode::Status(status, payload) => {
            (StatusCode::from_u16(status).unwrap(), Json(payload)).into_response()
        }
    }
}
