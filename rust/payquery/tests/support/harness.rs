use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use payquery::{
    config::AppConfig,
    error::Result,
    query::{BindParam, CompiledQuery, QueryExecutor},
    server::Server,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

pub const MERCHANT: &str = "mer_001";
pub const CANCELED_AMOUNT: i64 = 1_447_700;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Count(CompiledQuery),
    Fetch(CompiledQuery),
    Freeform(String),
}

/// In-memory executor with a scripted payments table: 1000 rows overall, 125 for
/// [`MERCHANT`], 40 of those canceled.
#[derive(Default)]
pub struct FakeExecutor {
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeExecutor {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_fetch(&self) -> Option<CompiledQuery> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            RecordedCall::Fetch(query) => Some(query.clone()),
            _ => None,
        })
    }

    pub fn last_freeform(&self) -> Option<String> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            RecordedCall::Freeform(sql) => Some(sql.clone()),
            _ => None,
        })
    }
}

fn binds_text(query: &CompiledQuery, expected: &str) -> bool {
    query
        .params
        .iter()
        .any(|param| matches!(param, BindParam::Text(value) if value == expected))
}

fn scripted_total(query: &CompiledQuery) -> i64 {
    match (binds_text(query, MERCHANT), binds_text(query, "CANCELED")) {
        (true, true) => 40,
        (true, false) => 125,
        _ => 1000,
    }
}

fn window(query: &CompiledQuery) -> (i64, i64) {
    let ints: Vec<i64> = query
        .params
        .iter()
        .filter_map(|param| match param {
            BindParam::Int(value) => Some(*value),
            _ => None,
        })
        .collect();
    match ints.as_slice() {
        [.., limit, offset] => (*limit, *offset),
        _ => (0, 0),
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Value>> {
        self.calls.lock().push(RecordedCall::Fetch(query.clone()));
        let total = scripted_total(query);
        let (limit, offset) = window(query);
        let count = (total - offset).clamp(0, limit);
        let merchant = if binds_text(query, MERCHANT) { MERCHANT } else { "mer_002" };
        let (status, amount) = if binds_text(query, "CANCELED") {
            ("CANCELED", CANCELED_AMOUNT)
        } else {
            ("DONE", 10_000)
        };

        Ok((0..count)
            .map(|position| {
                let n = offset + position + 1;
                json!({
                    "paymentKey": format!("pk_{n:04}"),
                    "merchantId": merchant,
                    "status": status,
                    "amount": amount,
                })
            })
            .collect())
    }

    async fn count_rows(&self, query: &CompiledQuery) -> Result<i64> {
        self.calls.lock().push(RecordedCall::Count(query.clone()));
        Ok(scripted_total(query))
    }

    async fn fetch_freeform(&self, sql: &str) -> Result<Vec<Value>> {
        self.calls.lock().push(RecordedCall::Freeform(sql.to_string()));
        Ok(vec![json!({"merchantId": MERCHANT, "paymentCount": 125})])
    }
}

/// Drives the real router over a [`FakeExecutor`].
pub struct TestHarness {
    router: Router,
    pub executor: Arc<FakeExecutor>,
}

impl TestHarness {
    pub fn new() -> Self {
        let mut config = AppConfig::embedded("postgres://payquery@localhost/payments");
        config.api_key = Some(API_KEY.to_string());
        Self::with_config(config)
    }

    pub fn with_config(config: AppConfig) -> Self {
        let executor = Arc::new(FakeExecutor::default());
        let server = Server::with_executor(config, executor.clone());
        Self {
            router: server.router(),
            executor,
        }
    }

    pub async fn post<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        self.request(path, payload, true).await
    }

    pub async fn post_without_api_key<T>(&self, path: &str, payload: &T) -> http::Response<Body>
    where
        T: Serialize,
    {
        self.request(path, payload, false).await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    async fn request<T>(&self, path: &str, payload: &T, include_api_key: bool) -> http::Response<Body>
    where
        T: Serialize,
    {
        let body = serde_json::to_vec(payload).expect("failed to serialize request");
        let mut builder = Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }
        let request = builder
            .body(Body::from(body))
            .expect("failed to build request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    /// POSTs and decodes the response in one step.
    pub async fn post_json<T>(&self, path: &str, payload: &T) -> (StatusCode, Value)
    where
        T: Serialize,
    {
        read_json(self.post(path, payload).await).await
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// "payments in the last 3 months", ten per page.
pub fn payments_last_3_months() -> Value {
    json!({
        "entity": "Payment",
        "operation": "list",
        "fields": ["paymentKey", "merchantId", "status", "amount"],
        "timeRange": {"preset": "last_3_months"},
        "limit": 10,
        "queryIntent": "NEW_QUERY"
    })
}
