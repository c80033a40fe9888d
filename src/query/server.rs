use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::LookupCache;
use crate::core::{JoinKey, ScalarValue};
use crate::error::LookupError;
use crate::stats::CacheStats;

#[derive(Deserialize)]
pub struct LookupParams {
    /// JSON 数组，按 join key 列顺序，例如 `[42]` 或 `["eu", 7]`
    pub key: String,
}

#[derive(Serialize)]
pub struct LookupResponse {
    pub key: String,
    pub rows: Vec<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

pub struct LookupServer {
    pub cache: Arc<LookupCache>,
}

impl LookupServer {
    pub fn new(cache: Arc<LookupCache>) -> Self {
        Self { cache }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/lookup", get(lookup_handler))
            .route("/status", get(status_handler))
            .with_state(self.cache.clone())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP lookup server listening on port {}", port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn parse_key(raw: &str) -> Result<JoinKey, String> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| format!("key must be a JSON array: {e}"))?;
    if values.is_empty() {
        return Err("key must not be empty".to_string());
    }
    values
        .into_iter()
        .map(ScalarValue::from_json)
        .collect::<Result<Vec<_>, _>>()
        .map(JoinKey::new)
}

fn error_response(status: StatusCode, error: String, cause: Option<String>) -> Response {
    (status, Json(ErrorResponse { error, cause })).into_response()
}

fn status_for(e: &LookupError) -> StatusCode {
    match e {
        LookupError::InvalidState(_) => StatusCode::BAD_REQUEST,
        LookupError::BackgroundRefreshFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn lookup_handler(
    Query(params): Query<LookupParams>,
    State(cache): State<Arc<LookupCache>>,
) -> Response {
    let key = match parse_key(&params.key) {
        Ok(k) => k,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg, None),
    };

    // lookup 可能阻塞在首次加载屏障上
    let display_key = key.to_string();
    let result = tokio::task::spawn_blocking(move || cache.lookup(&key)).await;

    match result {
        Ok(Ok(rows)) => Json(LookupResponse {
            key: display_key,
            rows: rows.iter().map(|r| r.to_json()).collect(),
        })
        .into_response(),
        Ok(Err(e)) => {
            if !e.is_invalid_state() {
                tracing::warn!("Lookup {} failed: {}", display_key, e);
            }
            let cause = e.refresh_cause().map(|c| c.to_string());
            error_response(status_for(&e), e.to_string(), cause)
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("lookup task failed: {e}"),
            None,
        ),
    }
}

async fn status_handler(State(cache): State<Arc<LookupCache>>) -> Json<CacheStats> {
    Json(cache.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupConfig;
    use crate::core::{ChangeRecord, ProjectedRow};
    use crate::feed::{ChangeBatch, ChangeFeed, FeedError, FeedPosition, MemoryChangeFeed};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn unique_tmp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("lookup-cache-http-{}-{}", tag, nanos))
    }

    fn config(tag: &str) -> LookupConfig {
        LookupConfig::new("dim_user", vec!["id".into()])
            .with_refresh_interval(Duration::from_millis(10))
            .with_local_storage_path(unique_tmp_dir(tag))
    }

    fn open_cache(tag: &str) -> Arc<LookupCache> {
        let (feed, producer) = MemoryChangeFeed::new(tag);
        producer.push(vec![ChangeRecord::Upsert(ProjectedRow::from_pairs([
            ("id", ScalarValue::Int64(1)),
            ("name", ScalarValue::Utf8("alice".into())),
        ]))]);
        let cache = Arc::new(LookupCache::with_redb(config(tag), Box::new(feed)).unwrap());
        cache.open().unwrap();
        cache
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn lookup_returns_rows_as_json() {
        let app = LookupServer::new(open_cache("rows")).router();
        let (status, body) = get_json(app.clone(), "/lookup?key=%5B1%5D").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"][0]["name"], "alice");

        let (status, body) = get_json(app, "/lookup?key=%5B2%5D").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"].as_array().map(|a| a.len()), Some(0));
    }

    #[tokio::test]
    async fn bad_keys_are_rejected() {
        let app = LookupServer::new(open_cache("bad")).router();
        let (status, _) = get_json(app.clone(), "/lookup?key=nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        // 列数不匹配
        let (status, body) = get_json(app, "/lookup?key=%5B1%2C2%5D").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid state"));
    }

    #[tokio::test]
    async fn status_reports_stats() {
        let app = LookupServer::new(open_cache("status")).router();
        let (status, body) = get_json(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "open");
        assert_eq!(body["entries"], 1);
        assert!(body["failure"].is_null());
    }

    struct BrokenFeed {
        armed: Arc<AtomicBool>,
    }

    impl ChangeFeed for BrokenFeed {
        fn has_next(&self) -> bool {
            self.armed.load(Ordering::SeqCst)
        }

        fn next_batch(&mut self) -> Result<ChangeBatch, FeedError> {
            Err(FeedError::Unavailable("catalog unreachable".into()))
        }

        fn commit(&mut self, _position: FeedPosition) {}
    }

    #[tokio::test]
    async fn background_failure_maps_to_503() {
        let armed = Arc::new(AtomicBool::new(false));
        let feed = BrokenFeed {
            armed: armed.clone(),
        };
        let cache = Arc::new(LookupCache::with_redb(config("broken"), Box::new(feed)).unwrap());
        cache.open().unwrap();
        armed.store(true, Ordering::SeqCst);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cache.failure().is_none() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let app = LookupServer::new(cache).router();
        let (status, body) = get_json(app, "/lookup?key=%5B1%5D").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["cause"]
            .as_str()
            .unwrap()
            .contains("catalog unreachable"));
    }
}
