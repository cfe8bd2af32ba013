use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat::TriageEngine;
use crate::config::AppConfig;
use crate::models::{
    ClearHistoryRequest, ClearHistoryResponse, HistoryParams, HistoryResponse, QueryRequest,
    QueryResponse, ThreadIdResponse, ThreadIdsResponse,
};
use crate::request_log::RequestLogger;

const ADJECTIVES: &[&str] = &[
    "adorable", "bubbly", "cheerful", "dizzy", "fluffy", "happy", "jolly", "kind", "lovely",
    "mellow", "nifty", "peppy", "plucky", "precious", "quiet", "rosy", "sleepy", "soft",
    "sparkly", "sunny", "sweet", "tiny", "warm", "zesty", "zany", "glowy", "gentle", "bright",
    "dreamy", "charming", "fuzzy", "smiley", "tender", "chirpy",
];

const ANIMALS: &[&str] = &[
    "bunny", "kitten", "puppy", "duckling", "hedgehog", "penguin", "panda", "fawn", "lamb",
    "koala", "hamster", "otter", "sloth", "mouse", "calf", "seal", "whale", "swan", "cub", "foal",
    "quokka", "flamingo", "starling", "parakeet", "caterpillar", "guinea", "deerling", "shrew",
    "snail", "turtle", "wren", "goldfinch", "bluebird", "mole", "cygnet", "gosling",
];

#[derive(Clone)]
pub struct AppState {
    engine: TriageEngine,
    logger: RequestLogger,
    active_threads: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub fn new(engine: TriageEngine, logger: RequestLogger) -> Self {
        Self {
            engine,
            logger,
            active_threads: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn mark_active(&self, thread_id: &str) -> Result<(), ApiError> {
        self.active_threads
            .lock()
            .map_err(|_| ApiError::internal("lock poisoned"))?
            .insert(thread_id.to_string());
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/new_thread_id", get(new_thread_id))
        .route("/query", post(query))
        .route("/query_stream", post(query_stream))
        .route("/clear_history", post(clear_history))
        .route("/get_history", get(get_history))
        .route("/get_thread_ids", get(get_thread_ids))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: AppConfig, engine: TriageEngine) -> Result<()> {
    tokio::fs::create_dir_all(&config.server.log_dir).await?;

    let logger = RequestLogger::new(config.server.log_dir.clone());
    let app = router(AppState::new(engine, logger.clone()));

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    logger.flush().await;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Hello World" }))
}

fn random_thread_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("sunny");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{}-{}-{:02}", adjective, animal, rng.gen_range(0..100))
}

async fn new_thread_id(State(state): State<AppState>) -> Result<Json<ThreadIdResponse>, ApiError> {
    loop {
        let candidate = random_thread_id();
        if state.engine.has_thread(&candidate).await {
            continue;
        }
        let inserted = state
            .active_threads
            .lock()
            .map_err(|_| ApiError::internal("lock poisoned"))?
            .insert(candidate.clone());
        if inserted {
            return Ok(Json(ThreadIdResponse {
                thread_id: candidate,
            }));
        }
    }
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    state.mark_active(&request.thread_id)?;
    let response = state
        .engine
        .query(&request.thread_id, &request.query, request.demographics.clone())
        .await;
    Ok(Json(QueryResponse {
        response,
        thread_id: request.thread_id,
        demographics: request.demographics,
    }))
}

async fn query_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    state.mark_active(&request.thread_id)?;
    let text = state.engine.query_stream_text(
        request.thread_id.clone(),
        request.query.clone(),
        request.demographics.clone(),
    );
    let logged = state.logger.wrap(request, text);

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(logged),
    )
        .into_response())
}

async fn clear_history(
    State(state): State<AppState>,
    Json(request): Json<ClearHistoryRequest>,
) -> Result<Json<ClearHistoryResponse>, ApiError> {
    state.engine.clear_history(&request.thread_id).await;
    state
        .active_threads
        .lock()
        .map_err(|_| ApiError::internal("lock poisoned"))?
        .remove(&request.thread_id);
    Ok(Json(ClearHistoryResponse {
        status: "success".to_string(),
        thread_id: request.thread_id,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    match state.engine.get_history(&params.thread_id).await {
        Some(messages) => Ok(Json(HistoryResponse {
            messages,
            thread_id: params.thread_id,
        })),
        None => Err(ApiError::not_found("Thread ID not found")),
    }
}

async fn get_thread_ids(State(state): State<AppState>) -> Json<ThreadIdsResponse> {
    Json(ThreadIdsResponse {
        thread_ids: state.engine.thread_ids().await,
    })
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::chat::tests::engine;
    use crate::chat::ClinicalModel;
    use crate::chat::tests::ScriptedChat;
    use crate::request_log::read_entries;

    async fn app_with_logger(logger: RequestLogger) -> Router {
        let clinical = ClinicalModel::Plain(ScriptedChat::new("clinical", "(flu, Self-care)"));
        router(AppState::new(engine(true, false, clinical).await, logger))
    }

    async fn app(log_dir: &std::path::Path) -> Router {
        app_with_logger(RequestLogger::new(log_dir)).await
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_answers() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "Hello World");
    }

    #[tokio::test]
    async fn new_thread_ids_are_memorable() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(Request::get("/new_thread_id").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = body_json(response).await["thread_id"]
            .as_str()
            .unwrap()
            .to_string();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert_eq!(parts[2].len(), 2);
    }

    #[tokio::test]
    async fn query_then_clear_then_history_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .clone()
            .oneshot(post_json("/query", json!({"query": "Hello", "thread_id": "t1"})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["thread_id"], "t1");
        assert_eq!(body["response"]["status"], "answered");
        assert_eq!(body["response"]["retrieved"], false);

        let response = app
            .clone()
            .oneshot(Request::get("/get_history?thread_id=t1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["messages"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(post_json("/clear_history", json!({"thread_id": "t1"})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "success");

        let response = app
            .oneshot(Request::get("/get_history?thread_id=t1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Thread ID not found");
    }

    #[tokio::test]
    async fn stream_is_plain_text_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RequestLogger::new(dir.path());
        let app = app_with_logger(logger.clone()).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/query_stream",
                json!({"query": "fever and chills", "thread_id": "s1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("It sounds like"));
        assert!(!text.contains("(flu, Self-care)"));

        logger.flush().await;
        let entries = read_entries(&dir.path().join("s1.jsonl")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].response.body, text);
        assert_eq!(entries[0].request.query, "fever and chills");

        let response = app
            .oneshot(Request::get("/get_thread_ids").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["thread_ids"], json!(["s1"]));
    }
}
