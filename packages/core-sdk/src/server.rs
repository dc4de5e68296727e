use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::{pin_mut, StreamExt};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::auth::{AuthClient, AuthService};
use crate::config::{AppConfig, ProviderPatch, ProviderSettings};
use crate::db;
use crate::error::Error;
use crate::llm::{BatchEvent, Generator, OutlineResult};
use crate::models::{
    GenerationOutput, GenerationResult, HistoryPage, HistoryPatch, HistoryRecord, HistoryStats,
    ListFilter, NewHistory, Page, RecordStatus, ReferenceImage, ServiceKind, User,
};
use crate::notice::{Notice, Notices};
use crate::registry::{self, ProviderDescriptor};
use crate::store::{select_history_store, HistoryStore};
use crate::transport::{HttpTransport, Transport};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/**
 * \brief HTTP 服务共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub conn: Arc<Mutex<Connection>>,
    pub generator: Generator,
    pub history: Arc<dyn HistoryStore>,
    pub auth: AuthService,
    pub notices: Notices,
}

impl AppState {
    pub fn new(conn: Arc<Mutex<Connection>>, config: AppConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new().context("failed to build HTTP client")?);
        Self::with_transport(conn, config, transport)
    }

    /**
     * \brief 使用指定的传输层组装状态。
     */
    pub fn with_transport(
        conn: Arc<Mutex<Connection>>,
        config: AppConfig,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let notices = Notices::new();
        let auth_client = config
            .persistence
            .auth_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .map(|u| AuthClient::new(transport.clone(), config.retry.policy(), u));
        let auth = AuthService::new(auth_client, conn.clone()).context("failed to restore session")?;
        let history = select_history_store(
            &config,
            conn.clone(),
            transport.clone(),
            auth.handle(),
            notices.clone(),
        );
        let generator = Generator::from_config(transport, &config);
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            conn,
            generator,
            history,
            auth,
            notices,
        })
    }

    async fn settings(&self, kind: ServiceKind) -> Result<ProviderSettings, Error> {
        Ok(self.config.read().await.active(kind)?.settings)
    }

    fn persist_config(&self, config: &AppConfig) -> Result<(), Error> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        db::save_app_config(&guard, config)
    }
}

/**
 * \brief 组装全部路由；未命中的路径交给静态前端目录。
 */
pub fn router(state: AppState) -> Router {
    let ui_root = std::env::var("REDINK_UI_DIR").unwrap_or_else(|_| "web/dist".to_string());
    let fallback_root = std::env::var("REDINK_UI_FALLBACK").unwrap_or_else(|_| "web".to_string());
    let static_handler = if std::path::Path::new(&ui_root).exists() {
        ServeDir::new(ui_root)
    } else {
        ServeDir::new(fallback_root)
    }
    .append_index_html_on_directories(true);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/providers", get(list_providers))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/config/export", get(export_config))
        .route("/api/config/import", post(import_config))
        .route("/api/outline", post(generate_outline))
        .route("/api/image", post(generate_image))
        .route("/api/images/batch", post(generate_images_sse))
        .route("/api/content/titles", post(generate_titles))
        .route("/api/content/captions", post(generate_captions))
        .route("/api/content/tags", post(generate_tags))
        .route("/api/history", get(list_history).post(create_history))
        .route("/api/history/stats", get(history_stats))
        .route(
            "/api/history/{id}",
            get(get_history).put(update_history).delete(delete_history),
        )
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(current_user))
        .route("/api/auth/logout", post(logout))
        .route("/api/notices", get(drain_notices))
        .fallback_service(get_service(static_handler))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server terminated")?;
    Ok(())
}

fn api_err(err: Error) -> ApiError {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::ClientRejected { .. }
        | Error::ServerFailure { .. }
        | Error::Network(_)
        | Error::Parse(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::QuotaExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
        Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (
        status,
        Json(json!({
            "success": false,
            "error": err.user_message(),
            "error_class": err.class(),
        })),
    )
}

fn parse_references(images: &[String]) -> Result<Vec<ReferenceImage>, Error> {
    images.iter().map(|s| ReferenceImage::from_data_uri(s)).collect()
}

fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}****", prefix)
}

/**
 * \brief 返回给前端的配置视图，API Key 被遮盖。
 */
fn masked(config: &AppConfig) -> AppConfig {
    let mut view = config.clone();
    for service in [&mut view.text_generation, &mut view.image_generation] {
        for settings in service.providers.values_mut() {
            if !settings.api_key.is_empty() {
                settings.api_key = mask_key(&settings.api_key);
            }
        }
    }
    view.persistence.hosted_anon_key = view
        .persistence
        .hosted_anon_key
        .as_deref()
        .map(mask_key);
    view
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "history_backend": state.history.backend(),
    }))
}

async fn list_providers() -> Json<&'static [ProviderDescriptor]> {
    Json(registry::all())
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(masked(&*state.config.read().await))
}

#[derive(Deserialize, Debug)]
struct ConfigUpdate {
    /** \brief text 或 image */
    service: ServiceKind,
    provider: String,
    #[serde(flatten)]
    patch: ProviderPatch,
    #[serde(default)]
    activate: bool,
    #[serde(default)]
    remove: bool,
}

/**
 * \brief 新增/更新、激活或删除一个 Provider 并持久化。
 */
async fn update_config(
    State(state): State<AppState>,
    Json(mut input): Json<ConfigUpdate>,
) -> ApiResult<AppConfig> {
    let name = input.provider.trim().to_string();
    if name.is_empty() {
        return Err(api_err(Error::Validation("Provider 名称不能为空".to_string())));
    }
    // 遮盖后的密钥原样回传时不覆盖
    if input.patch.api_key.as_deref().map(|k| k.ends_with("****")).unwrap_or(false) {
        input.patch.api_key = None;
    }

    let mut config = state.config.write().await;
    if input.remove {
        if !config.remove_provider(input.service, &name) {
            return Err(api_err(Error::NotFound(name)));
        }
    } else {
        config.upsert_provider(input.service, &name, input.patch);
        if input.activate {
            config.activate_provider(input.service, &name).map_err(api_err)?;
        }
    }
    state.persist_config(&config).map_err(api_err)?;
    info!(provider = %name, service = ?input.service, "provider config updated");
    Ok(Json(masked(&config)))
}

async fn export_config(State(state): State<AppState>) -> ApiResult<Value> {
    let raw = state.config.read().await.export_json().map_err(api_err)?;
    let value = serde_json::from_str(&raw).map_err(|e| api_err(Error::Parse(e.to_string())))?;
    Ok(Json(value))
}

async fn import_config(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<AppConfig> {
    let mut config = state.config.write().await;
    config.import_json(&payload.to_string()).map_err(api_err)?;
    state.persist_config(&config).map_err(api_err)?;
    Ok(Json(masked(&config)))
}

#[derive(Deserialize, Debug)]
struct OutlineRequest {
    topic: String,
    /** \brief data URI 形式的参考图片 */
    #[serde(default)]
    reference_images: Vec<String>,
}

async fn generate_outline(
    State(state): State<AppState>,
    Json(req): Json<OutlineRequest>,
) -> ApiResult<OutlineResult> {
    let images = parse_references(&req.reference_images).map_err(api_err)?;
    let settings = state.settings(ServiceKind::Text).await.map_err(api_err)?;
    let outline = state
        .generator
        .generate_outline(&settings, &req.topic, &images)
        .await
        .map_err(api_err)?;
    Ok(Json(outline))
}

#[derive(Deserialize, Debug)]
struct ImageRequest {
    content: String,
    #[serde(default)]
    reference_images: Vec<String>,
}

/**
 * \brief 单张出图；生成失败以 success=false 的结果信封返回。
 */
async fn generate_image(
    State(state): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<GenerationResult> {
    let images = parse_references(&req.reference_images).map_err(api_err)?;
    let settings = state.settings(ServiceKind::Image).await.map_err(api_err)?;
    let result = state
        .generator
        .generate_image(&settings, &req.content, &images)
        .await
        .map(GenerationOutput::Image);
    Ok(Json(GenerationResult::from(result)))
}

#[derive(Deserialize, Debug)]
struct BatchRequest {
    pages: Vec<Page>,
    #[serde(default)]
    reference_images: Vec<String>,
}

/**
 * \brief 批量出图 SSE：每个进度推送一条 progress 事件，结束时推送 finish。
 */
async fn generate_images_sse(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if req.pages.is_empty() {
        return Err(api_err(Error::Validation("没有需要生成图片的页面".to_string())));
    }
    let images = parse_references(&req.reference_images).map_err(api_err)?;
    let settings = state.settings(ServiceKind::Image).await.map_err(api_err)?;

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let total = req.pages.len();
    let events = state.generator.image_batch(settings, req.pages, images);

    tokio::spawn(async move {
        pin_mut!(events);
        let (mut completed, mut failed) = (0usize, 0usize);
        while let Some(event) = events.next().await {
            match &event {
                BatchEvent::Done { .. } => completed += 1,
                BatchEvent::Failed { .. } => failed += 1,
                BatchEvent::Generating { .. } => {}
            }
            let data = serde_json::to_string(&event).unwrap_or_default();
            if tx.send(Ok(Event::default().event("progress").data(data))).is_err() {
                info!("batch client disconnected, cancelling");
                return;
            }
        }
        let summary = json!({ "total": total, "completed": completed, "failed": failed });
        let _ = tx.send(Ok(Event::default().event("finish").data(summary.to_string())));
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

#[derive(Deserialize, Debug)]
struct TitlesRequest {
    topic: String,
    #[serde(default)]
    outline: String,
}

async fn generate_titles(
    State(state): State<AppState>,
    Json(req): Json<TitlesRequest>,
) -> ApiResult<Value> {
    let settings = state.settings(ServiceKind::Text).await.map_err(api_err)?;
    let titles = state
        .generator
        .generate_titles(&settings, &req.topic, &req.outline)
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "success": true, "titles": titles })))
}

#[derive(Deserialize, Debug)]
struct CaptionsRequest {
    topic: String,
    pages: Vec<Page>,
}

async fn generate_captions(
    State(state): State<AppState>,
    Json(req): Json<CaptionsRequest>,
) -> ApiResult<Value> {
    let settings = state.settings(ServiceKind::Text).await.map_err(api_err)?;
    let captions = state
        .generator
        .generate_captions(&settings, &req.topic, &req.pages)
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "success": true, "captions": captions })))
}

#[derive(Deserialize, Debug)]
struct TagsRequest {
    topic: String,
    #[serde(default)]
    captions: Vec<String>,
}

async fn generate_tags(
    State(state): State<AppState>,
    Json(req): Json<TagsRequest>,
) -> ApiResult<Value> {
    let settings = state.settings(ServiceKind::Text).await.map_err(api_err)?;
    let tags = state
        .generator
        .generate_tags(&settings, &req.topic, &req.captions)
        .await
        .map_err(api_err)?;
    Ok(Json(json!({ "success": true, "tags": tags })))
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    keyword: Option<String>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    let status = match q.status.as_deref().filter(|s| !s.is_empty() && *s != "all") {
        Some(raw) => Some(
            RecordStatus::parse(raw)
                .ok_or_else(|| api_err(Error::Validation(format!("unknown status: {}", raw))))?,
        ),
        None => None,
    };
    let filter = ListFilter {
        status,
        keyword: q.keyword.filter(|k| !k.trim().is_empty()),
    };
    let page = state
        .history
        .list(q.page.unwrap_or(1), q.page_size.unwrap_or(0), filter)
        .await
        .map_err(api_err)?;
    Ok(Json(page))
}

async fn create_history(
    State(state): State<AppState>,
    Json(new): Json<NewHistory>,
) -> ApiResult<Value> {
    let id = state.history.create(new).await.map_err(api_err)?;
    Ok(Json(json!({ "success": true, "record_id": id })))
}

async fn history_stats(State(state): State<AppState>) -> ApiResult<HistoryStats> {
    Ok(Json(state.history.stats().await.map_err(api_err)?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<HistoryRecord> {
    match state.history.read(&id).await.map_err(api_err)? {
        Some(record) => Ok(Json(record)),
        None => Err(api_err(Error::NotFound(id))),
    }
}

async fn update_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<HistoryPatch>,
) -> ApiResult<Value> {
    state.history.update(&id, patch).await.map_err(api_err)?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.history.delete(&id).await.map_err(api_err)?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize, Debug)]
struct LoginRequest {
    email: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Value> {
    let session = state.auth.login(&req.email).await.map_err(api_err)?;
    Ok(Json(json!({ "success": true, "user": session.user, "token": session.token })))
}

async fn current_user(State(state): State<AppState>) -> ApiResult<User> {
    match state.auth.verify().await.map_err(api_err)? {
        Some(user) => Ok(Json(user)),
        None => Err(api_err(Error::Auth("未登录".to_string()))),
    }
}

async fn logout(State(state): State<AppState>) -> ApiResult<Value> {
    state.auth.logout().await.map_err(api_err)?;
    Ok(Json(json!({ "success": true })))
}

async fn drain_notices(State(state): State<AppState>) -> Json<Vec<Notice>> {
    Json(state.notices.drain())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestServer {
        base: String,
        client: reqwest::Client,
        state: AppState,
    }

    async fn start(config: AppConfig) -> TestServer {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        let state =
            AppState::new(Arc::new(Mutex::new(conn)), config).expect("state");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, app_state).await;
        });
        TestServer {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            state,
        }
    }

    fn config_for(mock: &MockServer) -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.max_attempts = 1;
        config.batch.inter_request_delay_ms = 0;
        config.batch.caption_delay_ms = 0;
        for kind in [ServiceKind::Text, ServiceKind::Image] {
            let model = match kind {
                ServiceKind::Text => "gpt-4o",
                ServiceKind::Image => "dall-e-3",
            };
            config.upsert_provider(
                kind,
                "openai",
                ProviderPatch {
                    api_key: Some("sk-live-123".into()),
                    base_url: Some(format!("{}/v1", mock.uri())),
                    model: Some(model.into()),
                    high_concurrency: None,
                },
            );
            config.activate_provider(kind, "openai").expect("activate");
        }
        config
    }

    #[tokio::test]
    async fn test_health_and_providers() {
        let srv = start(AppConfig::default()).await;
        let health: Value = srv
            .client
            .get(format!("{}/api/health", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ok"], true);
        assert_eq!(health["history_backend"], "local");

        let providers: Vec<Value> = srv
            .client
            .get(format!("{}/api/providers", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(providers.len(), 7);
    }

    #[tokio::test]
    async fn test_config_update_masks_and_persists() {
        let srv = start(AppConfig::default()).await;
        let resp = srv
            .client
            .post(format!("{}/api/config", srv.base))
            .json(&json!({
                "service": "text",
                "provider": "openai",
                "apiKey": "sk-secret-value",
                "activate": true
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(
            body["textGeneration"]["providers"]["openai"]["apiKey"],
            "sk-s****"
        );

        // 遮盖值回传不会覆盖真实密钥
        srv.client
            .post(format!("{}/api/config", srv.base))
            .json(&json!({"service": "text", "provider": "openai", "apiKey": "sk-s****"}))
            .send()
            .await
            .unwrap();

        let stored = db::load_app_config(&srv.state.conn.lock().unwrap()).unwrap();
        assert_eq!(
            stored.text_generation.providers["openai"].api_key,
            "sk-secret-value"
        );

        let resp = srv
            .client
            .post(format!("{}/api/config", srv.base))
            .json(&json!({"service": "text", "provider": "nope", "remove": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_outline_without_key_is_bad_request() {
        let srv = start(AppConfig::default()).await;
        let resp = srv
            .client
            .post(format!("{}/api/outline", srv.base))
            .json(&json!({"topic": "秋季穿搭"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error_class"], "validation");
    }

    #[tokio::test]
    async fn test_outline_roundtrip_through_vendor() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "封面<page>内容<page>总结"}}]
            })))
            .mount(&mock)
            .await;

        let srv = start(config_for(&mock)).await;
        let body: Value = srv
            .client
            .post(format!("{}/api/outline", srv.base))
            .json(&json!({"topic": "秋季穿搭"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["pages"].as_array().map(|p| p.len()), Some(3));
        assert_eq!(body["pages"][0]["type"], "cover");
    }

    #[tokio::test]
    async fn test_batch_sse_reports_progress() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"url": "https://cdn.example.com/1.png"}]
            })))
            .mount(&mock)
            .await;

        let srv = start(config_for(&mock)).await;
        let text = srv
            .client
            .post(format!("{}/api/images/batch", srv.base))
            .json(&json!({
                "pages": [
                    {"index": 0, "type": "cover", "content": "a"},
                    {"index": 1, "type": "content", "content": "b"}
                ]
            }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text.matches("event: progress").count(), 4);
        assert!(text.contains("\"status\":\"done\""));
        assert!(text.contains("event: finish"));
        assert!(text.contains("\"completed\":2"));
    }

    #[tokio::test]
    async fn test_history_crud() {
        let srv = start(AppConfig::default()).await;
        let created: Value = srv
            .client
            .post(format!("{}/api/history", srv.base))
            .json(&json!({
                "title": "秋季穿搭",
                "outline": {"raw": "a<page>b", "pages": [
                    {"index": 0, "type": "cover", "content": "a"},
                    {"index": 1, "type": "summary", "content": "b"}
                ]}
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["record_id"].as_str().expect("id").to_string();

        let resp = srv
            .client
            .put(format!("{}/api/history/{}", srv.base, id))
            .json(&json!({"status": "completed"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let listed: Value = srv
            .client
            .get(format!("{}/api/history?status=completed&keyword=秋季", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["total"], 1);

        let stats: Value = srv
            .client
            .get(format!("{}/api/history/stats", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total"], 1);

        srv.client
            .delete(format!("{}/api/history/{}", srv.base, id))
            .send()
            .await
            .unwrap();
        let resp = srv
            .client
            .get(format!("{}/api/history/{}", srv.base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_me_without_session_is_unauthorized() {
        let srv = start(AppConfig::default()).await;
        let resp = srv
            .client
            .get(format!("{}/api/auth/me", srv.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "未登录");

        let notices: Vec<Value> = srv
            .client
            .get(format!("{}/api/notices", srv.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(notices.is_empty());
    }
}
