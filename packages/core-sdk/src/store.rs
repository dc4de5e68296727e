use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::{Method, Url};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::auth::SharedSession;
use crate::config::AppConfig;
use crate::db;
use crate::error::{Error, Result};
use crate::models::{
    now_rfc3339, HistoryImages, HistoryPage, HistoryPatch, HistoryRecord, HistoryStats,
    ListFilter, NewHistory, Outline, RecordStatus, Session,
};
use crate::notice::Notices;
use crate::transport::{fetch_with_retry, vendor_error_message, HttpRequest, RetryPolicy, Transport};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/**
 * \brief 历史记录存储接口，本地与托管后端各有一个实现。
 */
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create(&self, new: NewHistory) -> Result<String>;
    async fn read(&self, id: &str) -> Result<Option<HistoryRecord>>;
    /** \brief 记录不存在时返回 `Error::NotFound` */
    async fn update(&self, id: &str, patch: HistoryPatch) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, page: u32, page_size: u32, filter: ListFilter) -> Result<HistoryPage>;
    async fn stats(&self) -> Result<HistoryStats>;
    fn backend(&self) -> &'static str;
}

fn normalize_paging(page: u32, page_size: u32) -> (u32, u32) {
    let size = if page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size.min(MAX_PAGE_SIZE)
    };
    (page.max(1), size)
}

fn apply_patch(record: &mut HistoryRecord, patch: HistoryPatch) {
    if let Some(outline) = patch.outline {
        record.page_count = outline.pages.len() as u32;
        record.outline = outline;
    }
    if let Some(images) = patch.images {
        record.images = images;
    }
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(thumbnail) = patch.thumbnail {
        record.thumbnail = thumbnail;
    }
    record.updated_at = now_rfc3339();
}

/**
 * \brief 基于 SQLite 的本地历史记录。
 * \details 写入前剥离内嵌图片；超出容量时只保留最新的若干条并提示用户，
 *          仍放不下则回滚并返回 `QuotaExceeded`。
 */
pub struct LocalHistoryStore {
    conn: Arc<Mutex<Connection>>,
    quota_bytes: u64,
    retention_keep: usize,
    notices: Notices,
}

impl LocalHistoryStore {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        quota_bytes: u64,
        retention_keep: usize,
        notices: Notices,
    ) -> Self {
        Self {
            conn,
            quota_bytes,
            retention_keep: retention_keep.max(1),
            notices,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn put(conn: &Connection, record: &HistoryRecord, is_new: bool) -> Result<()> {
        if is_new {
            db::insert_history(conn, record)
        } else if db::update_history(conn, record)? {
            Ok(())
        } else {
            Err(Error::NotFound(record.id.clone()))
        }
    }

    fn write(&self, mut record: HistoryRecord, is_new: bool) -> Result<()> {
        let stripped = record.strip_embedded_images();
        if stripped > 0 {
            debug!(id = %record.id, stripped, "dropped embedded images before saving");
        }
        record.page_count = record.outline.pages.len() as u32;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (over_quota, first_failed) = match Self::put(&tx, &record, is_new) {
            Ok(()) => (db::history_bytes(&tx)? > self.quota_bytes, false),
            Err(Error::QuotaExceeded(_)) => (true, true),
            Err(e) => return Err(e),
        };
        if !over_quota {
            tx.commit()?;
            return Ok(());
        }

        let removed = db::trim_history(&tx, self.retention_keep, &record.id)?;
        let rewritten = if first_failed {
            Self::put(&tx, &record, is_new)
        } else {
            Ok(())
        };
        let fits = match rewritten {
            Ok(()) => db::history_bytes(&tx)? <= self.quota_bytes,
            Err(Error::QuotaExceeded(_)) => false,
            Err(e) => return Err(e),
        };

        if fits {
            let kept = db::history_stats(&tx)?.total;
            tx.commit()?;
            if removed > 0 {
                self.notices.warn(format!(
                    "存储空间已满，已自动清理旧记录。保留最新 {} 条记录。",
                    kept
                ));
            }
            return Ok(());
        }

        drop(tx);
        self.notices
            .error("存储空间已满，无法保存历史记录。请手动清理旧记录。");
        Err(Error::QuotaExceeded(format!(
            "record {} does not fit in {} bytes",
            record.id, self.quota_bytes
        )))
    }
}

#[async_trait]
impl HistoryStore for LocalHistoryStore {
    async fn create(&self, new: NewHistory) -> Result<String> {
        let now = now_rfc3339();
        let record = HistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            created_at: now.clone(),
            updated_at: now,
            page_count: new.outline.pages.len() as u32,
            outline: new.outline,
            images: HistoryImages {
                task_id: new.task_id,
                generated: Vec::new(),
            },
            status: RecordStatus::Draft,
            thumbnail: None,
        };
        let id = record.id.clone();
        self.write(record, true)?;
        info!(id = %id, "history record created locally");
        Ok(id)
    }

    async fn read(&self, id: &str) -> Result<Option<HistoryRecord>> {
        db::get_history(&self.lock(), id)
    }

    async fn update(&self, id: &str, patch: HistoryPatch) -> Result<()> {
        let mut record = db::get_history(&self.lock(), id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        apply_patch(&mut record, patch);
        self.write(record, false)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if !db::delete_history(&self.lock(), id)? {
            debug!(id = %id, "delete of missing history record");
        }
        Ok(())
    }

    async fn list(&self, page: u32, page_size: u32, filter: ListFilter) -> Result<HistoryPage> {
        let (page, size) = normalize_paging(page, page_size);
        let offset = (page as u64 - 1) * size as u64;
        let (records, total) = db::list_history(&self.lock(), &filter, offset, size as u64)?;
        Ok(HistoryPage::new(records, total, page, size))
    }

    async fn stats(&self) -> Result<HistoryStats> {
        db::history_stats(&self.lock())
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

/**
 * \brief 托管后端 `projects` 表中的一行。
 */
#[derive(Debug, Deserialize)]
struct ProjectRow {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    outline: Option<Outline>,
    #[serde(default)]
    images: Option<Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    page_count: Option<u32>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl ProjectRow {
    fn into_record(self) -> HistoryRecord {
        let outline = self.outline.unwrap_or_default();
        let mut images = self
            .images
            .and_then(|v| serde_json::from_value::<HistoryImages>(v).ok())
            .unwrap_or_default();
        if images.task_id.is_none() {
            images.task_id = self.task_id;
        }
        let page_count = self
            .page_count
            .unwrap_or(outline.pages.len() as u32);
        let mut record = HistoryRecord {
            id: self.id,
            title: self.title,
            created_at: self.created_at.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or_default(),
            outline,
            images,
            status: self
                .status
                .as_deref()
                .and_then(RecordStatus::parse)
                .unwrap_or(RecordStatus::Draft),
            thumbnail: self.thumbnail_url,
            page_count,
        };
        record.strip_embedded_images();
        record
    }
}

/**
 * \brief 托管后端（PostgREST 风格的 `/rest/v1/projects`）。
 */
pub struct HostedHistoryStore {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    base_url: String,
    anon_key: String,
    session: SharedSession,
}

impl HostedHistoryStore {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
        session: SharedSession,
    ) -> Self {
        Self {
            transport,
            retry,
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            session,
        }
    }

    async fn session(&self) -> Result<Session> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Validation("用户未登录".to_string()))
    }

    fn url(&self, table: &str, query: &[(&str, String)]) -> Result<String> {
        let base = format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table);
        let url = Url::parse_with_params(&base, query)
            .map_err(|e| Error::Validation(format!("invalid hosted url: {}", e)))?;
        Ok(url.to_string())
    }

    fn request(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        session: &Session,
    ) -> Result<HttpRequest> {
        let mut req = match body {
            Some(body) => {
                let mut r = HttpRequest::post_json(url, body);
                r.method = method;
                r
            }
            None => HttpRequest::new(method, url),
        };
        req = req.header("apikey", &self.anon_key)?.bearer(&session.token)?;
        Ok(req)
    }

    async fn send(&self, request: HttpRequest) -> Result<crate::transport::HttpResponse> {
        let resp = fetch_with_retry(self.transport.as_ref(), &request, &self.retry).await?;
        if !resp.is_success() {
            return Err(Error::ClientRejected {
                status: resp.status,
                message: vendor_error_message(&resp.body),
            });
        }
        Ok(resp)
    }

    fn rows(body: &str) -> Result<Vec<ProjectRow>> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(body).map_err(|e| Error::Parse(format!("invalid projects payload: {}", e)))
    }

    fn scope(id: &str, session: &Session) -> Vec<(&'static str, String)> {
        vec![
            ("id", format!("eq.{}", id)),
            ("user_id", format!("eq.{}", session.user.id)),
        ]
    }
}

/**
 * \brief 解析 `Content-Range: 0-19/57` 中的总数。
 */
fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl HistoryStore for HostedHistoryStore {
    async fn create(&self, new: NewHistory) -> Result<String> {
        let session = self.session().await?;
        let body = json!({
            "user_id": session.user.id,
            "title": new.title,
            "topic": new.title,
            "page_count": new.outline.pages.len(),
            "outline": new.outline,
            "images": {"task_id": new.task_id, "generated": []},
            "status": RecordStatus::Draft.as_str(),
            "thumbnail_url": null,
            "task_id": new.task_id,
        });
        let req = self
            .request(Method::POST, self.url("projects", &[])?, Some(body), &session)?
            .header("prefer", "return=representation")?;
        let resp = self.send(req).await?;
        let row = Self::rows(&resp.body)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Parse("insert returned no row".to_string()))?;
        info!(id = %row.id, "history record created in hosted store");
        Ok(row.id)
    }

    async fn read(&self, id: &str) -> Result<Option<HistoryRecord>> {
        let session = self.session().await?;
        let mut query = Self::scope(id, &session);
        query.push(("select", "*".to_string()));
        let req = self.request(Method::GET, self.url("projects", &query)?, None, &session)?;
        let resp = self.send(req).await?;
        Ok(Self::rows(&resp.body)?
            .into_iter()
            .next()
            .map(ProjectRow::into_record))
    }

    async fn update(&self, id: &str, patch: HistoryPatch) -> Result<()> {
        let session = self.session().await?;
        let mut body = Map::new();
        body.insert("updated_at".into(), json!(now_rfc3339()));
        if let Some(outline) = patch.outline {
            body.insert("page_count".into(), json!(outline.pages.len()));
            body.insert("outline".into(), json!(outline));
        }
        if let Some(mut images) = patch.images {
            images.blank_embedded();
            body.insert("images".into(), json!(images));
        }
        if let Some(status) = patch.status {
            body.insert("status".into(), json!(status.as_str()));
        }
        if let Some(thumbnail) = patch.thumbnail {
            let thumbnail = thumbnail.filter(|t| !crate::models::is_embedded(t));
            body.insert("thumbnail_url".into(), json!(thumbnail));
        }

        let url = self.url("projects", &Self::scope(id, &session))?;
        let req = self
            .request(Method::PATCH, url, Some(Value::Object(body)), &session)?
            .header("prefer", "return=representation")?;
        let resp = self.send(req).await?;
        if Self::rows(&resp.body)?.is_empty() {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let session = self.session().await?;
        let images_query = vec![
            ("project_id", format!("eq.{}", id)),
            ("user_id", format!("eq.{}", session.user.id)),
        ];
        let req = self.request(Method::DELETE, self.url("images", &images_query)?, None, &session)?;
        if let Err(err) = self.send(req).await {
            debug!(id = %id, error = %err, "image rows cleanup failed");
        }

        let url = self.url("projects", &Self::scope(id, &session))?;
        let req = self.request(Method::DELETE, url, None, &session)?;
        self.send(req).await?;
        Ok(())
    }

    async fn list(&self, page: u32, page_size: u32, filter: ListFilter) -> Result<HistoryPage> {
        let session = self.session().await?;
        let (page, size) = normalize_paging(page, page_size);
        let offset = (page as u64 - 1) * size as u64;

        let mut query = vec![
            ("select", "*".to_string()),
            ("user_id", format!("eq.{}", session.user.id)),
            ("order", "created_at.desc".to_string()),
            ("limit", size.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(status) = filter.status {
            query.push(("status", format!("eq.{}", status.as_str())));
        }
        if let Some(keyword) = filter.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            query.push(("title", format!("ilike.*{}*", keyword)));
        }

        let req = self
            .request(Method::GET, self.url("projects", &query)?, None, &session)?
            .header("prefer", "count=exact")?;
        let resp = self.send(req).await?;
        let records: Vec<HistoryRecord> = Self::rows(&resp.body)?
            .into_iter()
            .map(ProjectRow::into_record)
            .collect();
        let total = resp
            .header_str("content-range")
            .and_then(parse_content_range)
            .unwrap_or(offset + records.len() as u64);
        Ok(HistoryPage::new(records, total, page, size))
    }

    async fn stats(&self) -> Result<HistoryStats> {
        let session = self.session().await?;
        let query = vec![
            ("select", "status".to_string()),
            ("user_id", format!("eq.{}", session.user.id)),
        ];
        let req = self.request(Method::GET, self.url("projects", &query)?, None, &session)?;
        let resp = self.send(req).await?;
        let rows: Vec<Value> = serde_json::from_str(&resp.body)
            .map_err(|e| Error::Parse(format!("invalid projects payload: {}", e)))?;

        let mut by_status: BTreeMap<RecordStatus, u64> = BTreeMap::new();
        for row in &rows {
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .and_then(RecordStatus::parse)
                .unwrap_or(RecordStatus::Draft);
            *by_status.entry(status).or_default() += 1;
        }
        Ok(HistoryStats {
            total: rows.len() as u64,
            by_status,
        })
    }

    fn backend(&self) -> &'static str {
        "hosted"
    }
}

/**
 * \brief 托管优先、本地兜底的组合存储。
 * \details 托管端失败时（校验错误与记录不存在除外）记录日志、推送提示并改用本地存储。
 */
pub struct FallbackHistoryStore {
    primary: Arc<dyn HistoryStore>,
    fallback: Arc<dyn HistoryStore>,
    notices: Notices,
}

impl FallbackHistoryStore {
    pub fn new(
        primary: Arc<dyn HistoryStore>,
        fallback: Arc<dyn HistoryStore>,
        notices: Notices,
    ) -> Self {
        Self {
            primary,
            fallback,
            notices,
        }
    }

    fn falls_back(&self, op: &str, err: &Error) -> bool {
        if matches!(err, Error::Validation(_) | Error::NotFound(_)) {
            return false;
        }
        warn!(
            op,
            primary = self.primary.backend(),
            fallback = self.fallback.backend(),
            error = %err,
            "history store failed, falling back"
        );
        self.notices
            .warn(format!("云端存储不可用，已改用本地存储：{}", err.user_message()));
        true
    }
}

#[async_trait]
impl HistoryStore for FallbackHistoryStore {
    async fn create(&self, new: NewHistory) -> Result<String> {
        match self.primary.create(new.clone()).await {
            Err(err) if self.falls_back("create", &err) => self.fallback.create(new).await,
            other => other,
        }
    }

    async fn read(&self, id: &str) -> Result<Option<HistoryRecord>> {
        match self.primary.read(id).await {
            Err(err) if self.falls_back("read", &err) => self.fallback.read(id).await,
            other => other,
        }
    }

    async fn update(&self, id: &str, patch: HistoryPatch) -> Result<()> {
        match self.primary.update(id, patch.clone()).await {
            Err(err) if self.falls_back("update", &err) => self.fallback.update(id, patch).await,
            other => other,
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.primary.delete(id).await {
            Err(err) if self.falls_back("delete", &err) => self.fallback.delete(id).await,
            other => other,
        }
    }

    async fn list(&self, page: u32, page_size: u32, filter: ListFilter) -> Result<HistoryPage> {
        match self.primary.list(page, page_size, filter.clone()).await {
            Err(err) if self.falls_back("list", &err) => {
                self.fallback.list(page, page_size, filter).await
            }
            other => other,
        }
    }

    async fn stats(&self) -> Result<HistoryStats> {
        match self.primary.stats().await {
            Err(err) if self.falls_back("stats", &err) => self.fallback.stats().await,
            other => other,
        }
    }

    fn backend(&self) -> &'static str {
        "hosted+local"
    }
}

/**
 * \brief 按配置选择历史存储：启用托管时为托管 + 本地兜底，否则仅本地。
 */
pub fn select_history_store(
    config: &AppConfig,
    conn: Arc<Mutex<Connection>>,
    transport: Arc<dyn Transport>,
    session: SharedSession,
    notices: Notices,
) -> Arc<dyn HistoryStore> {
    let local: Arc<dyn HistoryStore> = Arc::new(LocalHistoryStore::new(
        conn,
        config.persistence.local_quota_bytes,
        config.persistence.retention_keep,
        notices.clone(),
    ));
    if !config.hosted_available() {
        return local;
    }
    let hosted = Arc::new(HostedHistoryStore::new(
        transport,
        config.retry.policy(),
        config.persistence.hosted_url.clone().unwrap_or_default(),
        config.persistence.hosted_anon_key.clone().unwrap_or_default(),
        session,
    ));
    info!("hosted history store enabled with local fallback");
    Arc::new(FallbackHistoryStore::new(hosted, local, notices))
}
