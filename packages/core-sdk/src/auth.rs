use std::sync::{Arc, Mutex};

use reqwest::Method;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db;
use crate::error::{Error, Result};
use crate::models::{Session, User};
use crate::transport::{fetch_with_retry, vendor_error_message, HttpRequest, RetryPolicy, Transport};

/**
 * \brief 进程内共享的登录会话。
 */
pub type SharedSession = Arc<RwLock<Option<Session>>>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    user: User,
    token: String,
}

/**
 * \brief 托管认证服务客户端：/auth/login、/auth/me、/auth/logout。
 */
#[derive(Clone)]
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    base_url: String,
}

impl AuthClient {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            retry,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest, fallback: &str) -> Result<T> {
        let resp = fetch_with_retry(self.transport.as_ref(), &request, &self.retry).await?;
        if matches!(resp.status, 401 | 403) {
            return Err(Error::Auth(vendor_error_message(&resp.body)));
        }
        if !resp.is_success() {
            return Err(Error::ClientRejected {
                status: resp.status,
                message: vendor_error_message(&resp.body),
            });
        }
        let envelope: Envelope<T> = serde_json::from_str(&resp.body)
            .map_err(|e| Error::Parse(format!("invalid auth response: {}", e)))?;
        match envelope.data {
            Some(data) if envelope.success => Ok(data),
            _ => Err(Error::Auth(
                envelope.error.unwrap_or_else(|| fallback.to_string()),
            )),
        }
    }

    pub async fn login(&self, email: &str) -> Result<Session> {
        let req = HttpRequest::post_json(self.url("auth/login"), json!({ "email": email }));
        let data: LoginData = self.call(req, "登录失败").await?;
        Ok(Session {
            token: data.token,
            user: data.user,
        })
    }

    pub async fn current_user(&self, token: &str) -> Result<User> {
        let req = HttpRequest::new(Method::GET, self.url("auth/me")).bearer(token)?;
        self.call(req, "获取用户信息失败").await
    }

    pub async fn logout(&self, token: Option<&str>) -> Result<()> {
        let mut req = HttpRequest::post_json(self.url("auth/logout"), json!({}));
        if let Some(token) = token {
            req = req.bearer(token)?;
        }
        let resp = fetch_with_retry(self.transport.as_ref(), &req, &self.retry).await?;
        if resp.is_success() {
            Ok(())
        } else {
            Err(Error::ClientRejected {
                status: resp.status,
                message: vendor_error_message(&resp.body),
            })
        }
    }
}

/**
 * \brief 登录状态管理：会话缓存在 app_config 表中，启动时恢复。
 */
#[derive(Clone)]
pub struct AuthService {
    client: Option<AuthClient>,
    conn: Arc<Mutex<Connection>>,
    session: SharedSession,
}

impl AuthService {
    pub fn new(client: Option<AuthClient>, conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let cached = {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            db::load_session(&guard)?
        };
        if let Some(s) = &cached {
            info!(user = %s.user.email, "restored cached session");
        }
        Ok(Self {
            client,
            conn,
            session: Arc::new(RwLock::new(cached)),
        })
    }

    pub fn handle(&self) -> SharedSession {
        self.session.clone()
    }

    pub async fn current(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    fn client(&self) -> Result<&AuthClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Validation("未配置认证服务地址".to_string()))
    }

    fn persist(&self, session: Option<&Session>) -> Result<()> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match session {
            Some(s) => db::save_session(&guard, s),
            None => db::clear_session(&guard),
        }
    }

    pub async fn login(&self, email: &str) -> Result<Session> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Validation("请输入有效的邮箱地址".to_string()));
        }
        let session = self.client()?.login(email).await?;
        self.persist(Some(&session))?;
        *self.session.write().await = Some(session.clone());
        info!(user = %session.user.email, "logged in");
        Ok(session)
    }

    /**
     * \brief 校验缓存的 token。认证失败时清除会话；网络类错误原样返回，不清除。
     */
    pub async fn verify(&self) -> Result<Option<User>> {
        let Some(current) = self.current().await else {
            return Ok(None);
        };
        match self.client()?.current_user(&current.token).await {
            Ok(user) => {
                let refreshed = Session {
                    token: current.token,
                    user: user.clone(),
                };
                self.persist(Some(&refreshed))?;
                *self.session.write().await = Some(refreshed);
                Ok(Some(user))
            }
            Err(err @ (Error::Auth(_) | Error::ClientRejected { .. })) => {
                warn!(error = %err, "token rejected, clearing session");
                self.clear().await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /**
     * \brief 登出；远端调用失败也会清除本地状态。
     */
    pub async fn logout(&self) -> Result<()> {
        let token = self.current().await.map(|s| s.token);
        if let Some(client) = &self.client {
            if let Err(err) = client.logout(token.as_deref()).await {
                warn!(error = %err, "logout request failed");
            }
        }
        self.clear().await
    }

    async fn clear(&self) -> Result<()> {
        *self.session.write().await = None;
        self.persist(None)
    }
}
