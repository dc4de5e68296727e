use std::time::Duration;

use serde::Serialize;

/**
 * \brief 面向调用方的粗粒度错误分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Validation,
    ClientRejected,
    ServerFailure,
    NetworkFailure,
    ParseFailure,
    StorageFailure,
}

/**
 * \brief SDK 统一错误类型。
 */
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /** \brief 缺少必要配置或参数非法，不重试。 */
    #[error("invalid request: {0}")]
    Validation(String),

    /** \brief 服务端返回 4xx，不重试。 */
    #[error("request rejected: {status} - {message}")]
    ClientRejected { status: u16, message: String },

    /** \brief 服务端返回 5xx，重试耗尽后抛出。 */
    #[error("server error: {status} - {message}")]
    ServerFailure { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /** \brief 响应结构与已知格式均不匹配。 */
    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    /** \brief 本地存储容量已满（含 SQLITE_FULL）。 */
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl Error {
    /**
     * \brief 是否属于可重试的瞬时错误（5xx、网络、超时）。
     */
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerFailure { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::NotFound(_) => ErrorClass::Validation,
            Self::ClientRejected { .. } | Self::Auth(_) => ErrorClass::ClientRejected,
            Self::ServerFailure { .. } => ErrorClass::ServerFailure,
            Self::Network(_) | Self::Timeout(_) => ErrorClass::NetworkFailure,
            Self::Parse(_) => ErrorClass::ParseFailure,
            Self::Storage(_) | Self::QuotaExceeded(_) => ErrorClass::StorageFailure,
        }
    }

    /**
     * \brief 转换为前端可直接展示的提示文案。
     */
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::ClientRejected { status: 401, .. } => "API 密钥无效，请检查配置".to_string(),
            Self::Auth(msg) if msg.trim().is_empty() => "登录状态无效，请重新登录".to_string(),
            Self::Auth(msg) => msg.clone(),
            Self::ClientRejected { status: 404, .. } => {
                "API 端点不存在，请检查 API 配置".to_string()
            }
            Self::ClientRejected { status: 429, .. } => "请求过于频繁，请稍后再试".to_string(),
            Self::ClientRejected { status, message } => {
                if message.is_empty() {
                    format!("请求失败: {}", status)
                } else {
                    message.clone()
                }
            }
            Self::ServerFailure { .. } => "服务器内部错误，请稍后重试".to_string(),
            Self::Network(_) => "网络连接失败，请检查网络或 API 端点是否正确".to_string(),
            Self::Timeout(_) => "请求超时，请检查网络连接后重试".to_string(),
            Self::Parse(msg) => format!("API 返回格式错误: {}", msg),
            Self::Storage(msg) => format!("存储失败: {}", msg),
            Self::QuotaExceeded(_) => "存储空间已满，无法保存历史记录。请手动清理旧记录。".to_string(),
            Self::NotFound(_) => "记录不存在".to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                Self::QuotaExceeded(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        Self::Validation(format!("invalid header value: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
