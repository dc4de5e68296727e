use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/**
 * \brief 传输层请求。body 为 JSON 时自动附带 Content-Type。
 */
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::POST, url);
        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        req.body = Some(body);
        req
    }

    pub fn bearer(mut self, token: &str) -> Result<Self> {
        self.headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
        Ok(self)
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Result<Self> {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_str(value)?);
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| Error::Parse(format!("invalid JSON body: {}", e)))
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/**
 * \brief 发送单次 HTTP 请求的抽象，便于在测试中替换。
 */
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/**
 * \brief 基于 reqwest 的默认实现。
 */
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/**
 * \brief 重试策略：指数退避，单次请求有超时。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/**
 * \brief 从厂商错误响应中取出可读信息，优先 `error.message`。
 */
pub fn vendor_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let msg = v
            .pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("msg"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .and_then(Value::as_str);
        if let Some(msg) = msg {
            return msg.to_string();
        }
    }
    body.chars().take(200).collect()
}

/**
 * \brief 带超时与退避的请求执行。
 * \details 4xx 直接返回给调用方，不重试；5xx、网络错误、超时按退避重试，
 *          每次等待后延迟翻倍并受 max_delay 限制。次数耗尽后返回最后一次错误。
 */
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    request: &HttpRequest,
    policy: &RetryPolicy,
) -> Result<HttpResponse> {
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay.min(policy.max_delay);

    for attempt in 1..=attempts {
        debug!(url = %request.url, attempt, "sending request");
        let err = match tokio::time::timeout(policy.attempt_timeout, transport.send(request)).await
        {
            Ok(Ok(resp)) if resp.status < 500 => return Ok(resp),
            Ok(Ok(resp)) => Error::ServerFailure {
                status: resp.status,
                message: vendor_error_message(&resp.body),
            },
            Ok(Err(err)) => err,
            Err(_) => Error::Timeout(policy.attempt_timeout),
        };

        if !err.is_retryable() || attempt == attempts {
            return Err(err);
        }

        warn!(
            url = %request.url,
            attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "request failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(policy.max_delay);
    }

    Err(Error::Network("retry loop exited without a result".to_string()))
}
