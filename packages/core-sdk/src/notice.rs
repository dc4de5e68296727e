use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::now_rfc3339;

const MAX_PENDING: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/**
 * \brief 需要展示给用户的提示（例如存储降级、旧记录被清理）。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: String,
}

/**
 * \brief 待展示提示队列，可在各组件之间共享。
 * \details 提示同时写入 tracing 日志；队列只保留最近 50 条，由前端轮询取走。
 */
#[derive(Debug, Clone, Default)]
pub struct Notices {
    inner: Arc<Mutex<VecDeque<Notice>>>,
}

impl Notices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info => info!(notice = %message),
            NoticeLevel::Warning => warn!(notice = %message),
            NoticeLevel::Error => error!(notice = %message),
        }
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(Notice {
            level,
            message,
            created_at: now_rfc3339(),
        });
        while queue.len() > MAX_PENDING {
            queue.pop_front();
        }
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Error, message);
    }

    /**
     * \brief 取走全部待展示提示。
     */
    pub fn drain(&self) -> Vec<Notice> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain() {
        let notices = Notices::new();
        let shared = notices.clone();
        shared.warn("已切换到本地存储");
        notices.push(NoticeLevel::Info, "hello");

        let drained = notices.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].level, NoticeLevel::Warning);
        assert_eq!(drained[0].message, "已切换到本地存储");
        assert!(shared.is_empty());
    }

    #[test]
    fn test_queue_is_bounded() {
        let notices = Notices::new();
        for i in 0..(MAX_PENDING + 5) {
            notices.error(format!("n{}", i));
        }
        let drained = notices.drain();
        assert_eq!(drained.len(), MAX_PENDING);
        assert_eq!(drained[0].message, "n5");
    }
}
