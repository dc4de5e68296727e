use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "redink.log";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/**
 * \brief 安装全局 tracing 订阅器。
 * \param file_logging 为 true 时额外写入 logs/redink.log
 * \details 过滤级别取自 RUST_LOG，缺省为 info。重复调用是无害的。
 */
pub fn init(file_logging: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = if file_logging {
        std::fs::create_dir_all(LOG_DIR)
            .with_context(|| format!("failed to create log directory {}", LOG_DIR))?;
        let appender = tracing_appender::rolling::never(LOG_DIR, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(fmt::layer().with_ansi(false).with_writer(writer))
    } else {
        None
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init();
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/**
 * \brief 日志文件路径。
 */
pub fn log_file_path() -> std::path::PathBuf {
    Path::new(LOG_DIR).join(LOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(false).expect("first init");
        init(false).expect("second init");
        assert!(log_file_path().ends_with("redink.log"));
    }
}
