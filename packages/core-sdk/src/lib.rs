pub mod adapter;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod notice;
pub mod outline;
pub mod registry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use error::{Error, ErrorClass, Result};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{AppConfig, ProviderPatch, ProviderSettings};
    pub use crate::db;
    pub use crate::llm::{BatchEvent, Generator, OutlineResult};
    pub use crate::models;
    pub use crate::registry;
    pub use crate::server;
    pub use crate::store::HistoryStore;
    pub use crate::telemetry;
    pub use crate::{Error, Result};
}
