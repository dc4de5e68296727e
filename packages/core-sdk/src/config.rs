use std::collections::BTreeMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::ServiceKind;
use crate::transport::RetryPolicy;

const XOR_KEY: &[u8] = b"redink-2024-xor-key";
const DEFAULT_API_BASE: &str = "https://apipro.maynor1024.live";
const DEFAULT_API_BASE_V1: &str = "https://apipro.maynor1024.live/v1";

/**
 * \brief 单个 Provider 的连接配置。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, rename = "apiKey", skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, rename = "baseURL", alias = "baseUrl")]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "highConcurrency")]
    pub high_concurrency: bool,
}

impl ProviderSettings {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            ..Default::default()
        }
    }

    fn merge(&mut self, patch: ProviderPatch) {
        if let Some(key) = patch.api_key.filter(|k| !k.is_empty()) {
            self.api_key = key;
        }
        if let Some(url) = patch.base_url {
            self.base_url = url;
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(hc) = patch.high_concurrency {
            self.high_concurrency = hc;
        }
    }
}

/**
 * \brief Provider 的局部更新，空 apiKey 不会覆盖已有密钥。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPatch {
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, rename = "baseURL", alias = "baseUrl")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "highConcurrency")]
    pub high_concurrency: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub use_local_config: bool,
    pub default_high_concurrency: bool,
    pub theme: String,
    pub language: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            use_local_config: true,
            default_high_concurrency: false,
            theme: "light".to_string(),
            language: "zh-CN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesPatch {
    use_local_config: Option<bool>,
    default_high_concurrency: Option<bool>,
    theme: Option<String>,
    language: Option<String>,
}

/**
 * \brief 持久化相关配置：本地 SQLite 与托管后端。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceConfig {
    pub db_path: String,
    pub hosted_enabled: bool,
    pub hosted_url: Option<String>,
    pub hosted_anon_key: Option<String>,
    pub auth_url: Option<String>,
    /** \brief 本地历史记录容量上限（字节） */
    pub local_quota_bytes: u64,
    /** \brief 超出容量时保留的最新记录数 */
    pub retention_keep: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: "redink.db".to_string(),
            hosted_enabled: false,
            hosted_url: None,
            hosted_anon_key: None,
            auth_url: None,
            local_quota_bytes: 5 * 1024 * 1024,
            retention_keep: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub inter_request_delay_ms: u64,
    pub caption_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            inter_request_delay_ms: 2000,
            caption_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/**
 * \brief 应用配置。以 JSON 形式保存在 app_config 表中。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub text_generation: ServiceConfig,
    pub image_generation: ServiceConfig,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let text_generation = ServiceConfig {
            active_provider: "openai".to_string(),
            providers: BTreeMap::from([
                (
                    "openai".to_string(),
                    ProviderSettings::new(DEFAULT_API_BASE_V1, "gpt-4o"),
                ),
                (
                    "gemini".to_string(),
                    ProviderSettings::new(DEFAULT_API_BASE, "gemini-2.0-flash"),
                ),
            ]),
        };
        let image_generation = ServiceConfig {
            active_provider: "gemini".to_string(),
            providers: BTreeMap::from([
                (
                    "gemini".to_string(),
                    ProviderSettings::new(DEFAULT_API_BASE, "gemini-3-pro-image-preview"),
                ),
                (
                    "openai".to_string(),
                    ProviderSettings::new(DEFAULT_API_BASE_V1, "dall-e-3"),
                ),
            ]),
        };
        Self {
            text_generation,
            image_generation,
            preferences: Preferences::default(),
            persistence: PersistenceConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/**
 * \brief 当前激活的 Provider（名称 + 配置）。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveProvider {
    pub name: String,
    pub settings: ProviderSettings,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedConfig {
    text_generation: ServiceConfig,
    image_generation: ServiceConfig,
    preferences: Preferences,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceImport {
    active_provider: Option<String>,
    #[serde(default)]
    providers: BTreeMap<String, ProviderPatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigImport {
    text_generation: Option<ServiceImport>,
    image_generation: Option<ServiceImport>,
    preferences: Option<PreferencesPatch>,
}

impl AppConfig {
    pub fn service(&self, kind: ServiceKind) -> &ServiceConfig {
        match kind {
            ServiceKind::Text => &self.text_generation,
            ServiceKind::Image => &self.image_generation,
        }
    }

    pub fn service_mut(&mut self, kind: ServiceKind) -> &mut ServiceConfig {
        match kind {
            ServiceKind::Text => &mut self.text_generation,
            ServiceKind::Image => &mut self.image_generation,
        }
    }

    /**
     * \brief 取出可用于调用的激活 Provider；缺少 API Key 时返回校验错误。
     */
    pub fn active(&self, kind: ServiceKind) -> Result<ActiveProvider> {
        let service = self.service(kind);
        let settings = service
            .providers
            .get(&service.active_provider)
            .filter(|p| !p.api_key.trim().is_empty())
            .ok_or_else(|| {
                Error::Validation(match kind {
                    ServiceKind::Text => "请先在系统设置中配置文本生成 API Key".to_string(),
                    ServiceKind::Image => "请先在系统设置中配置图片生成 API Key".to_string(),
                })
            })?;
        Ok(ActiveProvider {
            name: service.active_provider.clone(),
            settings: settings.clone(),
        })
    }

    pub fn upsert_provider(&mut self, kind: ServiceKind, name: &str, patch: ProviderPatch) {
        self.service_mut(kind)
            .providers
            .entry(name.to_string())
            .or_default()
            .merge(patch);
    }

    pub fn activate_provider(&mut self, kind: ServiceKind, name: &str) -> Result<()> {
        let service = self.service_mut(kind);
        if !service.providers.contains_key(name) {
            return Err(Error::Validation(format!("unknown provider: {}", name)));
        }
        service.active_provider = name.to_string();
        Ok(())
    }

    /**
     * \brief 删除 Provider；若删除的是激活项，则切换到剩余的第一个。
     */
    pub fn remove_provider(&mut self, kind: ServiceKind, name: &str) -> bool {
        let service = self.service_mut(kind);
        let removed = service.providers.remove(name).is_some();
        if !service.providers.contains_key(&service.active_provider) {
            if let Some(first) = service.providers.keys().next() {
                service.active_provider = first.clone();
            }
        }
        removed
    }

    pub fn hosted_available(&self) -> bool {
        let p = &self.persistence;
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        p.hosted_enabled && present(&p.hosted_url) && present(&p.hosted_anon_key)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch.inter_request_delay_ms)
    }

    pub fn caption_delay(&self) -> Duration {
        Duration::from_millis(self.batch.caption_delay_ms)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /**
     * \brief 用 `REDINK_*` 环境变量覆盖默认值。
     */
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let truthy = |v: &str| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");

        if let Some(url) = get("REDINK_OPENAI_BASE_URL") {
            self.provider_entry(ServiceKind::Text, "openai").base_url = url.clone();
            self.provider_entry(ServiceKind::Image, "openai").base_url = url;
        }
        if let Some(url) = get("REDINK_GEMINI_API_URL") {
            self.provider_entry(ServiceKind::Text, "gemini").base_url = url.clone();
            self.provider_entry(ServiceKind::Image, "gemini").base_url = url;
        }
        if let Some(model) = get("REDINK_OPENAI_MODEL") {
            self.provider_entry(ServiceKind::Text, "openai").model = model;
        }
        if let Some(model) = get("REDINK_GEMINI_MODEL") {
            self.provider_entry(ServiceKind::Text, "gemini").model = model;
        }
        if let Some(model) = get("REDINK_IMAGE_MODEL") {
            self.provider_entry(ServiceKind::Image, "gemini").model = model;
        }
        if let Some(flag) = get("REDINK_HIGH_CONCURRENCY") {
            let on = truthy(&flag);
            self.preferences.default_high_concurrency = on;
            self.provider_entry(ServiceKind::Image, "gemini").high_concurrency = on;
            self.provider_entry(ServiceKind::Image, "openai").high_concurrency = on;
        }
        if let Some(key) = get("REDINK_TEXT_API_KEY") {
            let active = self.text_generation.active_provider.clone();
            self.provider_entry(ServiceKind::Text, &active).api_key = key;
        }
        if let Some(key) = get("REDINK_IMAGE_API_KEY") {
            let active = self.image_generation.active_provider.clone();
            self.provider_entry(ServiceKind::Image, &active).api_key = key;
        }
        if let Some(flag) = get("REDINK_ENABLE_HOSTED") {
            self.persistence.hosted_enabled = truthy(&flag);
        }
        if let Some(url) = get("REDINK_HOSTED_URL") {
            self.persistence.hosted_url = Some(url);
        }
        if let Some(key) = get("REDINK_HOSTED_ANON_KEY") {
            self.persistence.hosted_anon_key = Some(key);
        }
        if let Some(url) = get("REDINK_AUTH_URL") {
            self.persistence.auth_url = Some(url);
        }
        if let Some(path) = get("REDINK_DB_PATH") {
            self.persistence.db_path = path;
        }
    }

    fn provider_entry(&mut self, kind: ServiceKind, name: &str) -> &mut ProviderSettings {
        self.service_mut(kind)
            .providers
            .entry(name.to_string())
            .or_default()
    }

    /**
     * \brief 序列化为存储格式，API Key 经过混淆。
     */
    pub fn to_stored_json(&self) -> Result<String> {
        let mut copy = self.clone();
        copy.map_keys(|k| Ok(obfuscate(k)))?;
        serde_json::to_string(&copy).map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn from_stored_json(raw: &str) -> Result<Self> {
        let mut config: AppConfig = serde_json::from_str(raw)
            .map_err(|e| Error::Storage(format!("corrupt config: {}", e)))?;
        config.map_keys(reveal)?;
        Ok(config)
    }

    fn map_keys<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&str) -> Result<String>,
    {
        for service in [&mut self.text_generation, &mut self.image_generation] {
            for settings in service.providers.values_mut() {
                if !settings.api_key.is_empty() {
                    settings.api_key = f(&settings.api_key)?;
                }
            }
        }
        Ok(())
    }

    /**
     * \brief 导出配置，不含任何 API Key。
     */
    pub fn export_json(&self) -> Result<String> {
        let mut exported = ExportedConfig {
            text_generation: self.text_generation.clone(),
            image_generation: self.image_generation.clone(),
            preferences: self.preferences.clone(),
        };
        for service in [&mut exported.text_generation, &mut exported.image_generation] {
            for settings in service.providers.values_mut() {
                settings.api_key.clear();
            }
        }
        serde_json::to_string_pretty(&exported).map_err(|e| Error::Storage(e.to_string()))
    }

    /**
     * \brief 导入配置：只合并已存在的 Provider，导入项没有密钥时保留现有密钥。
     */
    pub fn import_json(&mut self, raw: &str) -> Result<()> {
        let imported: ConfigImport = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("invalid config file: {}", e)))?;

        let sections = [
            (ServiceKind::Text, imported.text_generation),
            (ServiceKind::Image, imported.image_generation),
        ];
        for (kind, section) in sections {
            let Some(section) = section else { continue };
            let service = self.service_mut(kind);
            for (name, patch) in section.providers {
                match service.providers.get_mut(&name) {
                    Some(existing) => existing.merge(patch),
                    None => debug!(provider = %name, "skipping unknown provider on import"),
                }
            }
            if let Some(active) = section.active_provider {
                if service.providers.contains_key(&active) {
                    service.active_provider = active;
                }
            }
        }

        if let Some(prefs) = imported.preferences {
            if let Some(v) = prefs.use_local_config {
                self.preferences.use_local_config = v;
            }
            if let Some(v) = prefs.default_high_concurrency {
                self.preferences.default_high_concurrency = v;
            }
            if let Some(v) = prefs.theme {
                self.preferences.theme = v;
            }
            if let Some(v) = prefs.language {
                self.preferences.language = v;
            }
        }
        Ok(())
    }
}

/**
 * \brief XOR + base64 混淆，仅用于避免明文落盘，不提供安全保证。
 */
pub fn obfuscate(plain: &str) -> String {
    STANDARD.encode(xor(plain.as_bytes()))
}

pub fn reveal(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Storage(format!("corrupt api key: {}", e)))?;
    String::from_utf8(xor(&bytes)).map_err(|e| Error::Storage(format!("corrupt api key: {}", e)))
}

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(XOR_KEY.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.text_generation.active_provider, "openai");
        assert_eq!(cfg.image_generation.active_provider, "gemini");
        assert_eq!(
            cfg.image_generation.providers["gemini"].model,
            "gemini-3-pro-image-preview"
        );
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert_eq!(cfg.batch_delay(), Duration::from_secs(2));
        assert!(!cfg.hosted_available());
    }

    #[test]
    fn test_active_requires_api_key() {
        let mut cfg = AppConfig::default();
        let err = cfg.active(ServiceKind::Text).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        cfg.upsert_provider(
            ServiceKind::Text,
            "openai",
            ProviderPatch {
                api_key: Some("sk-test".into()),
                ..Default::default()
            },
        );
        let active = cfg.active(ServiceKind::Text).unwrap();
        assert_eq!(active.name, "openai");
        assert_eq!(active.settings.model, "gpt-4o");
        assert_eq!(active.settings.api_key, "sk-test");
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REDINK_OPENAI_BASE_URL", "https://proxy.example.com/v1"),
            ("REDINK_IMAGE_MODEL", "jimeng-4.5"),
            ("REDINK_HIGH_CONCURRENCY", "true"),
            ("REDINK_IMAGE_API_KEY", "img-key"),
            ("REDINK_ENABLE_HOSTED", "1"),
            ("REDINK_HOSTED_URL", "https://db.example.com"),
            ("REDINK_HOSTED_ANON_KEY", "anon"),
            ("REDINK_DB_PATH", "   "),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(
            cfg.text_generation.providers["openai"].base_url,
            "https://proxy.example.com/v1"
        );
        assert_eq!(
            cfg.image_generation.providers["openai"].base_url,
            "https://proxy.example.com/v1"
        );
        assert_eq!(cfg.image_generation.providers["gemini"].model, "jimeng-4.5");
        assert!(cfg.image_generation.providers["gemini"].high_concurrency);
        assert_eq!(cfg.image_generation.providers["gemini"].api_key, "img-key");
        assert!(cfg.hosted_available());
        assert_eq!(cfg.persistence.db_path, "redink.db");
    }

    #[test]
    fn test_obfuscation_round_trip() {
        assert_eq!(obfuscate("a"), "Ew==");
        assert_eq!(reveal(&obfuscate("sk-密钥-123")).unwrap(), "sk-密钥-123");
        assert!(reveal("%%%").is_err());

        let mut cfg = AppConfig::default();
        cfg.upsert_provider(
            ServiceKind::Image,
            "gemini",
            ProviderPatch {
                api_key: Some("secret".into()),
                ..Default::default()
            },
        );
        let stored = cfg.to_stored_json().unwrap();
        assert!(!stored.contains("secret"));
        assert_eq!(AppConfig::from_stored_json(&stored).unwrap(), cfg);
    }

    #[test]
    fn test_export_omits_keys_and_import_keeps_them() {
        let mut cfg = AppConfig::default();
        cfg.upsert_provider(
            ServiceKind::Text,
            "openai",
            ProviderPatch {
                api_key: Some("sk-live".into()),
                ..Default::default()
            },
        );
        let exported = cfg.export_json().unwrap();
        assert!(!exported.contains("sk-live"));
        assert!(!exported.contains("apiKey"));

        let incoming = r#"{
            "textGeneration": {
                "activeProvider": "gemini",
                "providers": {
                    "openai": {"baseURL": "https://other.example.com/v1"},
                    "brand-new": {"model": "x"}
                }
            },
            "preferences": {"theme": "dark"}
        }"#;
        cfg.import_json(incoming).unwrap();
        let openai = &cfg.text_generation.providers["openai"];
        assert_eq!(openai.api_key, "sk-live");
        assert_eq!(openai.base_url, "https://other.example.com/v1");
        assert!(!cfg.text_generation.providers.contains_key("brand-new"));
        assert_eq!(cfg.text_generation.active_provider, "gemini");
        assert_eq!(cfg.preferences.theme, "dark");
        assert_eq!(cfg.preferences.language, "zh-CN");

        assert!(cfg.import_json("not json").is_err());
    }

    #[test]
    fn test_activate_and_remove_provider() {
        let mut cfg = AppConfig::default();
        assert!(cfg.activate_provider(ServiceKind::Image, "nope").is_err());
        cfg.activate_provider(ServiceKind::Image, "openai").unwrap();
        assert_eq!(cfg.image_generation.active_provider, "openai");

        assert!(cfg.remove_provider(ServiceKind::Image, "openai"));
        assert_eq!(cfg.image_generation.active_provider, "gemini");
        assert!(!cfg.remove_provider(ServiceKind::Image, "openai"));
    }
}
