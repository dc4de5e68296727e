use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{Error, ErrorClass, Result};

/**
 * \brief 服务类型：文本生成或图片生成。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Text,
    Image,
}

/**
 * \brief 一次调用的操作类型，对应 Provider 的端点模板。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Chat,
    Completion,
    ImageGeneration,
    Vision,
}

/**
 * \brief 大纲页类型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Cover,
    Content,
    Summary,
}

/**
 * \brief 大纲中的单页。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /** \brief 从 0 开始的连续序号 */
    pub index: u32,
    #[serde(rename = "type")]
    pub page_type: PageType,
    pub content: String,
}

/**
 * \brief 原始大纲文本与解析后的页面。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub raw: String,
    pub pages: Vec<Page>,
}

/**
 * \brief 用户上传的参考图片。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceImage {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    /**
     * \brief 从 data URI 或裸 base64 字符串解析，裸数据按 image/png 处理。
     */
    pub fn from_data_uri(input: &str) -> Result<Self> {
        let (mime_type, payload) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest
                    .split_once(',')
                    .ok_or_else(|| Error::Validation("malformed data URI".to_string()))?;
                let mime = header.trim_end_matches(";base64");
                let mime = if mime.is_empty() { "image/png" } else { mime };
                (mime.to_string(), payload)
            }
            None => ("image/png".to_string(), input),
        };
        let data = STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Validation(format!("invalid base64 image: {}", e)))?;
        Ok(Self { data, mime_type })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/**
 * \brief 统一的生成请求，由 adapter 转换为各家线格式。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub operation: OperationKind,
    pub model: String,
    pub prompt: String,
    pub reference_images: Vec<ReferenceImage>,
    pub size: Option<String>,
    pub aspect_ratio: Option<String>,
    pub sampling: Option<SamplingParams>,
}

impl GenerationRequest {
    pub fn new(
        operation: OperationKind,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            model: model.into(),
            prompt: prompt.into(),
            reference_images: Vec::new(),
            size: None,
            aspect_ratio: None,
            sampling: None,
        }
    }

    pub fn with_reference_images(mut self, images: Vec<ReferenceImage>) -> Self {
        self.reference_images = images;
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: Option<u32>) -> Self {
        self.sampling = Some(SamplingParams {
            temperature: Some(temperature),
            max_tokens,
        });
        self
    }
}

/**
 * \brief 解析后的厂商响应。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    /** \brief 图片 URL 或 data URI */
    Image(String),
    Text(String),
}

/**
 * \brief 返回给前端的生成结果信封。
 */
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl From<Result<GenerationOutput>> for GenerationResult {
    fn from(result: Result<GenerationOutput>) -> Self {
        match result {
            Ok(GenerationOutput::Image(url)) => Self {
                success: true,
                image_url: Some(url),
                ..Default::default()
            },
            Ok(GenerationOutput::Text(text)) => Self {
                success: true,
                text: Some(text),
                ..Default::default()
            },
            Err(err) => Self {
                success: false,
                error: Some(err.user_message()),
                error_class: Some(err.class()),
                ..Default::default()
            },
        }
    }
}

/**
 * \brief 历史记录状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Draft,
    Generating,
    Completed,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "generating" => Some(Self::Generating),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryImages {
    pub task_id: Option<String>,
    /** \brief 只保存 URL 引用，不保存 base64 图片 */
    #[serde(default)]
    pub generated: Vec<String>,
}

impl HistoryImages {
    /**
     * \brief 将内嵌图片替换为空串占位，保持与页面一一对应。
     */
    pub fn blank_embedded(&mut self) -> usize {
        let mut blanked = 0;
        for url in self.generated.iter_mut().filter(|u| is_embedded(u)) {
            url.clear();
            blanked += 1;
        }
        blanked
    }
}

/**
 * \brief 持久化的历史记录。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub outline: Outline,
    pub images: HistoryImages,
    pub status: RecordStatus,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub page_count: u32,
}

impl HistoryRecord {
    /**
     * \brief 去掉内嵌的 data URI，保证记录中只有引用。
     */
    pub fn strip_embedded_images(&mut self) -> usize {
        let mut removed = self.images.blank_embedded();
        if self.thumbnail.as_deref().map(is_embedded).unwrap_or(false) {
            self.thumbnail = None;
            removed += 1;
        }
        removed
    }
}

pub fn is_embedded(url: &str) -> bool {
    url.trim_start().starts_with("data:")
}

/**
 * \brief 新建历史记录所需字段。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHistory {
    pub title: String,
    pub outline: Outline,
    #[serde(default)]
    pub task_id: Option<String>,
}

/**
 * \brief 局部更新，未提供的字段保持不变；thumbnail 可显式置空。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPatch {
    #[serde(default)]
    pub outline: Option<Outline>,
    #[serde(default)]
    pub images: Option<HistoryImages>,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default, deserialize_with = "explicit_option")]
    pub thumbnail: Option<Option<String>>,
}

fn explicit_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub status: Option<RecordStatus>,
    /** \brief 标题关键字，大小写不敏感 */
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl HistoryPage {
    pub fn new(records: Vec<HistoryRecord>, total: u64, page: u32, page_size: u32) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size as u64) as u32
        };
        Self {
            records,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub by_status: BTreeMap<RecordStatus, u64>,
}

/**
 * \brief 登录用户信息。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: User,
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
