use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::{build_endpoint_url, parse_response, transform_request};
use crate::config::{AppConfig, ProviderSettings};
use crate::error::{Error, ErrorClass, Result};
use crate::models::{
    GenerationOutput, GenerationRequest, OperationKind, Page, ReferenceImage,
};
use crate::outline::{parse_outline, parse_tags, parse_titles};
use crate::registry::{descriptor, detect_provider, supports_feature, Feature, ProviderId};
use crate::transport::{fetch_with_retry, vendor_error_message, HttpRequest, RetryPolicy, Transport};

const DEFAULT_ASPECT_RATIO: &str = "3:4";
const CAPTION_PLACEHOLDER: &str = "文案生成失败";

/**
 * \brief 大纲生成结果。
 */
#[derive(Debug, Clone, Serialize)]
pub struct OutlineResult {
    pub raw: String,
    pub pages: Vec<Page>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_analysis: Option<String>,
}

/**
 * \brief 批量出图的进度事件。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchEvent {
    Generating {
        index: usize,
    },
    Done {
        index: usize,
        image_url: String,
    },
    #[serde(rename = "error")]
    Failed {
        index: usize,
        error: String,
        error_class: ErrorClass,
    },
}

/**
 * \brief 生成服务：检测 Provider → 转换请求 → 带重试发送 → 解析响应。
 */
#[derive(Clone)]
pub struct Generator {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    batch_delay: Duration,
    caption_delay: Duration,
}

impl Generator {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            batch_delay: Duration::from_secs(2),
            caption_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &AppConfig) -> Self {
        Self::new(transport, config.retry.policy())
            .with_delays(config.batch_delay(), config.caption_delay())
    }

    pub fn with_delays(mut self, batch_delay: Duration, caption_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self.caption_delay = caption_delay;
        self
    }

    fn model_for(settings: &ProviderSettings, provider: ProviderId) -> String {
        let model = settings.model.trim();
        if model.is_empty() {
            descriptor(provider).default_model.to_string()
        } else {
            model.to_string()
        }
    }

    /**
     * \brief 执行一次生成调用。缺少 API Key 时不发起网络请求。
     */
    async fn execute(
        &self,
        settings: &ProviderSettings,
        provider: ProviderId,
        request: GenerationRequest,
    ) -> Result<GenerationOutput> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::Validation("请先配置 API Key".to_string()));
        }
        let operation = request.operation;
        let url = build_endpoint_url(
            &settings.base_url,
            provider,
            operation,
            Some(&request.model),
        )?;
        let body = transform_request(&request, provider, operation);
        let http = HttpRequest::post_json(url, body).bearer(settings.api_key.trim())?;

        let resp = fetch_with_retry(self.transport.as_ref(), &http, &self.retry).await?;
        if !resp.is_success() {
            return Err(Error::ClientRejected {
                status: resp.status,
                message: vendor_error_message(&resp.body),
            });
        }
        parse_response(&resp.json()?, provider, operation)
    }

    async fn complete_text(
        &self,
        settings: &ProviderSettings,
        prompt: String,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let provider = detect_provider(&settings.model, &settings.base_url);
        let request = GenerationRequest::new(
            OperationKind::Chat,
            Self::model_for(settings, provider),
            prompt,
        )
        .with_sampling(temperature, max_tokens);
        match self.execute(settings, provider, request).await? {
            GenerationOutput::Text(text) => Ok(text.trim().to_string()),
            GenerationOutput::Image(_) => Err(Error::Parse("expected text response".to_string())),
        }
    }

    async fn analyze_images(
        &self,
        settings: &ProviderSettings,
        provider: ProviderId,
        images: &[ReferenceImage],
    ) -> Result<String> {
        let request = GenerationRequest::new(
            OperationKind::Vision,
            Self::model_for(settings, provider),
            "分析这些图片的内容、风格和主题，为生成小红书内容提供参考。",
        )
        .with_reference_images(images.to_vec());
        match self.execute(settings, provider, request).await? {
            GenerationOutput::Text(text) => Ok(text.trim().to_string()),
            GenerationOutput::Image(_) => Err(Error::Parse("expected text response".to_string())),
        }
    }

    /**
     * \brief 根据主题生成多页大纲。
     * \details 带参考图且 Provider 支持图片输入时，先做一次视觉分析；分析失败只记录日志。
     */
    pub async fn generate_outline(
        &self,
        settings: &ProviderSettings,
        topic: &str,
        reference_images: &[ReferenceImage],
    ) -> Result<OutlineResult> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(Error::Validation("请输入主题".to_string()));
        }
        if settings.api_key.trim().is_empty() {
            return Err(Error::Validation(
                "请先在系统设置中配置文本生成 API Key".to_string(),
            ));
        }

        let mut prompt = format!(
            "请为以下主题生成小红书图文内容大纲：\n\n主题：{}\n\n要求：\n\
             1. 生成3-5页内容，第一页为封面，最后一页为总结\n\
             2. 每页内容50-100字\n\
             3. 内容要有吸引力，适合小红书平台\n\
             4. 页与页之间用 <page> 分隔\n\n\
             请直接生成大纲，不需要额外解释。",
            topic
        );

        let provider = detect_provider(&settings.model, &settings.base_url);
        let mut image_analysis = None;
        if !reference_images.is_empty() && supports_feature(provider, Feature::ImageInput) {
            match self.analyze_images(settings, provider, reference_images).await {
                Ok(analysis) if !analysis.is_empty() => {
                    prompt.push_str(&format!("\n\n参考图片分析：{}", analysis));
                    image_analysis = Some(analysis);
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "image analysis failed, continuing without it"),
            }
        }

        let raw = self.complete_text(settings, prompt, 0.7, Some(2000)).await?;
        let pages = parse_outline(&raw);
        if pages.is_empty() {
            return Err(Error::Parse("outline response contained no pages".to_string()));
        }
        info!(provider = %provider, pages = pages.len(), "outline generated");
        Ok(OutlineResult {
            raw,
            pages,
            image_analysis,
        })
    }

    /**
     * \brief 为一页内容生成配图，返回图片 URL 或 data URI。
     */
    pub async fn generate_image(
        &self,
        settings: &ProviderSettings,
        content: &str,
        reference_images: &[ReferenceImage],
    ) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("请提供图片生成内容".to_string()));
        }
        if settings.api_key.trim().is_empty() {
            return Err(Error::Validation(
                "请先在系统设置中配置图片生成 API Key".to_string(),
            ));
        }

        let mut prompt = format!(
            "Create a beautiful, professional illustration for social media post. \
             Content: {}. Style: modern, clean, eye-catching, suitable for Xiaohongshu \
             (Little Red Book) platform.",
            content
        );
        if !reference_images.is_empty() {
            prompt.push_str(
                "\n\nIMPORTANT: Use the provided reference images as visual guidance for style, \
                 composition, and content.",
            );
        }

        let provider = detect_provider(&settings.model, &settings.base_url);
        let mut request = GenerationRequest::new(
            OperationKind::ImageGeneration,
            Self::model_for(settings, provider),
            prompt,
        )
        .with_reference_images(reference_images.to_vec())
        .with_aspect_ratio(DEFAULT_ASPECT_RATIO);
        match provider {
            ProviderId::DallE => request = request.with_size("1024x1024"),
            ProviderId::Jimeng => request = request.with_sampling(0.7, Some(2000)),
            _ => {}
        }

        match self.execute(settings, provider, request).await? {
            GenerationOutput::Image(url) => Ok(url),
            GenerationOutput::Text(_) => Err(Error::Parse(format!(
                "{} API 返回格式错误，未找到图片",
                provider
            ))),
        }
    }

    /**
     * \brief 逐页生成配图的事件流。
     * \details 严格按顺序处理，两页之间等待 batch_delay（最后一页之后不等待）；
     *          单页失败不会中断后续页面。丢弃流即取消剩余工作。
     */
    pub fn image_batch(
        &self,
        settings: ProviderSettings,
        pages: Vec<Page>,
        reference_images: Vec<ReferenceImage>,
    ) -> impl Stream<Item = BatchEvent> + Send + 'static {
        let this = self.clone();
        stream! {
            let total = pages.len();
            for (index, page) in pages.into_iter().enumerate() {
                yield BatchEvent::Generating { index };
                match this.generate_image(&settings, &page.content, &reference_images).await {
                    Ok(image_url) => {
                        yield BatchEvent::Done { index, image_url };
                    }
                    Err(err) => {
                        warn!(index, error = %err, "page image failed");
                        yield BatchEvent::Failed {
                            index,
                            error: err.user_message(),
                            error_class: err.class(),
                        };
                    }
                }
                if index + 1 < total {
                    tokio::time::sleep(this.batch_delay).await;
                }
            }
        }
    }

    /**
     * \brief 以回调方式驱动批量出图，返回每页的图片地址（失败为 None）。
     */
    pub async fn generate_images_for_pages<F>(
        &self,
        settings: &ProviderSettings,
        pages: &[Page],
        reference_images: &[ReferenceImage],
        mut on_progress: F,
    ) -> Vec<Option<String>>
    where
        F: FnMut(&BatchEvent),
    {
        let mut results = vec![None; pages.len()];
        let events = self.image_batch(settings.clone(), pages.to_vec(), reference_images.to_vec());
        pin_mut!(events);
        while let Some(event) = events.next().await {
            on_progress(&event);
            if let BatchEvent::Done { index, image_url } = event {
                results[index] = Some(image_url);
            }
        }
        results
    }

    pub async fn regenerate_page_image(
        &self,
        settings: &ProviderSettings,
        page: &Page,
        reference_images: &[ReferenceImage],
    ) -> Result<String> {
        info!(index = page.index, "regenerating page image");
        self.generate_image(settings, &page.content, reference_images)
            .await
    }

    /**
     * \brief 生成最多 5 个小红书风格标题。
     */
    pub async fn generate_titles(
        &self,
        settings: &ProviderSettings,
        topic: &str,
        outline_raw: &str,
    ) -> Result<Vec<String>> {
        let prompt = format!(
            "为以下主题生成5个小红书风格的标题，要求：\n\
             1. 简洁吸引人，15-20字以内\n\
             2. 使用emoji表情增加吸引力\n\
             3. 包含热门标签或关键词\n\
             4. 符合小红书平台的调性\n\n\
             主题：{}\n大纲：{}\n\n请直接返回5个标题，每行一个：",
            topic, outline_raw
        );
        let text = self.complete_text(settings, prompt, 0.8, None).await?;
        let titles = parse_titles(&text);
        if titles.is_empty() {
            return Err(Error::Parse("no titles in response".to_string()));
        }
        Ok(titles)
    }

    /**
     * \brief 逐页生成文案；单页失败时以占位文案代替。
     */
    pub async fn generate_captions(
        &self,
        settings: &ProviderSettings,
        topic: &str,
        pages: &[Page],
    ) -> Result<Vec<String>> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::Validation("请先配置 API Key".to_string()));
        }
        let mut captions = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let prompt = format!(
                "为以下内容生成小红书风格的文案：\n主题：{}\n内容：{}\n\n要求：\n\
                 1. 100-150字\n2. 亲切自然的语气\n3. 适当使用emoji\n\
                 4. 包含实用信息或个人感受\n5. 适合配图发布",
                topic, page.content
            );
            match self.complete_text(settings, prompt, 0.7, None).await {
                Ok(text) if !text.is_empty() => captions.push(text),
                Ok(_) => captions.push(CAPTION_PLACEHOLDER.to_string()),
                Err(err) => {
                    warn!(index = i, error = %err, "caption generation failed");
                    captions.push(CAPTION_PLACEHOLDER.to_string());
                }
            }
            if i + 1 < pages.len() {
                tokio::time::sleep(self.caption_delay).await;
            }
        }
        Ok(captions)
    }

    /**
     * \brief 根据主题与文案生成最多 15 个标签。
     */
    pub async fn generate_tags(
        &self,
        settings: &ProviderSettings,
        topic: &str,
        captions: &[String],
    ) -> Result<Vec<String>> {
        let prompt = format!(
            "根据以下主题和文案，生成10-15个小红书热门标签：\n主题：{}\n文案概要：{}\n\n要求：\n\
             1. 包含主题相关的核心标签\n2. 添加流行的生活/美学类标签\n3. 使用#格式\n\
             4. 每行一个标签\n5. 优先选择小红书平台热门标签\n\n请直接返回标签列表：",
            topic,
            captions.join("\n")
        );
        let text = self.complete_text(settings, prompt, 0.8, None).await?;
        let tags = parse_tags(&text);
        if tags.is_empty() {
            return Err(Error::Parse("no tags in response".to_string()));
        }
        Ok(tags)
    }
}
