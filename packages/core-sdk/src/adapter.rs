use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::models::{GenerationOutput, GenerationRequest, OperationKind};
use crate::registry::{descriptor, Dialect, ProviderDescriptor, ProviderId};

static IMAGE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s]+\.(jpg|jpeg|png|webp)").expect("valid image url regex")
});

static MARKDOWN_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[.*?\]\((https?://[^)]+)\)").expect("valid markdown image regex")
});

/**
 * \brief 常见尺寸到 Gemini 宽高比的映射。
 */
pub fn aspect_ratio_for_size(size: &str) -> Option<&'static str> {
    match size.trim() {
        "1024x1024" | "2048x2048" => Some("1:1"),
        "1024x1365" => Some("3:4"),
        "1365x1024" => Some("4:3"),
        _ => None,
    }
}

/**
 * \brief 拼接完整请求地址。
 * \details 操作没有专属模板时回退到 chat 模板；`{model}` 用显式模型或默认模型替换。
 *          无论 base 结尾或模板开头有几个斜杠，连接处只保留一个。
 */
pub fn build_endpoint_url(
    base_url: &str,
    provider: ProviderId,
    operation: OperationKind,
    model: Option<&str>,
) -> Result<String> {
    let desc = descriptor(provider);
    let template = desc
        .endpoints
        .get(operation)
        .or(desc.endpoints.chat)
        .ok_or_else(|| {
            Error::Validation(format!(
                "provider {} has no endpoint for {:?}",
                provider, operation
            ))
        })?;

    let model = model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(desc.default_model);
    let path = template.replace("{model}", model);

    Ok(format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/**
 * \brief 将统一请求转换为目标厂商的请求体。
 */
pub fn transform_request(
    request: &GenerationRequest,
    provider: ProviderId,
    operation: OperationKind,
) -> Value {
    let desc = descriptor(provider);
    match desc.dialect {
        Dialect::OpenAiCompatible | Dialect::Custom => internal_body(request, desc, operation),
        Dialect::GeminiNative => match operation {
            OperationKind::ImageGeneration => gemini_image_body(request),
            // vision 端点走原生 generateContent
            OperationKind::Vision => gemini_contents_body(request),
            OperationKind::Chat | OperationKind::Completion => {
                internal_body(request, desc, operation)
            }
        },
    }
}

fn internal_body(
    request: &GenerationRequest,
    desc: &ProviderDescriptor,
    operation: OperationKind,
) -> Value {
    let uses_images_api = operation == OperationKind::ImageGeneration
        && desc
            .endpoints
            .image_generation
            .map(|t| t.contains("images/generations"))
            .unwrap_or(false);

    if uses_images_api {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
        });
        if let Some(size) = &request.size {
            body["size"] = json!(size);
        }
        return body;
    }

    let content = if !request.reference_images.is_empty() && desc.capabilities.reference_images {
        let mut parts = vec![json!({"type": "text", "text": request.prompt})];
        parts.extend(request.reference_images.iter().map(|img| {
            json!({
                "type": "image_url",
                "image_url": {"url": img.to_data_uri()}
            })
        }));
        Value::Array(parts)
    } else {
        json!(request.prompt)
    };

    let mut body = json!({
        "model": request.model,
        "messages": [{"role": "user", "content": content}],
    });
    if let Some(sampling) = &request.sampling {
        if let Some(t) = sampling.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = sampling.max_tokens {
            body["max_tokens"] = json!(m);
        }
    }
    body
}

fn gemini_parts(request: &GenerationRequest) -> Vec<Value> {
    let mut parts = vec![json!({"text": request.prompt})];
    parts.extend(request.reference_images.iter().map(|img| {
        json!({
            "inlineData": {
                "mimeType": img.mime_type,
                "data": img.to_base64(),
            }
        })
    }));
    parts
}

fn gemini_contents_body(request: &GenerationRequest) -> Value {
    let mut body = json!({
        "contents": [{"parts": gemini_parts(request)}],
    });
    if let Some(sampling) = &request.sampling {
        let mut config = Map::new();
        if let Some(t) = sampling.temperature {
            config.insert("temperature".into(), json!(t));
        }
        if let Some(m) = sampling.max_tokens {
            config.insert("maxOutputTokens".into(), json!(m));
        }
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }
    }
    body
}

fn gemini_image_body(request: &GenerationRequest) -> Value {
    let aspect = request
        .size
        .as_deref()
        .and_then(aspect_ratio_for_size)
        .map(str::to_string)
        .or_else(|| request.aspect_ratio.clone());

    let mut generation_config = json!({"responseModalities": ["IMAGE"]});
    if let Some(ratio) = aspect {
        generation_config["imageConfig"] = json!({"aspectRatio": ratio});
    }

    json!({
        "contents": [{"parts": gemini_parts(request)}],
        "generationConfig": generation_config,
    })
}

/**
 * \brief 解析厂商响应，得到图片地址或文本。
 */
pub fn parse_response(
    body: &Value,
    provider: ProviderId,
    operation: OperationKind,
) -> Result<GenerationOutput> {
    let is_image = operation == OperationKind::ImageGeneration;
    match (descriptor(provider).dialect, is_image) {
        (Dialect::OpenAiCompatible | Dialect::Custom, true) => parse_openai_image(body),
        (Dialect::OpenAiCompatible | Dialect::Custom, false) => {
            openai_text(body).map(GenerationOutput::Text).ok_or_else(|| missing("text", body))
        }
        (Dialect::GeminiNative, true) => parse_gemini_image(body),
        (Dialect::GeminiNative, false) => openai_text(body)
            .or_else(|| gemini_text(body))
            .map(GenerationOutput::Text)
            .ok_or_else(|| missing("text", body)),
    }
}

fn parse_openai_image(body: &Value) -> Result<GenerationOutput> {
    let first = body.pointer("/data/0");
    if let Some(url) = first.and_then(|d| d.get("url")).and_then(Value::as_str) {
        return Ok(GenerationOutput::Image(url.to_string()));
    }
    if let Some(b64) = first.and_then(|d| d.get("b64_json")).and_then(Value::as_str) {
        return Ok(GenerationOutput::Image(format!(
            "data:image/png;base64,{}",
            b64
        )));
    }
    if let Some(text) = openai_text(body) {
        if let Some(url) = extract_image_url(&text) {
            return Ok(GenerationOutput::Image(url));
        }
    }
    Err(missing("image", body))
}

/**
 * \brief 从聊天文本中提取图片链接：先找裸链接，再找 markdown 图片。
 */
pub fn extract_image_url(text: &str) -> Option<String> {
    if let Some(m) = IMAGE_URL_RE.find(text) {
        return Some(m.as_str().to_string());
    }
    MARKDOWN_IMAGE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn openai_text(body: &Value) -> Option<String> {
    let choice = body.pointer("/choices/0")?;
    choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .map(str::to_string)
}

fn gemini_text(body: &Value) -> Option<String> {
    let parts = body.pointer("/candidates/0/content/parts")?.as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    }
}

fn parse_gemini_image(body: &Value) -> Result<GenerationOutput> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("image", body))?;

    for part in parts {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
        let Some(inline) = inline else { continue };
        let Some(data) = inline.get("data").and_then(Value::as_str) else {
            continue;
        };
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        return Ok(GenerationOutput::Image(format!(
            "data:{};base64,{}",
            mime, data
        )));
    }
    Err(missing("image", body))
}

fn missing(what: &str, body: &Value) -> Error {
    let mut snippet = body.to_string();
    if snippet.len() > 200 {
        let mut cut = 200;
        while !snippet.is_char_boundary(cut) {
            cut -= 1;
        }
        snippet.truncate(cut);
    }
    Error::Parse(format!("no {} in response: {}", what, snippet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReferenceImage;
    use crate::registry::all;

    #[test]
    fn test_endpoint_join_has_single_slash() {
        for entry in all() {
            for base in ["https://api.example.com/v1", "https://api.example.com/v1/"] {
                let url = build_endpoint_url(base, entry.id, OperationKind::Chat, None)
                    .or_else(|_| {
                        build_endpoint_url(base, entry.id, OperationKind::ImageGeneration, None)
                    })
                    .expect("every provider has some endpoint");
                let tail = url.trim_start_matches("https://");
                assert!(!tail.contains("//"), "double slash in {}", url);
                assert!(url.starts_with("https://api.example.com/v1/"));
            }
        }
    }

    #[test]
    fn test_endpoint_model_substitution_and_fallback() {
        let url = build_endpoint_url(
            "https://g.example.com/",
            ProviderId::GeminiImage,
            OperationKind::ImageGeneration,
            Some(""),
        )
        .unwrap();
        assert_eq!(
            url,
            "https://g.example.com/v1beta/models/gemini-3-pro-image-preview:generateContent"
        );

        // jimeng 没有图片端点，回退到 chat
        let url = build_endpoint_url(
            "https://a.example.com/v1",
            ProviderId::Jimeng,
            OperationKind::ImageGeneration,
            None,
        )
        .unwrap();
        assert_eq!(url, "https://a.example.com/v1/chat/completions");

        let err = build_endpoint_url(
            "https://a.example.com",
            ProviderId::DallE,
            OperationKind::Chat,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_gemini_image_aspect_ratio() {
        let req = GenerationRequest::new(OperationKind::ImageGeneration, "gemini-3-pro-image-preview", "a cat")
            .with_size("1024x1365");
        let body = transform_request(&req, ProviderId::GeminiImage, OperationKind::ImageGeneration);
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "3:4");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "IMAGE");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a cat");

        let req = GenerationRequest::new(OperationKind::ImageGeneration, "m", "a cat")
            .with_size("800x600")
            .with_aspect_ratio("16:9");
        let body = transform_request(&req, ProviderId::GeminiImage, OperationKind::ImageGeneration);
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");

        let req = GenerationRequest::new(OperationKind::ImageGeneration, "m", "a cat");
        let body = transform_request(&req, ProviderId::GeminiImage, OperationKind::ImageGeneration);
        assert!(body["generationConfig"].get("imageConfig").is_none());
    }

    #[test]
    fn test_gemini_unmapped_size_without_ratio_omits_image_config() {
        let req = GenerationRequest::new(OperationKind::ImageGeneration, "m", "a cat")
            .with_size("800x600");
        assert!(aspect_ratio_for_size("800x600").is_none());
        let body = transform_request(&req, ProviderId::GeminiImage, OperationKind::ImageGeneration);
        let config = body["generationConfig"].as_object().expect("generationConfig object");
        assert!(!config.contains_key("imageConfig"));
        assert_eq!(config["responseModalities"][0], "IMAGE");
    }

    #[test]
    fn test_gemini_reference_images_become_inline_data() {
        let req = GenerationRequest::new(OperationKind::ImageGeneration, "m", "p")
            .with_reference_images(vec![ReferenceImage::new(b"hello".to_vec(), "image/jpeg")]);
        let body = transform_request(&req, ProviderId::GeminiImage, OperationKind::ImageGeneration);
        let inline = &body["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(inline["mimeType"], "image/jpeg");
        assert_eq!(inline["data"], "aGVsbG8=");
    }

    #[test]
    fn test_openai_chat_body_with_references_and_sampling() {
        let req = GenerationRequest::new(OperationKind::Chat, "gpt-4o", "describe")
            .with_reference_images(vec![ReferenceImage::new(b"hello".to_vec(), "image/png")])
            .with_sampling(0.3, Some(500));
        let body = transform_request(&req, ProviderId::OpenAi, OperationKind::Chat);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(
            content[1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );
        assert_eq!(body["max_tokens"], 500);

        let plain = GenerationRequest::new(OperationKind::Chat, "gpt-4o", "hi");
        let body = transform_request(&plain, ProviderId::OpenAi, OperationKind::Chat);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_images_api_body() {
        let req = GenerationRequest::new(OperationKind::ImageGeneration, "dall-e-3", "a fox")
            .with_size("1024x1024");
        let body = transform_request(&req, ProviderId::DallE, OperationKind::ImageGeneration);
        assert_eq!(
            body,
            json!({"model": "dall-e-3", "prompt": "a fox", "n": 1, "size": "1024x1024"})
        );

        let body = transform_request(&req, ProviderId::Jimeng, OperationKind::ImageGeneration);
        assert_eq!(body["messages"][0]["content"], "a fox");
    }

    #[test]
    fn test_parse_gemini_image_round_trip() {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"text": "here you go"},
                {"inlineData": {"mimeType": "image/jpeg", "data": "QUJD"}}
            ]}}]
        });
        let out = parse_response(&body, ProviderId::GeminiImage, OperationKind::ImageGeneration)
            .unwrap();
        match out {
            GenerationOutput::Image(uri) => {
                assert!(uri.starts_with("data:image/"));
                assert_eq!(uri, "data:image/jpeg;base64,QUJD");
            }
            other => panic!("unexpected output: {:?}", other),
        }

        let snake = json!({"candidates": [{"content": {"parts": [
            {"inline_data": {"data": "QUJD"}}
        ]}}]});
        assert_eq!(
            parse_response(&snake, ProviderId::GeminiImage, OperationKind::ImageGeneration)
                .unwrap(),
            GenerationOutput::Image("data:image/png;base64,QUJD".into())
        );

        let text_only = json!({"candidates": [{"content": {"parts": [{"text": "sorry"}]}}]});
        assert!(matches!(
            parse_response(&text_only, ProviderId::GeminiImage, OperationKind::ImageGeneration),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_parse_openai_image_variants() {
        let url = json!({"data": [{"url": "https://cdn.example.com/a.png"}]});
        assert_eq!(
            parse_response(&url, ProviderId::DallE, OperationKind::ImageGeneration).unwrap(),
            GenerationOutput::Image("https://cdn.example.com/a.png".into())
        );

        let b64 = json!({"data": [{"b64_json": "QUJD"}]});
        assert_eq!(
            parse_response(&b64, ProviderId::DallE, OperationKind::ImageGeneration).unwrap(),
            GenerationOutput::Image("data:image/png;base64,QUJD".into())
        );

        let chat = json!({"choices": [{"message": {"content": "done: https://img.example.com/x/y.JPG ok"}}]});
        assert_eq!(
            parse_response(&chat, ProviderId::Jimeng, OperationKind::ImageGeneration).unwrap(),
            GenerationOutput::Image("https://img.example.com/x/y.JPG".into())
        );

        let md = json!({"choices": [{"message": {"content": "![pic](https://img.example.com/render?id=42)"}}]});
        assert_eq!(
            parse_response(&md, ProviderId::DoubaoSeedream, OperationKind::ImageGeneration)
                .unwrap(),
            GenerationOutput::Image("https://img.example.com/render?id=42".into())
        );

        let none = json!({"choices": [{"message": {"content": "no picture today"}}]});
        assert!(matches!(
            parse_response(&none, ProviderId::Jimeng, OperationKind::ImageGeneration),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_parse_text_shapes() {
        let chat = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(
            parse_response(&chat, ProviderId::OpenAi, OperationKind::Chat).unwrap(),
            GenerationOutput::Text("hello".into())
        );
        let completion = json!({"choices": [{"text": "legacy"}]});
        assert_eq!(
            parse_response(&completion, ProviderId::OpenAi, OperationKind::Completion).unwrap(),
            GenerationOutput::Text("legacy".into())
        );
        let native = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(
            parse_response(&native, ProviderId::Gemini, OperationKind::Vision).unwrap(),
            GenerationOutput::Text("ab".into())
        );
        assert!(parse_response(&json!({}), ProviderId::OpenAi, OperationKind::Chat).is_err());
    }
}
