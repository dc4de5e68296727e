use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::Error;
use crate::models::{OperationKind, ServiceKind};

/**
 * \brief 已知 Provider 的标识。目录是封闭的，新增厂商需在此登记。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenAi,
    Gemini,
    GeminiImage,
    DallE,
    Jimeng,
    Doubao,
    DoubaoSeedream,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::GeminiImage => "gemini-image",
            Self::DallE => "dall-e",
            Self::Jimeng => "jimeng",
            Self::Doubao => "doubao",
            Self::DoubaoSeedream => "doubao-seedream",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PROVIDERS
            .iter()
            .map(|p| p.id)
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown provider: {}", s)))
    }
}

impl Serialize for ProviderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/**
 * \brief 线格式方言。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    OpenAiCompatible,
    GeminiNative,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub image_input: bool,
    pub streaming: bool,
    pub reference_images: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub chat: Option<&'static str>,
    pub completion: Option<&'static str>,
    pub image_generation: Option<&'static str>,
    pub vision: Option<&'static str>,
}

impl Endpoints {
    const fn none() -> Self {
        Self {
            chat: None,
            completion: None,
            image_generation: None,
            vision: None,
        }
    }

    pub fn get(&self, operation: OperationKind) -> Option<&'static str> {
        match operation {
            OperationKind::Chat => self.chat,
            OperationKind::Completion => self.completion,
            OperationKind::ImageGeneration => self.image_generation,
            OperationKind::Vision => self.vision,
        }
    }
}

/**
 * \brief Provider 描述：端点模板、方言与能力开关。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: &'static str,
    pub kind: ServiceKind,
    pub endpoints: Endpoints,
    pub dialect: Dialect,
    pub default_model: &'static str,
    pub capabilities: Capabilities,
    pub image_sizes: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    ImageInput,
    Streaming,
    ReferenceImages,
}

const GEMINI_GENERATE: &str = "/v1beta/models/{model}:generateContent";

static PROVIDERS: [ProviderDescriptor; 7] = [
    ProviderDescriptor {
        id: ProviderId::OpenAi,
        name: "OpenAI",
        kind: ServiceKind::Text,
        endpoints: Endpoints {
            chat: Some("/chat/completions"),
            completion: Some("/completions"),
            ..Endpoints::none()
        },
        dialect: Dialect::OpenAiCompatible,
        default_model: "gpt-4o",
        capabilities: Capabilities {
            image_input: true,
            streaming: true,
            reference_images: true,
        },
        image_sizes: &[],
    },
    ProviderDescriptor {
        id: ProviderId::Gemini,
        name: "Gemini",
        kind: ServiceKind::Text,
        endpoints: Endpoints {
            chat: Some("/chat/completions"),
            vision: Some(GEMINI_GENERATE),
            ..Endpoints::none()
        },
        dialect: Dialect::GeminiNative,
        default_model: "gemini-2.0-flash",
        capabilities: Capabilities {
            image_input: true,
            streaming: false,
            reference_images: true,
        },
        image_sizes: &[],
    },
    ProviderDescriptor {
        id: ProviderId::GeminiImage,
        name: "Gemini Image",
        kind: ServiceKind::Image,
        endpoints: Endpoints {
            image_generation: Some(GEMINI_GENERATE),
            ..Endpoints::none()
        },
        dialect: Dialect::GeminiNative,
        default_model: "gemini-3-pro-image-preview",
        capabilities: Capabilities {
            image_input: false,
            streaming: false,
            reference_images: true,
        },
        image_sizes: &["1024x1024", "1024x1365", "2048x2048"],
    },
    ProviderDescriptor {
        id: ProviderId::DallE,
        name: "DALL-E",
        kind: ServiceKind::Image,
        endpoints: Endpoints {
            image_generation: Some("/images/generations"),
            ..Endpoints::none()
        },
        dialect: Dialect::OpenAiCompatible,
        default_model: "dall-e-3",
        capabilities: Capabilities {
            image_input: false,
            streaming: false,
            reference_images: false,
        },
        image_sizes: &["1024x1024", "1024x1792", "1792x1024"],
    },
    ProviderDescriptor {
        id: ProviderId::Jimeng,
        name: "Jimeng",
        kind: ServiceKind::Image,
        endpoints: Endpoints {
            chat: Some("/chat/completions"),
            ..Endpoints::none()
        },
        dialect: Dialect::OpenAiCompatible,
        default_model: "jimeng-4.5",
        capabilities: Capabilities {
            image_input: true,
            streaming: false,
            reference_images: true,
        },
        image_sizes: &["1024x1365", "1024x1024", "2048x2048", "1365x1024"],
    },
    ProviderDescriptor {
        id: ProviderId::Doubao,
        name: "Doubao",
        kind: ServiceKind::Text,
        endpoints: Endpoints {
            chat: Some("/chat/completions"),
            ..Endpoints::none()
        },
        dialect: Dialect::OpenAiCompatible,
        default_model: "doubao-pro-4k",
        capabilities: Capabilities {
            image_input: true,
            streaming: true,
            reference_images: true,
        },
        image_sizes: &[],
    },
    ProviderDescriptor {
        id: ProviderId::DoubaoSeedream,
        name: "Doubao Seedream",
        kind: ServiceKind::Image,
        endpoints: Endpoints {
            chat: Some("/chat/completions"),
            ..Endpoints::none()
        },
        dialect: Dialect::OpenAiCompatible,
        default_model: "doubao-seedream-4-0-250828",
        capabilities: Capabilities {
            image_input: true,
            streaming: false,
            reference_images: true,
        },
        image_sizes: &["1024x1024", "1024x1365", "2048x2048"],
    },
];

/**
 * \brief 完整的 Provider 目录。
 */
pub fn all() -> &'static [ProviderDescriptor] {
    &PROVIDERS
}

pub fn descriptor(id: ProviderId) -> &'static ProviderDescriptor {
    match id {
        ProviderId::OpenAi => &PROVIDERS[0],
        ProviderId::Gemini => &PROVIDERS[1],
        ProviderId::GeminiImage => &PROVIDERS[2],
        ProviderId::DallE => &PROVIDERS[3],
        ProviderId::Jimeng => &PROVIDERS[4],
        ProviderId::Doubao => &PROVIDERS[5],
        ProviderId::DoubaoSeedream => &PROVIDERS[6],
    }
}

pub fn supports_feature(id: ProviderId, feature: Feature) -> bool {
    let caps = descriptor(id).capabilities;
    match feature {
        Feature::ImageInput => caps.image_input,
        Feature::Streaming => caps.streaming,
        Feature::ReferenceImages => caps.reference_images,
    }
}

pub fn supported_image_sizes(id: ProviderId) -> &'static [&'static str] {
    descriptor(id).image_sizes
}

const GEMINI_HOST: &str = "generativelanguage.googleapis.com";

/**
 * \brief 根据模型名与 baseURL 推断 Provider。
 * \details 先按固定优先级匹配模型名关键字（厂商关键字后再看子型号），
 *          再匹配 baseURL 主机片段，最后回退到 openai 兼容格式。
 *          同时命中多个厂商关键字时，以先检查的关键字为准。
 */
pub fn detect_provider(model: &str, base_url: &str) -> ProviderId {
    let model = model.to_ascii_lowercase();

    if model.contains("dall-e") {
        return ProviderId::DallE;
    }
    if model.contains("gpt") {
        return ProviderId::OpenAi;
    }
    if model.contains("gemini") {
        return if model.contains("image") {
            ProviderId::GeminiImage
        } else {
            ProviderId::Gemini
        };
    }
    if model.contains("jimeng") {
        return ProviderId::Jimeng;
    }
    if model.contains("doubao") {
        return if model.contains("seedream") {
            ProviderId::DoubaoSeedream
        } else {
            ProviderId::Doubao
        };
    }

    if base_url.to_ascii_lowercase().contains(GEMINI_HOST) {
        return ProviderId::Gemini;
    }

    ProviderId::OpenAi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lookup_matches_id() {
        for entry in all() {
            assert_eq!(descriptor(entry.id).id, entry.id);
            assert_eq!(entry.id.as_str().parse::<ProviderId>().unwrap(), entry.id);
        }
        assert!("claude".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_detect_image_variant_before_chat_variant() {
        assert_eq!(
            detect_provider("gemini-3-pro-image-preview", "https://proxy.example.com"),
            ProviderId::GeminiImage
        );
        assert_eq!(
            detect_provider("gemini-2.0-flash", "https://proxy.example.com"),
            ProviderId::Gemini
        );
        assert_eq!(
            detect_provider("doubao-seedream-4-0-250828", ""),
            ProviderId::DoubaoSeedream
        );
        assert_eq!(detect_provider("doubao-pro-4k", ""), ProviderId::Doubao);
    }

    #[test]
    fn test_detect_is_case_insensitive() {
        assert_eq!(detect_provider("GPT-4o", ""), ProviderId::OpenAi);
        assert_eq!(detect_provider("Jimeng-4.5", ""), ProviderId::Jimeng);
    }

    #[test]
    fn test_detect_ambiguous_name_uses_first_keyword() {
        assert_eq!(detect_provider("gpt-gemini-bridge", ""), ProviderId::OpenAi);
        assert_eq!(detect_provider("dall-e-via-gpt", ""), ProviderId::DallE);
        assert_eq!(detect_provider("gemini-doubao-mix", ""), ProviderId::Gemini);
    }

    #[test]
    fn test_detect_falls_back_to_base_url_then_default() {
        assert_eq!(
            detect_provider(
                "my-custom-model",
                "https://generativelanguage.googleapis.com/"
            ),
            ProviderId::Gemini
        );
        assert_eq!(
            detect_provider("my-custom-model", "https://api.example.com/v1"),
            ProviderId::OpenAi
        );
        assert_eq!(detect_provider("", ""), ProviderId::OpenAi);
    }

    #[test]
    fn test_features_and_sizes() {
        assert!(supports_feature(ProviderId::GeminiImage, Feature::ReferenceImages));
        assert!(!supports_feature(ProviderId::GeminiImage, Feature::ImageInput));
        assert!(!supports_feature(ProviderId::DallE, Feature::ReferenceImages));
        assert!(supports_feature(ProviderId::OpenAi, Feature::Streaming));
        assert_eq!(
            supported_image_sizes(ProviderId::Jimeng),
            &["1024x1365", "1024x1024", "2048x2048", "1365x1024"]
        );
        assert!(supported_image_sizes(ProviderId::OpenAi).is_empty());
    }

    #[test]
    fn test_default_dialect_is_openai_compatible() {
        assert_eq!(descriptor(ProviderId::OpenAi).dialect, Dialect::OpenAiCompatible);
        assert_eq!(descriptor(ProviderId::GeminiImage).dialect, Dialect::GeminiNative);
    }
}
