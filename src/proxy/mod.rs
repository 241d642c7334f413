// Proxy module - provider registry, request routing and payload translation

pub mod router;
pub mod thinking;
pub mod tools;
pub mod translator;

use serde::{Deserialize, Serialize};

/// Upstream vendors the gateway knows how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
    Vertex,
    DeepSeek,
    Moonshot,
    Zhipu,
    Qwen,
    MiniMax,
    Doubao,
    Mistral,
    Xai,
    OpenRouter,
}

/// Shape of the request body the upstream expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSchema {
    /// `{ model, messages[], stream, ... }`
    ChatMessages,
    /// Gemini-native `{ contents[], generationConfig, ... }` with the model in the URL
    GeminiContents,
}

/// How the credential travels to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    AnthropicKey,
    GoogleKey,
}

/// Static description of one upstream vendor.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub credential_key: &'static str,
    pub model_key: &'static str,
    pub url_key: Option<&'static str>,
    pub target_url: &'static str,
    pub local_path: &'static str,
    pub default_model: &'static str,
    pub schema: PayloadSchema,
    pub auth: AuthStyle,
    /// Vendor speaks OpenAI-style function calling, so the time tool may be injected
    pub supports_time_tool: bool,
}

impl Provider {
    pub const ALL: [Provider; 13] = [
        Provider::OpenAI,
        Provider::Anthropic,
        Provider::Google,
        Provider::Vertex,
        Provider::DeepSeek,
        Provider::Moonshot,
        Provider::Zhipu,
        Provider::Qwen,
        Provider::MiniMax,
        Provider::Doubao,
        Provider::Mistral,
        Provider::Xai,
        Provider::OpenRouter,
    ];

    pub fn descriptor(self) -> &'static ProviderDescriptor {
        match self {
            Provider::OpenAI => &OPENAI,
            Provider::Anthropic => &ANTHROPIC,
            Provider::Google => &GOOGLE,
            Provider::Vertex => &VERTEX,
            Provider::DeepSeek => &DEEPSEEK,
            Provider::Moonshot => &MOONSHOT,
            Provider::Zhipu => &ZHIPU,
            Provider::Qwen => &QWEN,
            Provider::MiniMax => &MINIMAX,
            Provider::Doubao => &DOUBAO,
            Provider::Mistral => &MISTRAL,
            Provider::Xai => &XAI,
            Provider::OpenRouter => &OPENROUTER,
        }
    }

    pub fn id(self) -> &'static str {
        self.descriptor().id
    }

    /// Look a provider up by its path segment (`/api/{id}`).
    pub fn resolve(id: &str) -> Option<Provider> {
        let id = id.trim().to_ascii_lowercase();
        Provider::ALL.into_iter().find(|p| p.descriptor().id == id)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

const OPENAI: ProviderDescriptor = ProviderDescriptor {
    id: "openai",
    credential_key: "OPENAI_API_KEY",
    model_key: "OPENAI_MODEL",
    url_key: Some("OPENAI_API_URL"),
    target_url: "https://api.openai.com/v1/chat/completions",
    local_path: "/api/openai",
    default_model: "gpt-4o-mini",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const ANTHROPIC: ProviderDescriptor = ProviderDescriptor {
    id: "anthropic",
    credential_key: "ANTHROPIC_API_KEY",
    model_key: "ANTHROPIC_MODEL",
    url_key: Some("ANTHROPIC_API_URL"),
    target_url: "https://api.anthropic.com/v1/messages",
    local_path: "/api/anthropic",
    default_model: "claude-sonnet-4-5",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::AnthropicKey,
    supports_time_tool: false,
};

const GOOGLE: ProviderDescriptor = ProviderDescriptor {
    id: "google",
    credential_key: "GOOGLE_API_KEY",
    model_key: "GOOGLE_MODEL",
    url_key: Some("GOOGLE_API_URL"),
    target_url: "https://generativelanguage.googleapis.com/v1beta/models",
    local_path: "/api/google",
    default_model: "gemini-2.5-flash",
    schema: PayloadSchema::GeminiContents,
    auth: AuthStyle::GoogleKey,
    supports_time_tool: false,
};

const VERTEX: ProviderDescriptor = ProviderDescriptor {
    id: "vertex",
    credential_key: "VERTEX_API_KEY",
    model_key: "VERTEX_MODEL",
    url_key: Some("VERTEX_API_URL"),
    target_url: "https://aiplatform.googleapis.com/v1/publishers/google/models",
    local_path: "/api/vertex",
    default_model: "gemini-2.5-flash",
    schema: PayloadSchema::GeminiContents,
    auth: AuthStyle::GoogleKey,
    supports_time_tool: false,
};

const DEEPSEEK: ProviderDescriptor = ProviderDescriptor {
    id: "deepseek",
    credential_key: "DEEPSEEK_API_KEY",
    model_key: "DEEPSEEK_MODEL",
    url_key: None,
    target_url: "https://api.deepseek.com/chat/completions",
    local_path: "/api/deepseek",
    default_model: "deepseek-chat",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const MOONSHOT: ProviderDescriptor = ProviderDescriptor {
    id: "moonshot",
    credential_key: "MOONSHOT_API_KEY",
    model_key: "MOONSHOT_MODEL",
    url_key: None,
    target_url: "https://api.moonshot.cn/v1/chat/completions",
    local_path: "/api/moonshot",
    default_model: "kimi-k2-0905-preview",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const ZHIPU: ProviderDescriptor = ProviderDescriptor {
    id: "zhipu",
    credential_key: "ZHIPU_API_KEY",
    model_key: "ZHIPU_MODEL",
    url_key: None,
    target_url: "https://open.bigmodel.cn/api/paas/v4/chat/completions",
    local_path: "/api/zhipu",
    default_model: "glm-4.6",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const QWEN: ProviderDescriptor = ProviderDescriptor {
    id: "qwen",
    credential_key: "DASHSCOPE_API_KEY",
    model_key: "QWEN_MODEL",
    url_key: Some("QWEN_API_URL"),
    target_url: "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
    local_path: "/api/qwen",
    default_model: "qwen-plus",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const MINIMAX: ProviderDescriptor = ProviderDescriptor {
    id: "minimax",
    credential_key: "MINIMAX_API_KEY",
    model_key: "MINIMAX_MODEL",
    url_key: Some("MINIMAX_API_URL"),
    target_url: "https://api.minimaxi.com/v1/text/chatcompletion_v2",
    local_path: "/api/minimax",
    default_model: "MiniMax-M2",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const DOUBAO: ProviderDescriptor = ProviderDescriptor {
    id: "doubao",
    credential_key: "ARK_API_KEY",
    model_key: "DOUBAO_MODEL",
    url_key: None,
    target_url: "https://ark.cn-beijing.volces.com/api/v3/chat/completions",
    local_path: "/api/doubao",
    default_model: "doubao-seed-1-6-250615",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const MISTRAL: ProviderDescriptor = ProviderDescriptor {
    id: "mistral",
    credential_key: "MISTRAL_API_KEY",
    model_key: "MISTRAL_MODEL",
    url_key: None,
    target_url: "https://api.mistral.ai/v1/chat/completions",
    local_path: "/api/mistral",
    default_model: "mistral-large-latest",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const XAI: ProviderDescriptor = ProviderDescriptor {
    id: "xai",
    credential_key: "XAI_API_KEY",
    model_key: "XAI_MODEL",
    url_key: None,
    target_url: "https://api.x.ai/v1/chat/completions",
    local_path: "/api/xai",
    default_model: "grok-4",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

const OPENROUTER: ProviderDescriptor = ProviderDescriptor {
    id: "openrouter",
    credential_key: "OPENROUTER_API_KEY",
    model_key: "OPENROUTER_MODEL",
    url_key: None,
    target_url: "https://openrouter.ai/api/v1/chat/completions",
    local_path: "/api/openrouter",
    default_model: "openai/gpt-4o-mini",
    schema: PayloadSchema::ChatMessages,
    auth: AuthStyle::Bearer,
    supports_time_tool: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_provider_ids() {
        assert_eq!(Provider::resolve("openai"), Some(Provider::OpenAI));
        assert_eq!(Provider::resolve(" Anthropic "), Some(Provider::Anthropic));
        assert_eq!(Provider::resolve("unknown"), None);
    }

    #[test]
    fn test_descriptor_table_is_consistent() {
        for provider in Provider::ALL {
            let d = provider.descriptor();
            assert_eq!(d.local_path, format!("/api/{}", d.id));
            assert_eq!(Provider::resolve(d.id), Some(provider));
            assert!(d.credential_key.ends_with("_API_KEY"));
        }
    }

    #[test]
    fn test_gemini_native_providers() {
        let native: Vec<_> = Provider::ALL
            .into_iter()
            .filter(|p| p.descriptor().schema == PayloadSchema::GeminiContents)
            .collect();
        assert_eq!(native, vec![Provider::Google, Provider::Vertex]);
    }
}
