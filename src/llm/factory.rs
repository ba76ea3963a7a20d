//! 按配置构建 provider 列表
//!
//! DeepSeek 走 OpenAI 兼容协议，只是默认 base_url / 模型 / Key 变量不同。

use std::sync::Arc;

use crate::config::{LlmSection, ProviderKind, ProviderSection};
use crate::llm::{LlmClient, LlmError, MockLlmClient, OpenAiClient, Provider, RetryConfig, RetryingLlmClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// 读取 API Key：优先 api_key_env 指定的变量，其次各后端的默认变量
fn resolve_api_key(section: &ProviderSection, defaults: &[&str]) -> Option<String> {
    section
        .api_key_env
        .iter()
        .map(String::as_str)
        .chain(defaults.iter().copied())
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
}

/// 构建单个 provider 客户端
pub fn create_client(section: &ProviderSection) -> Arc<dyn LlmClient> {
    match section.kind {
        ProviderKind::Mock => Arc::new(MockLlmClient),
        ProviderKind::Deepseek => {
            let model = section
                .model
                .clone()
                .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
                .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
            let api_key = resolve_api_key(section, &["DEEPSEEK_API_KEY", "OPENAI_API_KEY"]);
            if api_key.is_none() {
                tracing::warn!(provider = %section.name, "no API key found for DeepSeek provider");
            }
            let base_url = section.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            Arc::new(OpenAiClient::new(Some(base_url), &model, api_key.as_deref()))
        }
        ProviderKind::Openai => {
            let model = section
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string());
            let api_key = resolve_api_key(section, &["OPENAI_API_KEY"]);
            Arc::new(OpenAiClient::new(
                section.base_url.as_deref(),
                &model,
                api_key.as_deref(),
            ))
        }
    }
}

/// 按 [llm] 段构建带重试与轮转的客户端
pub fn create_llm_from_config(section: &LlmSection) -> Result<RetryingLlmClient, LlmError> {
    let providers: Vec<Provider> = section
        .providers
        .iter()
        .map(|p| Provider::new(p.name.clone(), create_client(p)))
        .collect();
    tracing::info!(
        providers = ?section.providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        max_retries = section.retry.max_retries,
        "LLM providers configured"
    );
    RetryingLlmClient::new(providers, RetryConfig::from_section(&section.retry))
}
