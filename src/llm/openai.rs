//! OpenAI 兼容的 chat completions 后端（DeepSeek 及自建代理也走这里）
//!
//! 厂商错误只以文本形式向上传递，再按标记归类为 LlmError。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{AgentRole, CallOptions, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 累计 token 用量
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    fn record(&self, prompt: u32, completion: u32) {
        self.prompt.fetch_add(u64::from(prompt), Ordering::Relaxed);
        self.completion.fetch_add(u64::from(completion), Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

fn request_message(message: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
    let content = message.content.as_str();
    let built = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::User),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| LlmError::Other(format!("invalid {} message: {}", message.role, e)))
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 为 None 时由 async-openai 读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: impl Into<String>, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        if let Some(key) = api_key {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            model: model.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn call(
        &self,
        messages: &[Message],
        options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError> {
        let request_messages = messages
            .iter()
            .map(request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.as_str()).messages(request_messages);
        if let Some(t) = options.temperature {
            args.temperature(t);
        }
        let request = args.build().map_err(|e| LlmError::Other(e.to_string()))?;

        tracing::debug!(model = %self.model, %role, messages = messages.len(), "chat completion request");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::classify(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage.record(usage.prompt_tokens, usage.completion_tokens);
        }

        // 没有 choices 或 content 为空时按空串返回，由 Agent 的兜底处理
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.snapshot()
    }
}
