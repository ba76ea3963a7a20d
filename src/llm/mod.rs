//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock、provider 重试与轮转

pub mod factory;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use factory::{create_client, create_llm_from_config, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use retry::{Provider, RetryConfig, RetryingLlmClient};
pub use traits::{AgentRole, CallOptions, LlmClient, LlmError, LlmErrorKind};
