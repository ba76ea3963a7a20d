//! Provider 重试与容错切换
//!
//! RetryingLlmClient 包装一组可互换的 LlmClient：
//! - TokenLimitExceeded：不重试、不切换，直接返回
//! - Overloaded / RateLimited：同一 provider 上指数退避重试（base × 2^attempt），最多 max_retries 次
//! - 重试耗尽或 Other：轮转 provider 下标，换下一个 provider 再试；每个 provider 每次调用最多轮到一次

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentRole, CallOptions, LlmClient, LlmError};
use crate::config::RetrySection;
use crate::memory::Message;

/// 重试参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 同一 provider 上的最大重试次数（不含首次调用）
    pub max_retries: u32,
    /// 退避基数
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    pub fn from_section(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
        }
    }

    /// 第 attempt 次（从 0 开始）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// 一个具名 provider
pub struct Provider {
    pub name: String,
    pub client: Arc<dyn LlmClient>,
}

impl Provider {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

/// 带重试与 provider 轮转的 LLM 客户端；当前下标在实例内共享（进程内所有调用方可见）
pub struct RetryingLlmClient {
    providers: Vec<Provider>,
    current: AtomicUsize,
    config: RetryConfig,
}

impl RetryingLlmClient {
    /// providers 不能为空
    pub fn new(providers: Vec<Provider>, config: RetryConfig) -> Result<Self, LlmError> {
        if providers.is_empty() {
            return Err(LlmError::Other("no LLM provider configured".to_string()));
        }
        Ok(Self {
            providers,
            current: AtomicUsize::new(0),
            config,
        })
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn current_provider(&self) -> &str {
        &self.providers[self.current_index()].name
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// 从 from 前进到下一个；并发失败时只前进一次
    fn advance_from(&self, from: usize) -> usize {
        let next = (from + 1) % self.providers.len();
        match self
            .current
            .compare_exchange(from, next, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => next,
            Err(actual) => actual,
        }
    }

    /// 在单个 provider 上调用，瞬时错误按退避重试
    async fn call_with_backoff(
        &self,
        provider: &Provider,
        messages: &[Message],
        options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError> {
        let mut attempt = 0u32;
        loop {
            match provider.client.call(messages, options, role).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let err = err.reclassified();
                    if err.is_transient() && attempt < self.config.max_retries {
                        let delay = self.config.delay_for(attempt);
                        tracing::warn!(
                            provider = %provider.name,
                            %role,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient LLM error, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn call(
        &self,
        messages: &[Message],
        options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError> {
        let mut index = self.current_index();
        let mut tried = 0usize;
        loop {
            let provider = &self.providers[index];
            match self.call_with_backoff(provider, messages, options, role).await {
                Ok(text) => return Ok(text),
                Err(err @ LlmError::TokenLimitExceeded(_)) => {
                    tracing::error!(provider = %provider.name, %role, error = %err, "token limit exceeded");
                    return Err(err);
                }
                Err(err) => {
                    tried += 1;
                    if tried >= self.providers.len() {
                        tracing::error!(%role, error = %err, "all LLM providers failed");
                        return Err(err);
                    }
                    let next = self.advance_from(index);
                    tracing::warn!(
                        from = %provider.name,
                        to = %self.providers[next].name,
                        %role,
                        error = %err,
                        "switching LLM provider"
                    );
                    index = next;
                }
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        // 聚合所有 provider 的 token 使用
        self.providers
            .iter()
            .map(|p| p.client.token_usage())
            .fold((0, 0, 0), |acc, (a, b, c)| (acc.0 + a, acc.1 + b, acc.2 + c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn msgs() -> Vec<Message> {
        vec![Message::user("hi")]
    }

    fn config(base_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    #[test]
    fn test_delay_for_is_exponential() {
        let cfg = config(100);
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_empty_provider_list_rejected() {
        assert!(RetryingLlmClient::new(Vec::new(), RetryConfig::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overloaded_backoff_sequence_then_switch() {
        let primary = Arc::new(ScriptedLlmClient::new());
        for _ in 0..4 {
            primary.push_err(LlmError::Overloaded("busy".into()));
        }
        let secondary = Arc::new(ScriptedLlmClient::new());
        secondary.push_ok("from secondary");

        let client = RetryingLlmClient::new(
            vec![
                Provider::new("primary", primary.clone()),
                Provider::new("secondary", secondary.clone()),
            ],
            config(100),
        )
        .unwrap();

        let out = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Planner)
            .await
            .unwrap();
        assert_eq!(out, "from secondary");

        let times = primary.call_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u128> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![100, 200, 400]);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(client.current_index(), 1);
        assert_eq!(client.current_provider(), "secondary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_limit_not_retried_nor_switched() {
        let primary = Arc::new(ScriptedLlmClient::new());
        primary.push_err(LlmError::TokenLimitExceeded("context length".into()));
        let secondary = Arc::new(ScriptedLlmClient::new());
        secondary.push_ok("unused");

        let client = RetryingLlmClient::new(
            vec![
                Provider::new("primary", primary.clone()),
                Provider::new("secondary", secondary.clone()),
            ],
            config(100),
        )
        .unwrap();

        let err = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Navigator)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::TokenLimitExceeded(_)));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 0);
        assert_eq!(client.current_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_switches_without_retry() {
        let primary = Arc::new(ScriptedLlmClient::new());
        primary.push_err(LlmError::Other("bad gateway".into()));
        let secondary = Arc::new(ScriptedLlmClient::new());
        secondary.push_ok("ok");

        let client = RetryingLlmClient::new(
            vec![
                Provider::new("primary", primary.clone()),
                Provider::new("secondary", secondary.clone()),
            ],
            config(100),
        )
        .unwrap();

        let out = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Validator)
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_recovers_on_same_provider() {
        let primary = Arc::new(ScriptedLlmClient::new());
        primary.push_err(LlmError::RateLimited("429".into()));
        primary.push_ok("second try");

        let client =
            RetryingLlmClient::new(vec![Provider::new("primary", primary.clone())], config(50))
                .unwrap();

        let out = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Planner)
            .await
            .unwrap();
        assert_eq!(out, "second try");
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failing_returns_last_error() {
        let a = Arc::new(ScriptedLlmClient::new());
        a.push_err(LlmError::Other("a down".into()));
        let b = Arc::new(ScriptedLlmClient::new());
        b.push_err(LlmError::Other("b down".into()));

        let client = RetryingLlmClient::new(
            vec![Provider::new("a", a.clone()), Provider::new("b", b.clone())],
            config(10),
        )
        .unwrap();

        let err = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Planner)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Other("b down".into()));
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_other_is_reclassified() {
        let primary = Arc::new(ScriptedLlmClient::new());
        primary.push_err(LlmError::Other("HTTP 429 Too Many Requests".into()));
        primary.push_ok("after backoff");

        let client =
            RetryingLlmClient::new(vec![Provider::new("primary", primary.clone())], config(10))
                .unwrap();
        let out = client
            .call(&msgs(), &CallOptions::default(), AgentRole::Planner)
            .await
            .unwrap();
        assert_eq!(out, "after backoff");
    }
}
