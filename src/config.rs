//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WEBPILOT__*` 覆盖（双下划线表示嵌套，如 `WEBPILOT__AGENT__MAX_STEPS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::agents::ValidationPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub tasks: TasksSection,
    pub llm: LlmSection,
    pub gateway: GatewaySection,
    pub browser: BrowserSection,
}

/// [agent] 段：执行循环参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单个任务的最大步数
    pub max_steps: usize,
    /// 步与步之间的固定间隔（毫秒）
    pub step_delay_ms: u64,
    /// 任务整体超时（秒）
    pub task_timeout_secs: u64,
    /// Navigator 输出非法时替换为 wait 的时长（毫秒）
    pub fallback_wait_ms: u64,
    /// 校验严格度：lenient / standard / strict
    pub validation_policy: ValidationPolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 15,
            step_delay_ms: 1000,
            task_timeout_secs: 300,
            fallback_wait_ms: 1000,
            validation_policy: ValidationPolicy::Standard,
        }
    }
}

/// [tasks] 段：任务生命周期管理
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    /// 同时运行的任务上限（由信号量强制）
    pub max_concurrent: usize,
    /// start 之后延迟多久真正启动执行器（毫秒）
    pub start_delay_ms: u64,
    /// 每个任务保留的消息条数
    pub message_log_limit: usize,
    /// 已结束任务表的容量
    pub history_limit: usize,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            start_delay_ms: 100,
            message_log_limit: 100,
            history_limit: 50,
        }
    }
}

/// [llm] 段：provider 列表（按顺序轮转）与重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub providers: Vec<ProviderSection>,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            providers: vec![ProviderSection::default()],
            retry: RetrySection::default(),
        }
    }
}

/// provider 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Deepseek,
    Mock,
}

/// [[llm.providers]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub name: String,
    pub kind: ProviderKind,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名；未设置时用各后端的默认变量
    pub api_key_env: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            name: "deepseek".to_string(),
            kind: ProviderKind::Deepseek,
            model: None,
            base_url: None,
            api_key_env: None,
        }
    }
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// [gateway] 段：WebSocket 监听与离线消息队列
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind_addr: String,
    /// 无连接时暂存消息的队列容量
    pub pending_capacity: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            pending_capacity: 50,
        }
    }
}

/// [browser] 段：Headless Chrome（需 feature "browser"）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub headless: bool,
    /// 页面状态中最多保留的可交互元素数
    pub max_elements: usize,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            max_elements: 200,
        }
    }
}

/// 从 config 目录加载配置，环境变量 WEBPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WEBPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WEBPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
