//! 页面状态：State Provider 接口与状态快照
//!
//! 状态获取永远不抛错：失败时降级为 PageState::empty()。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// 元素包围盒（CSS 像素）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 可交互元素；index 是 Navigator 引用元素的唯一方式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub index: usize,
    pub tag: String,
    pub text: String,
    #[serde(default)]
    pub bounds: Bounds,
}

/// 当前页面快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub domain: String,
    #[serde(default)]
    pub interactive_elements: Vec<InteractiveElement>,
}

impl PageState {
    /// 获取失败时的默认状态
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.interactive_elements.is_empty()
    }

    pub fn has_index(&self, index: usize) -> bool {
        self.interactive_elements.iter().any(|e| e.index == index)
    }

    /// 供 prompt 使用的文本表示：`[index] <tag> text`
    pub fn to_prompt_section(&self, max_elements: usize) -> String {
        let mut s = format!(
            "## Current page\nURL: {}\nTitle: {}\n",
            if self.url.is_empty() { "(none)" } else { &self.url },
            self.title
        );
        if self.interactive_elements.is_empty() {
            s.push_str("Interactive elements: (none)\n");
            return s;
        }
        s.push_str("Interactive elements:\n");
        for e in self.interactive_elements.iter().take(max_elements) {
            let text: String = e.text.chars().take(80).collect();
            s.push_str(&format!("[{}] <{}> {}\n", e.index, e.tag, text));
        }
        if self.interactive_elements.len() > max_elements {
            s.push_str(&format!(
                "... {} more elements\n",
                self.interactive_elements.len() - max_elements
            ));
        }
        s
    }
}

/// 从 URL 提取域名（小写，不含端口）
pub fn extract_domain(url: &str) -> String {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split(['/', '?', '#'])
        .next()
        .and_then(|host| host.split(':').next())
        .unwrap_or("")
        .to_lowercase()
}

/// State Provider：捕获当前页面状态
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// 不得失败；出错时返回 PageState::empty()
    async fn current_state(&self, cancel: &CancellationToken) -> PageState;
}

/// 没有浏览器时使用的空实现
#[derive(Debug, Default)]
pub struct EmptyStateProvider;

#[async_trait]
impl StateProvider for EmptyStateProvider {
    async fn current_state(&self, _cancel: &CancellationToken) -> PageState {
        PageState::empty()
    }
}
