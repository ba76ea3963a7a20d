//! Headless Chrome 页面会话：State Provider 与 navigate / click_element / input_text / scroll 动作
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 捕获状态时用脚本给每个可交互元素打上 data-webpilot-index，后续动作按该属性定位，
//! 因此动作里的 index 总是对应最近一次捕获的状态。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::actions::{parse_params, schema_of, ActionContext, ActionResult, BrowserAction};
use super::state::{extract_domain, Bounds, InteractiveElement, PageState, StateProvider};
use super::ActionRegistry;

const INDEX_ATTR: &str = "data-webpilot-index";

/// 标记并收集可见的可交互元素，返回 JSON 字符串
const CAPTURE_SCRIPT: &str = r#"
(function(limit) {
    const selector = 'a[href], button, input, select, textarea, [role="button"], [role="link"], [contenteditable="true"]';
    document.querySelectorAll('[data-webpilot-index]').forEach(el => el.removeAttribute('data-webpilot-index'));
    const out = [];
    let index = 0;
    for (const el of document.querySelectorAll(selector)) {
        if (out.length >= limit) break;
        const rect = el.getBoundingClientRect();
        if (rect.width === 0 || rect.height === 0) continue;
        el.setAttribute('data-webpilot-index', String(index));
        const text = (el.innerText || el.value || el.getAttribute('aria-label') || el.getAttribute('placeholder') || '').trim();
        out.push({
            index: index,
            tag: el.tagName.toLowerCase(),
            text: text.substring(0, 120),
            bounds: { x: rect.x, y: rect.y, width: rect.width, height: rect.height }
        });
        index++;
    }
    return JSON.stringify(out);
})(%LIMIT%)
"#;

/// 浏览器会话：懒启动 Chrome，单 Tab
pub struct ChromeSession {
    headless: bool,
    max_elements: usize,
    inner: Mutex<Option<(Browser, Arc<Tab>)>>,
}

impl ChromeSession {
    pub fn new(headless: bool, max_elements: usize) -> Arc<Self> {
        Arc::new(Self {
            headless,
            max_elements,
            inner: Mutex::new(None),
        })
    }

    /// 取当前 Tab，必要时启动浏览器（阻塞调用，须在 spawn_blocking 中执行）
    fn tab(&self) -> Result<Arc<Tab>, String> {
        let mut guard = self.inner.lock().map_err(|e| e.to_string())?;
        if let Some((_, tab)) = guard.as_ref() {
            return Ok(Arc::clone(tab));
        }
        let options = LaunchOptions::default_builder()
            .headless(self.headless)
            .build()
            .map_err(|e| format!("Chrome options invalid: {}", e))?;
        let browser =
            Browser::new(options).map_err(|e| format!("Chrome launch failed: {}", e))?;
        let tab = browser
            .new_tab()
            .map_err(|e| format!("Browser tab failed: {}", e))?;
        *guard = Some((browser, Arc::clone(&tab)));
        Ok(tab)
    }

    /// 在阻塞线程池上对 Tab 执行 f
    async fn with_tab<T, F>(self: &Arc<Self>, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> Result<T, String> + Send + 'static,
    {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let tab = session.tab()?;
            f(&tab)
        })
        .await
        .map_err(|e| format!("Task join: {}", e))?
    }

    fn capture(tab: &Arc<Tab>, limit: usize) -> Result<PageState, String> {
        let url = tab.get_url();
        let title = tab
            .get_title()
            .map_err(|e| format!("Get title failed: {}", e))?;
        let script = CAPTURE_SCRIPT.replace("%LIMIT%", &limit.to_string());
        let raw = tab
            .evaluate(&script, false)
            .map_err(|e| format!("Capture failed: {}", e))?
            .value
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "[]".to_string());

        #[derive(Deserialize)]
        struct RawElement {
            index: usize,
            tag: String,
            text: String,
            bounds: Bounds,
        }
        let elements: Vec<RawElement> =
            serde_json::from_str(&raw).map_err(|e| format!("Capture decode failed: {}", e))?;

        Ok(PageState {
            domain: extract_domain(&url),
            url,
            title,
            interactive_elements: elements
                .into_iter()
                .map(|e| InteractiveElement {
                    index: e.index,
                    tag: e.tag,
                    text: e.text,
                    bounds: e.bounds,
                })
                .collect(),
        })
    }

    /// 注册 navigate / click_element / input_text / scroll
    pub fn register_actions(self: &Arc<Self>, registry: &mut ActionRegistry) {
        registry.register(NavigateAction(Arc::clone(self)));
        registry.register(ClickElementAction(Arc::clone(self)));
        registry.register(InputTextAction(Arc::clone(self)));
        registry.register(ScrollAction(Arc::clone(self)));
    }
}

#[async_trait]
impl StateProvider for Arc<ChromeSession> {
    async fn current_state(&self, cancel: &CancellationToken) -> PageState {
        let limit = self.max_elements;
        let capture = self.with_tab(move |tab| ChromeSession::capture(tab, limit));
        tokio::select! {
            _ = cancel.cancelled() => PageState::empty(),
            result = capture => match result {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(error = %e, "page state capture failed, using empty state");
                    PageState::empty()
                }
            },
        }
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn outcome(result: Result<String, String>) -> ActionResult {
    match result {
        Ok(msg) => ActionResult::ok(msg),
        Err(e) => ActionResult::failed(e),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NavigateParams {
    /// 目标 URL（缺省协议时补 https://）
    pub url: String,
}

pub struct NavigateAction(Arc<ChromeSession>);

#[async_trait]
impl BrowserAction for NavigateAction {
    fn name(&self) -> &str {
        "navigate"
    }

    fn description(&self) -> &str {
        "Open a URL in the current tab. Params: {\"url\": \"https://...\"}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<NavigateParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let params: NavigateParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(e),
        };
        let url = if params.url.contains("://") {
            params.url
        } else {
            format!("https://{}", params.url)
        };
        outcome(
            self.0
                .with_tab(move |tab| {
                    tab.navigate_to(&url)
                        .and_then(|t| t.wait_until_navigated())
                        .map_err(|e| format!("Navigate failed: {}", e))?;
                    Ok(format!("Navigated to {}", url))
                })
                .await,
        )
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClickParams {
    /// 元素序号（来自当前页面状态）
    pub index: usize,
}

pub struct ClickElementAction(Arc<ChromeSession>);

#[async_trait]
impl BrowserAction for ClickElementAction {
    fn name(&self) -> &str {
        "click_element"
    }

    fn description(&self) -> &str {
        "Click an interactive element by index. Params: {\"index\": 3}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ClickParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let params: ClickParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(e),
        };
        let index = params.index;
        let js = format!(
            r#"(function() {{
                const el = document.querySelector('[{attr}="{index}"]');
                if (!el) return 'missing';
                el.scrollIntoView({{ behavior: 'instant', block: 'center' }});
                el.click();
                return 'clicked';
            }})()"#,
            attr = INDEX_ATTR,
            index = index
        );
        outcome(
            self.0
                .with_tab(move |tab| {
                    let value = tab
                        .evaluate(&js, false)
                        .map_err(|e| format!("Click failed: {}", e))?
                        .value;
                    match value.as_ref().and_then(|v| v.as_str()) {
                        Some("clicked") => Ok(format!("Clicked element [{}]", index)),
                        _ => Err(format!("Element [{}] not found", index)),
                    }
                })
                .await,
        )
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InputTextParams {
    /// 元素序号（来自当前页面状态）
    pub index: usize,
    /// 要输入的文本
    pub text: String,
}

pub struct InputTextAction(Arc<ChromeSession>);

#[async_trait]
impl BrowserAction for InputTextAction {
    fn name(&self) -> &str {
        "input_text"
    }

    fn description(&self) -> &str {
        "Type text into an input element by index. Params: {\"index\": 2, \"text\": \"hello\"}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<InputTextParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let params: InputTextParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(e),
        };
        let index = params.index;
        let js = format!(
            r#"(function() {{
                const el = document.querySelector('[{attr}="{index}"]');
                if (!el) return 'missing';
                el.focus();
                if ('value' in el) {{ el.value = {text}; }} else {{ el.textContent = {text}; }}
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return 'typed';
            }})()"#,
            attr = INDEX_ATTR,
            index = index,
            text = js_string(&params.text)
        );
        outcome(
            self.0
                .with_tab(move |tab| {
                    let value = tab
                        .evaluate(&js, false)
                        .map_err(|e| format!("Type failed: {}", e))?
                        .value;
                    match value.as_ref().and_then(|v| v.as_str()) {
                        Some("typed") => Ok(format!("Typed into element [{}]", index)),
                        _ => Err(format!("Element [{}] not found", index)),
                    }
                })
                .await,
        )
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScrollParams {
    /// "up" 或 "down"
    #[serde(default = "default_direction")]
    pub direction: String,
    /// 滚动像素
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_direction() -> String {
    "down".to_string()
}

fn default_amount() -> i64 {
    500
}

pub struct ScrollAction(Arc<ChromeSession>);

/// 单次滚动上限（像素）
const MAX_SCROLL: i64 = 100_000;

/// 有符号滚动量；幅度取绝对值并截断到 MAX_SCROLL（模型可能给出任意整数）
fn scroll_delta(direction: &str, amount: i64) -> i64 {
    let magnitude = amount.saturating_abs().min(MAX_SCROLL);
    if direction == "up" {
        -magnitude
    } else {
        magnitude
    }
}

#[async_trait]
impl BrowserAction for ScrollAction {
    fn name(&self) -> &str {
        "scroll"
    }

    fn description(&self) -> &str {
        "Scroll the page. Params: {\"direction\": \"down\", \"amount\": 500}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ScrollParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let params: ScrollParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(e),
        };
        let delta = scroll_delta(&params.direction, params.amount);
        let direction = params.direction;
        outcome(
            self.0
                .with_tab(move |tab| {
                    tab.evaluate(&format!("window.scrollBy(0, {})", delta), false)
                        .map_err(|e| format!("Scroll failed: {}", e))?;
                    Ok(format!("Scrolled {}", direction))
                })
                .await,
        )
    }
}
