//! 浏览器接缝：页面状态提供者、动作注册表与内置动作；可选 Headless Chrome 实现

pub mod actions;
#[cfg(feature = "browser")]
pub mod chrome;
pub mod state;

pub use actions::{
    ActionContext, ActionRegistry, ActionResult, ActionSpec, BrowserAction, DoneAction,
    WaitAction, DONE_ACTION, WAIT_ACTION,
};
#[cfg(feature = "browser")]
pub use chrome::ChromeSession;
pub use state::{
    extract_domain, Bounds, EmptyStateProvider, InteractiveElement, PageState, StateProvider,
};
