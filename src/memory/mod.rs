//! 记忆层：LLM 消息结构与执行循环的程序记忆（有界窗口 + 摘要环）

pub mod message;
pub mod procedural;

pub use message::{Message, Role};
pub use procedural::{MemoryContext, MemoryEntry, ProceduralMemory, ProceduralSummary};
