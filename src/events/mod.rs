//! 事件模块
//!
//! - `channel.rs`: 泛型类型化发布/订阅通道
//! - `types.rs`: 各组件的封闭事件枚举

mod channel;
mod types;

pub use channel::*;
pub use types::*;
