// Chunk Uploader Library
// 可恢复的分片上传客户端核心库

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 类型化事件通道
pub mod events;

// 日志系统
pub mod logging;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, SplitStrategyKind, StorageConfig, UploadConfig};
pub use error::{UploadError, UploadErrorKind};
pub use events::{
    EventChannel, QueueEvent, SplitterEvent, SplitterEventKind, UploadEvent, UploadEventKind,
};
pub use uploader::{
    ByteSource, Chunk, ChunkSplitter, ChunkStatus, FileMeta, FingerprintCheck, FingerprintKind,
    LocalFile, LocalStoreStrategy, MemorySource, RequestStrategy, SplitStrategy, TaskQueue,
    UploadEngine, UploadStatus,
};
