//! 事件类型定义
//!
//! 每个组件一个封闭的事件枚举，载荷静态类型化：
//! - `SplitterEvent`: 分片器（chunks-hashed / whole-hash / split-drain）
//! - `QueueEvent`: 任务队列（task-start / task-pause / task-drain）
//! - `UploadEvent`: 上传控制（upload-progress / upload-end / upload-error / chunk-status-change）

use super::channel::Event;
use crate::error::UploadError;
use crate::uploader::{Chunk, ChunkStatus};
use serde::{Deserialize, Serialize};

/// 分片器事件
#[derive(Debug, Clone)]
pub enum SplitterEvent {
    /// 一批分片的哈希已计算完成
    ChunksHashed(Vec<Chunk>),
    /// 整文件哈希计算完成
    WholeHash(String),
    /// 所有分片处理完成
    SplitDrain,
    /// 分片读取或哈希失败，分片器停止
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitterEventKind {
    ChunksHashed,
    WholeHash,
    SplitDrain,
    Failed,
}

impl Event for SplitterEvent {
    type Kind = SplitterEventKind;

    fn kind(&self) -> SplitterEventKind {
        match self {
            SplitterEvent::ChunksHashed(_) => SplitterEventKind::ChunksHashed,
            SplitterEvent::WholeHash(_) => SplitterEventKind::WholeHash,
            SplitterEvent::SplitDrain => SplitterEventKind::SplitDrain,
            SplitterEvent::Failed(_) => SplitterEventKind::Failed,
        }
    }
}

/// 任务队列事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueEvent {
    /// 队列开始执行
    TaskStart,
    /// 队列暂停
    TaskPause,
    /// 没有待执行和执行中的任务
    TaskDrain,
}

impl Event for QueueEvent {
    type Kind = QueueEvent;

    fn kind(&self) -> QueueEvent {
        *self
    }
}

/// 上传控制事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 上传进度（0-100）
    Progress(u8),
    /// 上传完成，携带文件地址
    End(String),
    /// 上传错误
    Error(UploadError),
    /// 分片状态变更
    ChunkStatusChange { index: usize, status: ChunkStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadEventKind {
    UploadProgress,
    UploadEnd,
    UploadError,
    ChunkStatusChange,
}

impl Event for UploadEvent {
    type Kind = UploadEventKind;

    fn kind(&self) -> UploadEventKind {
        match self {
            UploadEvent::Progress(_) => UploadEventKind::UploadProgress,
            UploadEvent::End(_) => UploadEventKind::UploadEnd,
            UploadEvent::Error(_) => UploadEventKind::UploadError,
            UploadEvent::ChunkStatusChange { .. } => UploadEventKind::ChunkStatusChange,
        }
    }
}

impl UploadEventKind {
    /// 获取事件名称
    pub fn name(&self) -> &'static str {
        match self {
            UploadEventKind::UploadProgress => "upload-progress",
            UploadEventKind::UploadEnd => "upload-end",
            UploadEventKind::UploadError => "upload-error",
            UploadEventKind::ChunkStatusChange => "chunk-status-change",
        }
    }
}
