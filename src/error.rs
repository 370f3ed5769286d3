// 上传错误定义
//
// 所有错误统一通过 upload-error 事件和 on_error 回调对外暴露，
// 因此需要可克隆（同一个错误会同时发给事件订阅者、回调和 wait()）

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// 创建上传会话失败
    #[error("创建上传会话失败: {0}")]
    SessionCreation(String),

    /// 分片读取或哈希计算失败
    #[error("分片哈希计算失败: {0}")]
    Hashing(String),

    /// 单个分片校验或传输失败（不会中断其他分片）
    #[error("分片 #{index} 上传失败: {message}")]
    ChunkTransfer { index: usize, message: String },

    /// 整文件校验失败
    #[error("整文件校验失败: {0}")]
    Verification(String),

    /// 合并文件失败
    #[error("合并文件失败: {0}")]
    Merge(String),

    /// 存在上传失败的分片，上传未完成
    #[error("{} 个分片上传失败，上传未完成: {failed:?}", .failed.len())]
    Incomplete { failed: Vec<usize> },

    /// 用户取消
    #[error("上传已取消")]
    Cancelled,

    /// 分片大小非法
    #[error("分片大小必须大于 0")]
    InvalidChunkSize,

    /// 当前状态不允许该操作
    #[error("当前状态不允许该操作: {0}")]
    InvalidState(String),
}

/// 错误类别（不携带数据，便于匹配和统计）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    SessionCreation,
    Hashing,
    ChunkTransfer,
    Verification,
    Merge,
    Incomplete,
    Cancelled,
    InvalidChunkSize,
    InvalidState,
}

impl UploadError {
    /// 获取错误类别
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::SessionCreation(_) => UploadErrorKind::SessionCreation,
            UploadError::Hashing(_) => UploadErrorKind::Hashing,
            UploadError::ChunkTransfer { .. } => UploadErrorKind::ChunkTransfer,
            UploadError::Verification(_) => UploadErrorKind::Verification,
            UploadError::Merge(_) => UploadErrorKind::Merge,
            UploadError::Incomplete { .. } => UploadErrorKind::Incomplete,
            UploadError::Cancelled => UploadErrorKind::Cancelled,
            UploadError::InvalidChunkSize => UploadErrorKind::InvalidChunkSize,
            UploadError::InvalidState(_) => UploadErrorKind::InvalidState,
        }
    }

    /// 是否为终止性错误（发生后本次上传结束）
    ///
    /// 单个分片失败不是终止性错误，其他分片继续上传
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadError::ChunkTransfer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(UploadError::Cancelled.kind(), UploadErrorKind::Cancelled);
        assert_eq!(
            UploadError::ChunkTransfer {
                index: 3,
                message: "timeout".to_string()
            }
            .kind(),
            UploadErrorKind::ChunkTransfer
        );
    }

    #[test]
    fn test_terminal_errors() {
        assert!(UploadError::Cancelled.is_terminal());
        assert!(UploadError::Merge("500".to_string()).is_terminal());
        assert!(!UploadError::ChunkTransfer {
            index: 0,
            message: "x".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_incomplete_message() {
        let err = UploadError::Incomplete { failed: vec![1, 4] };
        assert_eq!(err.to_string(), "2 个分片上传失败，上传未完成: [1, 4]");
    }
}
