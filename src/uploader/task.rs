// 任务与状态定义

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type TaskAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// 队列任务
///
/// 无参异步操作 + 可选的不透明载荷。从入队到执行完成由任务队列独占
pub struct Task {
    action: TaskAction,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Task {
    /// 创建任务
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            action: Box::new(move || Box::pin(action())),
            payload: None,
        }
    }

    /// 附加载荷
    pub fn with_payload<P: Any + Send + Sync>(mut self, payload: P) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// 读取载荷
    pub fn payload<P: Any + Send + Sync>(&self) -> Option<&P> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<P>())
    }

    /// 执行任务
    pub(crate) fn run(self) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.action)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// 任务队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// 运行中
    Running,
    /// 暂停中（初始状态，以及排空之后）
    Paused,
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// 等待哈希
    Waiting,
    /// 已哈希，等待上传
    Queued,
    /// 秒传检查中
    Checking,
    /// 上传中
    Uploading,
    /// 服务器已有，跳过传输
    Skipped,
    /// 已上传
    Uploaded,
    /// 失败
    Failed,
}

impl ChunkStatus {
    /// 是否已成功（上传或跳过）
    pub fn is_done(&self) -> bool {
        matches!(self, ChunkStatus::Skipped | ChunkStatus::Uploaded)
    }

    /// 是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.is_done() || *self == ChunkStatus::Failed
    }
}

/// 上传状态机
///
/// Idle → Initializing → Uploading（与哈希并行）→ Verifying →（Patching →）Merging → Done；
/// 活跃状态下可进入 Cancelled / Failed。暂停是叠加在活跃状态上的标志，见 `UploadEngine::is_paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 未开始
    Idle,
    /// 创建会话中
    Initializing,
    /// 分片哈希与上传中
    Uploading,
    /// 整文件校验中
    Verifying,
    /// 补传缺失分片中
    Patching,
    /// 合并中
    Merging,
    /// 已完成
    Done,
    /// 已取消
    Cancelled,
    /// 失败
    Failed,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Done | UploadStatus::Cancelled | UploadStatus::Failed
        )
    }
}
