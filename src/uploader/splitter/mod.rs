// 分片器
//
// 三种哈希策略实现同一个契约（ChunkHasher）：
// - sequential: 进程内并发计算所有分片，全部完成后一次性上报
// - worker_pool: 固定数量的 worker 线程，各自处理一段连续分片，逐个上报
// - time_slice: 每批少量分片，批与批之间主动让出执行权
//
// 无论哪种策略、分片以什么顺序完成，整文件指纹都按分片索引升序累加

mod sequential;
mod time_slice;
mod worker_pool;

pub use sequential::SequentialHasher;
pub use time_slice::{TimeSliceHasher, DEFAULT_TIME_SLICE_BATCH_SIZE};
pub use worker_pool::{default_worker_count, WorkerPoolHasher};

use crate::error::UploadError;
use crate::events::{EventChannel, SplitterEvent};
use crate::uploader::chunk::{plan_chunks, ByteSource, Chunk};
use crate::uploader::fingerprint::{digest_bytes, OrderedDigest};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 哈希策略上报给分片器的消息
#[derive(Debug)]
pub enum HashMessage {
    /// 一批已写入指纹的分片
    Hashed(Vec<Chunk>),
    /// 某个分片读取或哈希失败
    Failed { index: usize, error: String },
}

/// 哈希结果收集端
///
/// 可跨线程克隆，worker 线程直接持有
#[derive(Debug, Clone)]
pub struct HashCollector {
    tx: mpsc::UnboundedSender<HashMessage>,
}

impl HashCollector {
    fn new(tx: mpsc::UnboundedSender<HashMessage>) -> Self {
        Self { tx }
    }

    /// 上报一批已完成的分片
    pub fn report(&self, chunks: Vec<Chunk>) {
        if self.tx.send(HashMessage::Hashed(chunks)).is_err() {
            debug!("分片器已停止收集，丢弃哈希结果");
        }
    }

    /// 上报失败
    pub fn fail(&self, index: usize, error: anyhow::Error) {
        let _ = self.tx.send(HashMessage::Failed {
            index,
            error: format!("{:#}", error),
        });
    }
}

/// 哈希策略契约
pub trait ChunkHasher: Send + Sync {
    /// 策略名称
    fn name(&self) -> &'static str;

    /// 计算每个分片的指纹，分一批或多批上报给 collector
    ///
    /// 必须立即返回，实际计算在后台进行
    fn calc_hash(&self, chunks: Vec<Chunk>, collector: HashCollector);

    /// 释放策略持有的资源（如 worker 线程），可重复调用
    fn dispose(&self);
}

/// 分片策略选择
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    #[default]
    Sequential,
    WorkerPool { workers: usize },
    TimeSlice { batch_size: usize },
}

impl SplitStrategy {
    /// 使用默认 worker 数量的 worker 池
    pub fn worker_pool() -> Self {
        SplitStrategy::WorkerPool {
            workers: default_worker_count(),
        }
    }

    /// 使用默认批大小的时间切片
    pub fn time_slice() -> Self {
        SplitStrategy::TimeSlice {
            batch_size: DEFAULT_TIME_SLICE_BATCH_SIZE,
        }
    }

    /// 构造对应的哈希策略
    pub fn build(self) -> Result<Box<dyn ChunkHasher>> {
        Ok(match self {
            SplitStrategy::Sequential => Box::new(SequentialHasher),
            SplitStrategy::WorkerPool { workers } => Box::new(WorkerPoolHasher::new(workers)?),
            SplitStrategy::TimeSlice { batch_size } => Box::new(TimeSliceHasher::new(batch_size)),
        })
    }
}

/// 异步计算单个分片指纹并写入
pub(crate) async fn hash_chunk(chunk: &Chunk) -> Result<()> {
    let data = chunk.read_data().await?;
    chunk.set_fingerprint(digest_bytes(&data))
}

/// 同步计算单个分片指纹并写入（worker 线程使用）
pub(crate) fn hash_chunk_blocking(chunk: &Chunk) -> Result<()> {
    let data = chunk.read_data_blocking()?;
    chunk.set_fingerprint(digest_bytes(&data))
}

struct SplitterInner {
    chunks: Vec<Chunk>,
    chunk_size: u64,
    hasher: Box<dyn ChunkHasher>,
    events: EventChannel<SplitterEvent>,
    split_started: AtomicBool,
    whole_hash: Mutex<Option<String>>,
}

/// 分片器
///
/// 持有不可变的分片列表；指纹由分片器（经由哈希策略）唯一写入
#[derive(Clone)]
pub struct ChunkSplitter {
    inner: Arc<SplitterInner>,
}

impl ChunkSplitter {
    /// 按策略创建分片器
    pub fn new(
        source: Arc<dyn ByteSource>,
        chunk_size: u64,
        strategy: SplitStrategy,
    ) -> std::result::Result<Self, UploadError> {
        let hasher = strategy
            .build()
            .map_err(|e| UploadError::Hashing(format!("{:#}", e)))?;
        Self::with_hasher(source, chunk_size, hasher)
    }

    /// 使用自定义哈希策略创建分片器
    pub fn with_hasher(
        source: Arc<dyn ByteSource>,
        chunk_size: u64,
        hasher: Box<dyn ChunkHasher>,
    ) -> std::result::Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize);
        }
        let chunks = plan_chunks(&source, chunk_size).map_err(|_| UploadError::InvalidChunkSize)?;

        Ok(Self {
            inner: Arc::new(SplitterInner {
                chunks,
                chunk_size,
                hasher,
                events: EventChannel::new(),
                split_started: AtomicBool::new(false),
                whole_hash: Mutex::new(None),
            }),
        })
    }

    /// 事件通道
    pub fn events(&self) -> &EventChannel<SplitterEvent> {
        &self.inner.events
    }

    /// 分片列表
    pub fn chunks(&self) -> &[Chunk] {
        &self.inner.chunks
    }

    /// 按索引获取分片
    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.inner.chunks.get(index)
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    /// 哈希策略名称
    pub fn strategy_name(&self) -> &'static str {
        self.inner.hasher.name()
    }

    /// 已计算出的整文件指纹
    pub fn whole_hash(&self) -> Option<String> {
        self.inner.whole_hash.lock().clone()
    }

    /// 开始分片并计算哈希
    ///
    /// 幂等：第二次调用为空操作。必须在 tokio 运行时中调用
    pub fn split(&self) {
        if self.inner.split_started.swap(true, Ordering::SeqCst) {
            debug!("分片器已启动，忽略重复的 split 调用");
            return;
        }

        let total = self.inner.chunks.len();
        info!(
            "开始计算分片哈希: 分片数量={}, 策略={}",
            total,
            self.inner.hasher.name()
        );

        if total == 0 {
            // 空文件：没有分片，直接给出整文件指纹
            let digest = OrderedDigest::new(0).finalize().unwrap_or_default();
            Self::finish(&self.inner, digest);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::collect(self.inner.clone(), rx));
        self.inner
            .hasher
            .calc_hash(self.inner.chunks.clone(), HashCollector::new(tx));
    }

    /// 释放哈希策略资源，可重复调用
    pub fn dispose(&self) {
        self.inner.hasher.dispose();
    }

    /// 收集哈希结果
    ///
    /// 每批：发布 chunks-hashed → 指纹按索引顺序喂给累加器 → 计数；
    /// 全部完成后发布 whole-hash 和 split-drain
    async fn collect(inner: Arc<SplitterInner>, mut rx: mpsc::UnboundedReceiver<HashMessage>) {
        let total = inner.chunks.len();
        let mut accumulator = Some(OrderedDigest::new(total));
        let mut processed = 0usize;

        while let Some(message) = rx.recv().await {
            match message {
                HashMessage::Hashed(batch) => {
                    if batch.is_empty() {
                        continue;
                    }
                    inner
                        .events
                        .publish(&SplitterEvent::ChunksHashed(batch.clone()));

                    let Some(acc) = accumulator.as_mut() else {
                        continue;
                    };
                    for chunk in &batch {
                        match chunk.fingerprint() {
                            Some(fp) => {
                                if acc.push(chunk.index, fp) {
                                    processed += 1;
                                }
                            }
                            None => warn!("分片 #{} 上报时没有指纹，已忽略", chunk.index),
                        }
                    }

                    debug!(
                        "分片哈希进度: {}/{}，已按序累加 {}",
                        processed,
                        total,
                        acc.consumed()
                    );

                    if processed == total {
                        // 释放累加器
                        let digest = accumulator
                            .take()
                            .and_then(OrderedDigest::finalize)
                            .unwrap_or_default();
                        Self::finish(&inner, digest);
                        return;
                    }
                }
                HashMessage::Failed { index, error } => {
                    warn!("分片 #{} 哈希计算失败: {}", index, error);
                    inner.events.publish(&SplitterEvent::Failed(format!(
                        "分片 #{}: {}",
                        index, error
                    )));
                    return;
                }
            }
        }

        debug!(
            "哈希策略已停止上报（{}/{}），分片器结束收集",
            processed, total
        );
    }

    fn finish(inner: &SplitterInner, digest: String) {
        info!("整文件指纹计算完成: {}", digest);
        *inner.whole_hash.lock() = Some(digest.clone());
        inner.events.publish(&SplitterEvent::WholeHash(digest));
        inner.events.publish(&SplitterEvent::SplitDrain);
    }
}

impl std::fmt::Debug for ChunkSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSplitter")
            .field("chunks", &self.inner.chunks.len())
            .field("chunk_size", &self.inner.chunk_size)
            .field("strategy", &self.inner.hasher.name())
            .finish()
    }
}
