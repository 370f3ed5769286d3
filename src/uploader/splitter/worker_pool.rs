// Worker 池策略
//
// 固定数量的独立 worker 线程；分片按连续区间平均分给各 worker，
// worker 之间不共享可变状态，只通过 请求（分片批次）/ 响应（已哈希分片）通信。
// 每个分片完成后立即上报（批大小为 1）

use super::{hash_chunk_blocking, ChunkHasher, HashCollector};
use crate::uploader::chunk::Chunk;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// worker 数量下限
const MIN_WORKERS: usize = 4;

/// 默认 worker 数量：主机并行度，至少 4 个
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .max(MIN_WORKERS)
}

/// 发给 worker 的任务
struct WorkerJob {
    chunks: Vec<Chunk>,
    collector: HashCollector,
}

struct HashWorker {
    id: usize,
    jobs: mpsc::Sender<WorkerJob>,
    _handle: JoinHandle<()>,
}

/// Worker 池哈希策略
pub struct WorkerPoolHasher {
    workers: Mutex<Vec<HashWorker>>,
    size: usize,
    terminated: Arc<AtomicBool>,
}

impl WorkerPoolHasher {
    /// 创建 worker 池并启动所有 worker 线程
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let terminated = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let (tx, rx) = mpsc::channel::<WorkerJob>();
            let terminated = terminated.clone();
            let handle = std::thread::Builder::new()
                .name(format!("hash-worker-{}", id))
                .spawn(move || Self::worker_loop(id, rx, terminated))
                .context(format!("启动哈希 worker #{} 失败", id))?;
            workers.push(HashWorker {
                id,
                jobs: tx,
                _handle: handle,
            });
        }

        info!("哈希 worker 池已启动: {} 个 worker", size);

        Ok(Self {
            workers: Mutex::new(workers),
            size,
            terminated,
        })
    }

    fn worker_loop(id: usize, jobs: mpsc::Receiver<WorkerJob>, terminated: Arc<AtomicBool>) {
        while let Ok(job) = jobs.recv() {
            debug!("[worker {}] 收到 {} 个分片", id, job.chunks.len());
            for chunk in job.chunks {
                // 正在计算的分片不会被打断，只是不再开始新的分片
                if terminated.load(Ordering::SeqCst) {
                    debug!("[worker {}] 已终止", id);
                    return;
                }
                match hash_chunk_blocking(&chunk) {
                    Ok(()) => job.collector.report(vec![chunk]),
                    Err(e) => {
                        job.collector.fail(chunk.index, e);
                        break;
                    }
                }
            }
        }
        debug!("[worker {}] 任务通道关闭，退出", id);
    }
}

impl ChunkHasher for WorkerPoolHasher {
    fn name(&self) -> &'static str {
        "worker_pool"
    }

    fn calc_hash(&self, chunks: Vec<Chunk>, collector: HashCollector) {
        let workers = self.workers.lock();
        if workers.is_empty() {
            warn!("worker 池已释放，无法计算分片哈希");
            return;
        }

        // 每个 worker 负责的分片数量
        let shard_size = chunks.len().div_ceil(workers.len());
        if shard_size == 0 {
            return;
        }
        debug!(
            "分发 {} 个分片到 {} 个 worker，每个最多 {} 个",
            chunks.len(),
            self.size,
            shard_size
        );

        for (shard, worker) in chunks.chunks(shard_size).zip(workers.iter()) {
            let job = WorkerJob {
                chunks: shard.to_vec(),
                collector: collector.clone(),
            };
            if worker.jobs.send(job).is_err() {
                warn!("worker #{} 已退出，分片任务发送失败", worker.id);
            }
        }
    }

    fn dispose(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        // 丢弃发送端后 worker 在当前分片结束后退出，这里不阻塞等待
        let workers: Vec<HashWorker> = self.workers.lock().drain(..).collect();
        if !workers.is_empty() {
            info!("哈希 worker 池已释放: {} 个 worker", workers.len());
        }
    }
}

impl Drop for WorkerPoolHasher {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::plan_chunks;
    use crate::uploader::splitter::tests::sample_source;
    use crate::uploader::splitter::HashMessage;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc as tokio_mpsc;

    #[test]
    fn test_default_worker_count_floor() {
        assert!(default_worker_count() >= MIN_WORKERS);
    }

    #[tokio::test]
    async fn test_reports_each_chunk_individually() {
        let source = sample_source(10_000);
        let chunks = plan_chunks(&source, 1_000).unwrap();
        let pool = WorkerPoolHasher::new(3).unwrap();

        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        pool.calc_hash(chunks, HashCollector::new(tx));

        let mut seen = BTreeSet::new();
        while seen.len() < 10 {
            match rx.recv().await {
                Some(HashMessage::Hashed(batch)) => {
                    assert_eq!(batch.len(), 1);
                    assert!(batch[0].is_hashed());
                    seen.insert(batch[0].index);
                }
                other => panic!("意外的消息: {:?}", other),
            }
        }
        assert_eq!(seen, (0..10).collect());
        pool.dispose();
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let pool = WorkerPoolHasher::new(2).unwrap();
        pool.dispose();
        pool.dispose();
        assert!(pool.workers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_calc_hash_after_dispose_reports_nothing() {
        let source = sample_source(4_000);
        let chunks = plan_chunks(&source, 1_000).unwrap();
        let pool = WorkerPoolHasher::new(2).unwrap();
        pool.dispose();

        let (tx, mut rx) = tokio_mpsc::unbounded_channel();
        pool.calc_hash(chunks, HashCollector::new(tx));
        // 发送端随 collector 一起被丢弃
        assert!(rx.recv().await.is_none());
    }
}
