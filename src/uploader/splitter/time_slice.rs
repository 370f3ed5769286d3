// 时间切片策略
//
// 在调用方所在的运行时上分批计算，每批 batch_size 个分片，
// 批与批之间显式让出执行权，避免长时间占用执行上下文

use super::{hash_chunk, ChunkHasher, HashCollector};
use crate::uploader::chunk::Chunk;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 默认每批分片数
pub const DEFAULT_TIME_SLICE_BATCH_SIZE: usize = 2;

/// 时间切片哈希策略
#[derive(Debug)]
pub struct TimeSliceHasher {
    batch_size: usize,
    disposed: Arc<AtomicBool>,
}

impl TimeSliceHasher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

}

impl Default for TimeSliceHasher {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_SLICE_BATCH_SIZE)
    }
}

impl ChunkHasher for TimeSliceHasher {
    fn name(&self) -> &'static str {
        "time_slice"
    }

    fn calc_hash(&self, chunks: Vec<Chunk>, collector: HashCollector) {
        let batch_size = self.batch_size;
        let disposed = self.disposed.clone();

        tokio::spawn(async move {
            for (batch_index, batch) in chunks.chunks(batch_size).enumerate() {
                if disposed.load(Ordering::SeqCst) {
                    debug!("时间切片策略已释放，停止于第 {} 批", batch_index);
                    return;
                }

                let results = join_all(batch.iter().map(hash_chunk)).await;
                for (chunk, result) in batch.iter().zip(results) {
                    if let Err(e) = result {
                        collector.fail(chunk.index, e);
                        return;
                    }
                }
                collector.report(batch.to_vec());

                // 让出执行权
                tokio::task::yield_now().await;
            }
        });
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
