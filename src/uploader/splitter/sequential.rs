// 顺序策略
//
// 所有分片的读取并发进行（依赖异步 I/O），全部完成后一次性上报

use super::{hash_chunk, ChunkHasher, HashCollector};
use crate::uploader::chunk::Chunk;
use futures::future::join_all;
use tracing::debug;

/// 顺序哈希策略
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialHasher;

impl ChunkHasher for SequentialHasher {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn calc_hash(&self, chunks: Vec<Chunk>, collector: HashCollector) {
        tokio::spawn(async move {
            let results = join_all(chunks.iter().map(hash_chunk)).await;

            for (chunk, result) in chunks.iter().zip(results) {
                if let Err(e) = result {
                    collector.fail(chunk.index, e);
                    return;
                }
            }

            debug!("顺序策略: {} 个分片哈希完成", chunks.len());
            collector.report(chunks);
        });
    }

    fn dispose(&self) {}
}
