// 分片上传模块
//
// - chunk: 分片模型与字节源
// - fingerprint: 分片指纹与整文件指纹
// - splitter: 分片器与三种哈希策略
// - task / scheduler: 任务与有界并发任务队列
// - strategy / local: 远端接口与本地文件系统实现
// - engine: 上传状态机

pub mod chunk;
pub mod engine;
pub mod fingerprint;
pub mod local;
pub mod scheduler;
pub mod splitter;
pub mod strategy;
pub mod task;

pub use chunk::{
    chunk_count, plan_chunks, ByteSource, Chunk, LocalFile, MemorySource, DEFAULT_CHUNK_SIZE,
};
pub use engine::{UploadEngine, UploadOutcome};
pub use fingerprint::{digest_bytes, whole_digest, OrderedDigest};
pub use local::{LocalStoreStrategy, SessionManifest};
pub use scheduler::{TaskQueue, DEFAULT_CONCURRENCY};
pub use splitter::{
    default_worker_count, ChunkHasher, ChunkSplitter, HashCollector, SequentialHasher,
    SplitStrategy, TimeSliceHasher, WorkerPoolHasher, DEFAULT_TIME_SLICE_BATCH_SIZE,
};
pub use strategy::{FileMeta, FingerprintCheck, FingerprintKind, RequestStrategy};
pub use task::{ChunkStatus, QueueStatus, Task, UploadStatus};
