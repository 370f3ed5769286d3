// 上传引擎
//
// 核心流程：
// 1. init: 创建上传会话 → 订阅分片器事件 → 开始分片
// 2. 每批分片哈希完成后立即入队上传（哈希与上传两条流水线并行）
// 3. 分片上传前先按指纹查询服务端，已存在则跳过传输
// 4. 整文件指纹产生且所有分片都已结束后进行整文件校验：
//    - 服务端已有 → 直接完成
//    - 服务端缺少部分分片 → 补传这些分片，队列排空后合并
//    - 否则 → 直接合并
//
// 失败的分片单独计数：成功数 + 失败数 == 总数 即视为全部结束，
// 只要有失败分片就以 Incomplete 错误结束，不合并

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::events::{
    EventChannel, QueueEvent, SplitterEvent, SplitterEventKind, UploadEvent, UploadEventKind,
};
use crate::uploader::chunk::{ByteSource, Chunk};
use crate::uploader::scheduler::TaskQueue;
use crate::uploader::splitter::ChunkSplitter;
use crate::uploader::strategy::{FileMeta, FingerprintKind, RequestStrategy};
use crate::uploader::task::{ChunkStatus, Task, UploadStatus};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 最终结果：文件地址或终止性错误
pub type UploadOutcome = Result<String, UploadError>;

// =====================================================
// 会话状态
// =====================================================

/// 会话状态，只由引擎修改
#[derive(Debug)]
struct SessionState {
    /// 会话 token
    token: Option<String>,
    /// 每个分片的状态
    chunk_status: Vec<ChunkStatus>,
    /// 每个分片最近一次结束时是否成功，尚未结束为 None
    settled: Vec<Option<bool>>,
    /// 成功（上传或跳过）的分片数
    succeeded: usize,
    /// 失败的分片数
    failed: usize,
    /// 补传中尚未结束的分片
    patching: BTreeSet<usize>,
    /// 是否已暂停
    paused: bool,
}

impl SessionState {
    fn new(total: usize) -> Self {
        Self {
            token: None,
            chunk_status: vec![ChunkStatus::Waiting; total],
            settled: vec![None; total],
            succeeded: 0,
            failed: 0,
            patching: BTreeSet::new(),
            paused: false,
        }
    }

    fn total(&self) -> usize {
        self.chunk_status.len()
    }

    /// 所有分片是否都已结束（成功或失败）
    fn all_settled(&self) -> bool {
        self.succeeded + self.failed == self.total()
    }

    fn progress(&self) -> u8 {
        let total = self.total();
        if total == 0 {
            return 100;
        }
        ((self.succeeded as f64 / total as f64) * 100.0).round() as u8
    }

    fn failed_indices(&self) -> Vec<usize> {
        self.chunk_status
            .iter()
            .enumerate()
            .filter(|(_, status)| **status == ChunkStatus::Failed)
            .map(|(index, _)| index)
            .collect()
    }

    /// 补传的分片是否都已结束
    fn patch_settled(&self) -> bool {
        self.patching.is_empty()
    }

    /// 更新分片状态并维护计数，返回是否发生变化
    ///
    /// 计数只在分片结束时变化：补传中的分片回到 Queued 等状态时仍按上一次结果计数，
    /// 成功的分片再次成功不会重复计数
    fn update(&mut self, index: usize, status: ChunkStatus) -> bool {
        let Some(current) = self.chunk_status.get_mut(index) else {
            return false;
        };
        if *current == status {
            return false;
        }
        *current = status;

        if status.is_terminal() {
            let success = status.is_done();
            match self.settled[index].replace(success) {
                Some(true) => self.succeeded -= 1,
                Some(false) => self.failed -= 1,
                None => {}
            }
            if success {
                self.succeeded += 1;
            } else {
                self.failed += 1;
            }
            self.patching.remove(&index);
        }
        true
    }
}

// =====================================================
// 上传引擎
// =====================================================

struct EngineInner {
    /// 待上传文件
    source: Arc<dyn ByteSource>,
    /// 远端接口
    strategy: Arc<dyn RequestStrategy>,
    /// 分片器
    splitter: ChunkSplitter,
    /// 上传任务队列
    queue: TaskQueue,
    /// 上传事件
    events: EventChannel<UploadEvent>,
    session: Mutex<SessionState>,
    status: Mutex<UploadStatus>,
    /// 整文件指纹
    whole_hash: Mutex<Option<String>>,
    /// 整文件校验只进行一次
    verify_started: AtomicBool,
    /// 进入终态时取消
    cancel_token: CancellationToken,
    /// 最终结果
    outcome: watch::Sender<Option<UploadOutcome>>,
}

/// 分片上传引擎
///
/// 负责单个文件的一次上传：创建会话、并行哈希与上传、整文件校验、补传、合并。
/// 进入终态（完成、失败、取消）后不可再次使用
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    /// 创建上传引擎
    ///
    /// `splitter` 必须基于同一个 `source` 创建
    pub fn new(
        source: Arc<dyn ByteSource>,
        strategy: Arc<dyn RequestStrategy>,
        splitter: ChunkSplitter,
        concurrency: usize,
    ) -> Self {
        let total = splitter.chunks().len();
        let (outcome, _) = watch::channel(None);

        Self {
            inner: Arc::new(EngineInner {
                source,
                strategy,
                splitter,
                queue: TaskQueue::new(concurrency),
                events: EventChannel::new(),
                session: Mutex::new(SessionState::new(total)),
                status: Mutex::new(UploadStatus::Idle),
                whole_hash: Mutex::new(None),
                verify_started: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
                outcome,
            }),
        }
    }

    /// 按配置创建上传引擎
    pub fn from_config(
        source: Arc<dyn ByteSource>,
        strategy: Arc<dyn RequestStrategy>,
        config: &UploadConfig,
    ) -> Result<Self, UploadError> {
        let splitter =
            ChunkSplitter::new(source.clone(), config.chunk_size, config.split_strategy())?;
        Ok(Self::new(source, strategy, splitter, config.concurrency))
    }

    /// 上传事件通道
    pub fn events(&self) -> &EventChannel<UploadEvent> {
        &self.inner.events
    }

    /// 进度回调（0-100）
    pub fn on_progress<F>(&self, f: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.inner
            .events
            .on(UploadEventKind::UploadProgress, move |event| {
                if let UploadEvent::Progress(percent) = event {
                    f(*percent);
                }
            });
    }

    /// 完成回调，参数为文件地址
    pub fn on_end<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.events.on(UploadEventKind::UploadEnd, move |event| {
            if let UploadEvent::End(url) = event {
                f(url);
            }
        });
    }

    /// 错误回调
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&UploadError) + Send + Sync + 'static,
    {
        self.inner
            .events
            .on(UploadEventKind::UploadError, move |event| {
                if let UploadEvent::Error(error) = event {
                    f(error);
                }
            });
    }

    pub fn status(&self) -> UploadStatus {
        *self.inner.status.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.session.lock().paused
    }

    /// 当前进度（0-100）
    pub fn progress(&self) -> u8 {
        self.inner.session.lock().progress()
    }

    /// 分片总数
    pub fn total_chunks(&self) -> usize {
        self.inner.splitter.chunks().len()
    }

    /// 分片状态
    pub fn chunk_status(&self, index: usize) -> Option<ChunkStatus> {
        self.inner.session.lock().chunk_status.get(index).copied()
    }

    /// 会话 token（取消后清空）
    pub fn token(&self) -> Option<String> {
        self.inner.session.lock().token.clone()
    }

    /// 整文件指纹
    pub fn whole_hash(&self) -> Option<String> {
        self.inner.whole_hash.lock().clone()
    }

    /// 启动上传
    ///
    /// 创建会话失败时以 SessionCreation 错误结束，并同时返回该错误
    pub async fn init(&self) -> Result<(), UploadError> {
        {
            let mut status = self.inner.status.lock();
            if *status != UploadStatus::Idle {
                return Err(UploadError::InvalidState(format!(
                    "init 只能在 Idle 状态调用，当前状态: {:?}",
                    *status
                )));
            }
            *status = UploadStatus::Initializing;
        }

        let meta = FileMeta {
            name: self.inner.source.name().to_string(),
            size: self.inner.source.size(),
            chunk_size: self.inner.splitter.chunk_size(),
            chunk_count: self.inner.splitter.chunks().len(),
        };
        info!(
            "开始上传: 文件={}, 大小={}, 分片数={}, 策略={}, 并发={}",
            meta.name,
            meta.size,
            meta.chunk_count,
            self.inner.splitter.strategy_name(),
            self.inner.queue.concurrency()
        );

        let token = match self.inner.strategy.create_file(&meta).await {
            Ok(token) => token,
            Err(e) => {
                let err = UploadError::SessionCreation(format!("{:#}", e));
                error!("创建上传会话失败: {:#}", e);
                self.inner.finish(Err(err.clone()));
                return Err(err);
            }
        };

        // 创建会话期间被取消
        if self.inner.is_stopped() {
            return Err(UploadError::Cancelled);
        }

        self.inner.session.lock().token = Some(token);
        if !self.inner.advance(UploadStatus::Uploading) {
            return Err(UploadError::Cancelled);
        }

        self.subscribe_splitter();
        self.inner.splitter.split();
        Ok(())
    }

    fn subscribe_splitter(&self) {
        let events = self.inner.splitter.events();

        let weak = Arc::downgrade(&self.inner);
        events.on(SplitterEventKind::ChunksHashed, move |event| {
            if let (Some(inner), SplitterEvent::ChunksHashed(chunks)) = (weak.upgrade(), event) {
                inner.enqueue_chunks(chunks);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        events.on(SplitterEventKind::WholeHash, move |event| {
            if let (Some(inner), SplitterEvent::WholeHash(digest)) = (weak.upgrade(), event) {
                *inner.whole_hash.lock() = Some(digest.clone());
                inner.on_whole_hash();
            }
        });

        let weak = Arc::downgrade(&self.inner);
        events.on(SplitterEventKind::Failed, move |event| {
            if let (Some(inner), SplitterEvent::Failed(message)) = (weak.upgrade(), event) {
                inner.finish(Err(UploadError::Hashing(message.clone())));
            }
        });
    }

    /// 暂停上传
    ///
    /// 只停止调度新的分片任务，执行中的任务正常完成，分片器继续在后台计算哈希
    pub fn pause(&self) {
        if self.status().is_terminal() {
            return;
        }
        {
            let mut session = self.inner.session.lock();
            if session.paused {
                return;
            }
            session.paused = true;
        }
        self.inner.queue.pause();
        info!("上传已暂停");
    }

    /// 恢复上传
    pub fn resume(&self) {
        if self.status().is_terminal() {
            return;
        }
        {
            let mut session = self.inner.session.lock();
            if !session.paused {
                return;
            }
            session.paused = false;
        }
        info!("上传已恢复");
        self.inner.queue.start();
    }

    /// 取消上传
    ///
    /// 任何状态下都可以调用；已处于终态时为空操作，返回 false。
    /// 执行中的远端请求不会被打断，其结果被忽略
    pub fn cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }

        self.inner.queue.pause();
        let discarded = self.inner.queue.clear();
        self.inner.splitter.dispose();
        {
            let mut session = self.inner.session.lock();
            let total = session.total();
            *session = SessionState::new(total);
        }

        info!("上传已取消，丢弃 {} 个待执行任务", discarded);
        self.inner.finish(Err(UploadError::Cancelled))
    }

    /// 等待上传结束，返回文件地址或终止性错误
    pub async fn wait(&self) -> UploadOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Some(Err(UploadError::InvalidState("上传引擎已释放".to_string()))),
        };
        outcome.unwrap_or_else(|| Err(UploadError::InvalidState("上传结果缺失".to_string())))
    }
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("UploadEngine")
            .field("file", &self.inner.source.name())
            .field("status", &*self.inner.status.lock())
            .field("succeeded", &session.succeeded)
            .field("failed", &session.failed)
            .field("total", &session.total())
            .field("paused", &session.paused)
            .finish()
    }
}

impl EngineInner {
    /// 是否已进入终态
    fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 切换到下一个活跃状态，已进入终态时返回 false
    fn advance(&self, next: UploadStatus) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        debug!("上传状态: {:?} -> {:?}", *status, next);
        *status = next;
        true
    }

    /// 进入终态并发布结果，只会生效一次
    fn finish(&self, outcome: UploadOutcome) -> bool {
        {
            let mut status = self.status.lock();
            if status.is_terminal() {
                debug!("上传已结束，忽略结果: {:?}", outcome);
                return false;
            }
            *status = match &outcome {
                Ok(_) => UploadStatus::Done,
                Err(UploadError::Cancelled) => UploadStatus::Cancelled,
                Err(_) => UploadStatus::Failed,
            };
        }

        self.cancel_token.cancel();
        self.queue.clear();
        self.splitter.dispose();

        match &outcome {
            Ok(url) => {
                info!("上传完成: {}", url);
                self.events.publish(&UploadEvent::End(url.clone()));
            }
            Err(e) => {
                if *e == UploadError::Cancelled {
                    info!("上传已取消");
                } else {
                    error!("上传失败: {}", e);
                }
                self.events.publish(&UploadEvent::Error(e.clone()));
            }
        }

        self.outcome.send_replace(Some(outcome));
        true
    }

    fn set_chunk_status(&self, index: usize, status: ChunkStatus) {
        let changed = self.session.lock().update(index, status);
        if changed {
            self.events
                .publish(&UploadEvent::ChunkStatusChange { index, status });
        }
    }

    /// 把分片加入上传队列；暂停时只入队不启动
    fn enqueue_chunks(self: &Arc<Self>, chunks: &[Chunk]) {
        if self.is_stopped() {
            return;
        }

        let mut tasks = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            self.set_chunk_status(chunk.index, ChunkStatus::Queued);
            let weak = Arc::downgrade(self);
            let chunk = chunk.clone();
            let index = chunk.index;
            tasks.push(
                Task::new(move || Self::upload_chunk(weak, chunk)).with_payload(index),
            );
        }

        if self.session.lock().paused {
            self.queue.add(tasks);
        } else {
            self.queue.add_and_start(tasks);
        }
    }

    /// 单个分片的上传任务
    async fn upload_chunk(weak: Weak<Self>, chunk: Chunk) -> anyhow::Result<()> {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        if inner.is_stopped() {
            return Ok(());
        }
        let Some(token) = inner.session.lock().token.clone() else {
            return Ok(());
        };

        let index = chunk.index;
        inner.set_chunk_status(index, ChunkStatus::Checking);
        let result = inner.transfer_chunk(&token, &chunk).await;

        // 取消之后返回的结果一律忽略
        if inner.is_stopped() {
            return Ok(());
        }

        match result {
            Ok(status) => {
                debug!("分片 #{} {:?}", index, status);
                inner.set_chunk_status(index, status);
                inner.publish_progress();
                Ok(())
            }
            Err(e) => {
                warn!("分片 #{} 上传失败: {:#}", index, e);
                // 先报告分片错误，再计入失败数（计入后可能立即触发整文件校验）
                inner.events.publish(&UploadEvent::Error(UploadError::ChunkTransfer {
                    index,
                    message: format!("{:#}", e),
                }));
                inner.set_chunk_status(index, ChunkStatus::Failed);
                inner.publish_progress();
                Err(e)
            }
        }
    }

    /// 秒传检查 + 传输，返回分片的最终状态
    async fn transfer_chunk(&self, token: &str, chunk: &Chunk) -> anyhow::Result<ChunkStatus> {
        let fingerprint = chunk
            .fingerprint()
            .context(format!("分片 #{} 尚未计算指纹", chunk.index))?;

        let check = self
            .strategy
            .check_fingerprint(
                token,
                fingerprint,
                FingerprintKind::Chunk { index: chunk.index },
            )
            .await
            .context("分片指纹校验失败")?;
        if check.exists {
            return Ok(ChunkStatus::Skipped);
        }

        if self.is_stopped() {
            return Ok(ChunkStatus::Queued);
        }
        self.set_chunk_status(chunk.index, ChunkStatus::Uploading);
        self.strategy
            .upload_chunk(token, chunk)
            .await
            .context("分片传输失败")?;
        Ok(ChunkStatus::Uploaded)
    }

    fn publish_progress(&self) {
        let percent = self.session.lock().progress();
        self.events.publish(&UploadEvent::Progress(percent));
    }

    /// 条件满足时执行 `then`，否则在任务队列下次排空时重新检查
    ///
    /// 排空事件可能来自上一轮任务，每次触发都重新判断条件，不满足就继续等待
    fn when_settled(self: &Arc<Self>, settled: fn(&SessionState) -> bool, then: fn(&Arc<Self>)) {
        if self.is_stopped() {
            return;
        }

        if !settled(&self.session.lock()) {
            let weak = Arc::downgrade(self);
            let id = self.queue.events().once(QueueEvent::TaskDrain, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.when_settled(settled, then);
                }
            });

            // 订阅之前条件可能已经满足
            if !settled(&self.session.lock()) {
                return;
            }
            // 监听器已被触发时由它负责继续
            if !self.queue.events().unsubscribe(QueueEvent::TaskDrain, id) {
                return;
            }
        }

        then(self);
    }

    /// 整文件指纹已产生
    ///
    /// 所有分片都结束后才开始整文件校验
    fn on_whole_hash(self: &Arc<Self>) {
        if !self.session.lock().all_settled() {
            debug!("整文件指纹已就绪，等待分片上传结束");
        }
        self.when_settled(SessionState::all_settled, Self::start_verify);
    }

    fn start_verify(self: &Arc<Self>) {
        if self.verify_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Self::verify(self.clone()));
    }

    /// 整文件校验
    async fn verify(self: Arc<Self>) {
        let failed = self.session.lock().failed_indices();
        if !failed.is_empty() {
            self.finish(Err(UploadError::Incomplete { failed }));
            return;
        }

        if !self.advance(UploadStatus::Verifying) {
            return;
        }
        let Some(token) = self.session.lock().token.clone() else {
            return;
        };
        let Some(digest) = self.whole_hash.lock().clone() else {
            self.finish(Err(UploadError::Verification(
                "整文件指纹缺失".to_string(),
            )));
            return;
        };

        info!("整文件校验: {}", digest);
        let check = match self
            .strategy
            .check_fingerprint(&token, &digest, FingerprintKind::File)
            .await
        {
            Ok(check) => check,
            Err(e) => {
                self.finish(Err(UploadError::Verification(format!("{:#}", e))));
                return;
            }
        };
        if self.is_stopped() {
            return;
        }

        if check.exists {
            match check.url {
                Some(url) => {
                    info!("服务端已有该文件，跳过合并");
                    self.finish(Ok(url));
                }
                None => {
                    warn!("服务端已有该文件但未返回地址，继续合并");
                    self.merge().await;
                }
            }
            return;
        }

        if check.missing_indices.is_empty() {
            self.merge().await;
        } else {
            self.patch(check.missing_indices);
        }
    }

    /// 补传服务端缺少的分片，队列排空后合并
    fn patch(self: &Arc<Self>, missing: Vec<usize>) {
        let total = self.splitter.chunks().len();
        let missing: BTreeSet<usize> = missing.into_iter().collect();
        if let Some(invalid) = missing.iter().find(|index| **index >= total) {
            self.finish(Err(UploadError::Verification(format!(
                "服务端返回的缺失分片索引越界: {} (共 {} 个分片)",
                invalid, total
            ))));
            return;
        }

        if !self.advance(UploadStatus::Patching) {
            return;
        }
        info!("服务端缺少 {} 个分片，开始补传: {:?}", missing.len(), missing);

        let chunks: Vec<Chunk> = missing
            .iter()
            .filter_map(|index| self.splitter.chunk(*index).cloned())
            .collect();
        self.session.lock().patching = chunks.iter().map(|chunk| chunk.index).collect();
        self.enqueue_chunks(&chunks);

        self.when_settled(SessionState::patch_settled, |inner| {
            tokio::spawn(inner.clone().after_patch());
        });
    }

    async fn after_patch(self: Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let failed = self.session.lock().failed_indices();
        if !failed.is_empty() {
            self.finish(Err(UploadError::Incomplete { failed }));
            return;
        }
        self.merge().await;
    }

    async fn merge(&self) {
        if !self.advance(UploadStatus::Merging) {
            return;
        }
        let Some(token) = self.session.lock().token.clone() else {
            return;
        };

        info!("请求合并文件: token={}", token);
        match self.strategy.merge_file(&token).await {
            Ok(url) => {
                self.finish(Ok(url));
            }
            Err(e) => {
                self.finish(Err(UploadError::Merge(format!("{:#}", e))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadErrorKind;
    use crate::uploader::chunk::MemorySource;
    use crate::uploader::splitter::SplitStrategy;
    use crate::uploader::strategy::FingerprintCheck;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const MB: usize = 1024 * 1024;

    /// 可编排的远端接口
    #[derive(Default)]
    struct MockStrategy {
        /// 服务端已有的分片指纹
        stored_chunks: Mutex<HashSet<String>>,
        /// 整文件已存在时返回的地址
        file_url: Option<String>,
        /// 第一次整文件校验返回的缺失分片
        missing_once: Mutex<Option<Vec<usize>>>,
        /// 上传时必定失败的分片
        failing_chunks: HashSet<usize>,
        fail_create: bool,
        upload_delay: Option<Duration>,
        uploads: Mutex<Vec<usize>>,
        merges: AtomicUsize,
    }

    impl MockStrategy {
        fn uploads(&self) -> Vec<usize> {
            let mut uploads = self.uploads.lock().clone();
            uploads.sort();
            uploads
        }
    }

    #[async_trait]
    impl RequestStrategy for MockStrategy {
        async fn create_file(&self, meta: &FileMeta) -> anyhow::Result<String> {
            if self.fail_create {
                anyhow::bail!("服务不可用");
            }
            Ok(format!("token-{}", meta.name))
        }

        async fn upload_chunk(&self, _token: &str, chunk: &Chunk) -> anyhow::Result<()> {
            if let Some(delay) = self.upload_delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing_chunks.contains(&chunk.index) {
                anyhow::bail!("连接被重置");
            }
            self.uploads.lock().push(chunk.index);
            Ok(())
        }

        async fn merge_file(&self, token: &str) -> anyhow::Result<String> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://files.example/{}", token))
        }

        async fn check_fingerprint(
            &self,
            _token: &str,
            fingerprint: &str,
            kind: FingerprintKind,
        ) -> anyhow::Result<FingerprintCheck> {
            match kind {
                FingerprintKind::Chunk { .. } => {
                    let exists = self.stored_chunks.lock().contains(fingerprint);
                    Ok(if exists {
                        FingerprintCheck::found(None)
                    } else {
                        FingerprintCheck::missing(Vec::new())
                    })
                }
                FingerprintKind::File => {
                    if let Some(url) = &self.file_url {
                        return Ok(FingerprintCheck::found(Some(url.clone())));
                    }
                    let missing = self.missing_once.lock().take().unwrap_or_default();
                    Ok(FingerprintCheck::missing(missing))
                }
            }
        }
    }

    fn source_of(size: usize) -> Arc<dyn ByteSource> {
        let data: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
        Arc::new(MemorySource::new("video.mp4", data))
    }

    fn engine_with(
        source: Arc<dyn ByteSource>,
        strategy: Arc<MockStrategy>,
        chunk_size: u64,
        split: SplitStrategy,
        concurrency: usize,
    ) -> UploadEngine {
        let splitter = ChunkSplitter::new(source.clone(), chunk_size, split).unwrap();
        UploadEngine::new(source, strategy, splitter, concurrency)
    }

    /// 记录所有错误事件
    fn collect_errors(engine: &UploadEngine) -> Arc<Mutex<Vec<UploadError>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        engine.on_error(move |e| errors_clone.lock().push(e.clone()));
        errors
    }

    async fn wait_outcome(engine: &UploadEngine) -> UploadOutcome {
        tokio::time::timeout(Duration::from_secs(10), engine.wait())
            .await
            .expect("上传超时")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fresh_upload_merges_once() {
        for split in [
            SplitStrategy::Sequential,
            SplitStrategy::WorkerPool { workers: 4 },
            SplitStrategy::TimeSlice { batch_size: 2 },
        ] {
            let strategy = Arc::new(MockStrategy::default());
            let engine = engine_with(source_of(10 * MB), strategy.clone(), 2 * MB as u64, split, 4);

            let progress = Arc::new(Mutex::new(Vec::new()));
            let progress_clone = progress.clone();
            engine.on_progress(move |p| progress_clone.lock().push(p));
            let ends = Arc::new(AtomicUsize::new(0));
            let ends_clone = ends.clone();
            engine.on_end(move |_| {
                ends_clone.fetch_add(1, Ordering::SeqCst);
            });

            engine.init().await.unwrap();
            let url = wait_outcome(&engine).await.unwrap();

            assert_eq!(url, "https://files.example/token-video.mp4");
            assert_eq!(strategy.uploads(), vec![0, 1, 2, 3, 4], "策略 {:?}", split);
            assert_eq!(strategy.merges.load(Ordering::SeqCst), 1);
            assert_eq!(ends.load(Ordering::SeqCst), 1);
            assert_eq!(engine.status(), UploadStatus::Done);
            assert!(engine.whole_hash().is_some());

            // 并发完成的分片可能乱序发布进度
            let mut progress = progress.lock().clone();
            progress.sort();
            assert_eq!(progress, vec![20, 40, 60, 80, 100]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_existing_file_transfers_nothing() {
        // 先算出所有分片指纹，作为服务端已有的内容
        let source = source_of(10 * MB);
        let reference = ChunkSplitter::new(source.clone(), 2 * MB as u64, SplitStrategy::Sequential)
            .unwrap();
        let stored: HashSet<String> = reference
            .chunks()
            .iter()
            .map(|c| crate::uploader::fingerprint::digest_bytes(&c.read_data_blocking().unwrap()))
            .collect();

        let strategy = Arc::new(MockStrategy {
            stored_chunks: Mutex::new(stored),
            file_url: Some("https://files.example/stored".to_string()),
            ..Default::default()
        });
        let engine = engine_with(
            source,
            strategy.clone(),
            2 * MB as u64,
            SplitStrategy::Sequential,
            4,
        );

        engine.init().await.unwrap();
        let url = wait_outcome(&engine).await.unwrap();

        assert_eq!(url, "https://files.example/stored");
        assert!(strategy.uploads().is_empty());
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 0);
        assert!((0..5).all(|i| engine.chunk_status(i) == Some(ChunkStatus::Skipped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_chunks_are_patched() {
        let strategy = Arc::new(MockStrategy {
            missing_once: Mutex::new(Some(vec![4, 2])),
            ..Default::default()
        });
        let engine = engine_with(
            source_of(10 * MB),
            strategy.clone(),
            2 * MB as u64,
            SplitStrategy::Sequential,
            1,
        );
        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();
        engine.on_progress(move |p| progress_clone.lock().push(p));

        engine.init().await.unwrap();
        wait_outcome(&engine).await.unwrap();

        assert_eq!(strategy.uploads(), vec![0, 1, 2, 2, 3, 4, 4]);
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 1);
        assert_eq!(engine.progress(), 100);

        // 补传期间进度不回退
        let progress = progress.lock().clone();
        assert_eq!(progress, vec![20, 40, 60, 80, 100, 100, 100]);
    }

    #[test]
    fn test_patching_keeps_succeeded_count() {
        let mut session = SessionState::new(3);
        for index in 0..3 {
            session.update(index, ChunkStatus::Queued);
            session.update(index, ChunkStatus::Uploaded);
        }
        assert_eq!(session.progress(), 100);

        session.patching = [1].into_iter().collect();
        for status in [ChunkStatus::Queued, ChunkStatus::Checking, ChunkStatus::Uploading] {
            session.update(1, status);
            assert_eq!(session.succeeded, 3);
            assert!(session.all_settled());
            assert!(!session.patch_settled());
        }

        session.update(1, ChunkStatus::Uploaded);
        assert_eq!(session.succeeded, 3);
        assert!(session.patch_settled());

        // 补传失败时从成功数移到失败数
        session.update(2, ChunkStatus::Queued);
        session.update(2, ChunkStatus::Failed);
        assert_eq!((session.succeeded, session.failed), (2, 1));
        assert_eq!(session.failed_indices(), vec![2]);
    }

    #[tokio::test]
    async fn test_stale_drain_does_not_end_patch() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let strategy = Arc::new(MockStrategy::default());
        let engine = engine_with(source_of(3_000), strategy, 1_000, SplitStrategy::Sequential, 1);
        let inner = engine.inner.clone();
        inner.session.lock().patching = [1].into_iter().collect();

        inner.when_settled(SessionState::patch_settled, |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });

        // 上一轮任务遗留的排空事件：补传分片尚未结束，继续等待
        inner.queue.events().publish(&QueueEvent::TaskDrain);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(inner.queue.events().listener_count(QueueEvent::TaskDrain), 1);

        inner.session.lock().update(1, ChunkStatus::Uploaded);
        inner.queue.events().publish(&QueueEvent::TaskDrain);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(inner.queue.events().listener_count(QueueEvent::TaskDrain), 0);

        // 条件已满足时立即执行，不再订阅
        inner.when_settled(SessionState::patch_settled, |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(inner.queue.events().listener_count(QueueEvent::TaskDrain), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_outcome_repeatedly() {
        let strategy = Arc::new(MockStrategy::default());
        let engine = engine_with(source_of(2_000), strategy, 1_000, SplitStrategy::Sequential, 2);

        let waiter = engine.clone();
        let pending = tokio::spawn(async move { waiter.wait().await });

        engine.init().await.unwrap();
        let url = wait_outcome(&engine).await.unwrap();
        assert_eq!(pending.await.unwrap(), Ok(url.clone()));
        assert_eq!(engine.wait().await, Ok(url));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_missing_index_fails_verification() {
        let strategy = Arc::new(MockStrategy {
            missing_once: Mutex::new(Some(vec![9])),
            ..Default::default()
        });
        let engine = engine_with(
            source_of(4_000),
            strategy.clone(),
            1_000,
            SplitStrategy::Sequential,
            2,
        );

        engine.init().await.unwrap();
        let err = wait_outcome(&engine).await.unwrap_err();
        assert_eq!(err.kind(), UploadErrorKind::Verification);
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_chunk_ends_incomplete() {
        let strategy = Arc::new(MockStrategy {
            failing_chunks: [1].into_iter().collect(),
            ..Default::default()
        });
        let engine = engine_with(
            source_of(4_000),
            strategy.clone(),
            1_000,
            SplitStrategy::Sequential,
            2,
        );
        let errors = collect_errors(&engine);

        engine.init().await.unwrap();
        let err = wait_outcome(&engine).await.unwrap_err();

        assert_eq!(err, UploadError::Incomplete { failed: vec![1] });
        assert_eq!(engine.status(), UploadStatus::Failed);
        assert_eq!(engine.chunk_status(1), Some(ChunkStatus::Failed));
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 0);

        let kinds: Vec<UploadErrorKind> = errors.lock().iter().map(UploadError::kind).collect();
        assert_eq!(
            kinds,
            vec![UploadErrorKind::ChunkTransfer, UploadErrorKind::Incomplete]
        );
    }

    #[tokio::test]
    async fn test_session_creation_failure() {
        let strategy = Arc::new(MockStrategy {
            fail_create: true,
            ..Default::default()
        });
        let engine = engine_with(source_of(4_000), strategy, 1_000, SplitStrategy::Sequential, 2);
        let errors = collect_errors(&engine);

        let err = engine.init().await.unwrap_err();
        assert_eq!(err.kind(), UploadErrorKind::SessionCreation);
        assert_eq!(wait_outcome(&engine).await.unwrap_err(), err);
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(engine.status(), UploadStatus::Failed);

        // 终态之后不能再次启动
        assert!(matches!(
            engine.init().await,
            Err(UploadError::InvalidState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_is_terminal_and_reported_once() {
        let strategy = Arc::new(MockStrategy {
            upload_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let engine = engine_with(
            source_of(20_000),
            strategy.clone(),
            1_000,
            SplitStrategy::Sequential,
            1,
        );
        let errors = collect_errors(&engine);

        engine.init().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(engine.cancel());
        assert!(!engine.cancel());

        assert_eq!(wait_outcome(&engine).await, Err(UploadError::Cancelled));
        assert_eq!(engine.status(), UploadStatus::Cancelled);
        assert_eq!(engine.inner.queue.pending_count(), 0);
        assert_eq!(engine.token(), None);
        assert_eq!(engine.progress(), 0);

        // 执行中的任务结束后也不会再产生事件
        tokio::time::sleep(Duration::from_millis(100)).await;
        let errors = errors.lock().clone();
        assert_eq!(errors, vec![UploadError::Cancelled]);
        assert!(strategy.uploads().len() < 20);
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_done_is_noop() {
        let strategy = Arc::new(MockStrategy::default());
        let engine = engine_with(source_of(3_000), strategy, 1_000, SplitStrategy::Sequential, 2);
        let errors = collect_errors(&engine);

        engine.init().await.unwrap();
        wait_outcome(&engine).await.unwrap();

        assert!(!engine.cancel());
        assert_eq!(engine.status(), UploadStatus::Done);
        assert!(errors.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_resume() {
        let strategy = Arc::new(MockStrategy {
            upload_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let engine = engine_with(
            source_of(8_000),
            strategy.clone(),
            1_000,
            SplitStrategy::Sequential,
            1,
        );

        engine.pause();
        assert!(engine.is_paused());
        engine.init().await.unwrap();

        // 暂停期间分片照常哈希，但不会上传
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(strategy.uploads().is_empty());
        assert!(engine.inner.splitter.chunks().iter().all(Chunk::is_hashed));
        assert!(!engine.status().is_terminal());

        engine.resume();
        assert!(!engine.is_paused());
        wait_outcome(&engine).await.unwrap();

        assert_eq!(strategy.uploads(), (0..8).collect::<Vec<_>>());
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let strategy = Arc::new(MockStrategy::default());
        let engine = engine_with(
            source_of(0),
            strategy.clone(),
            1_000,
            SplitStrategy::Sequential,
            2,
        );

        engine.init().await.unwrap();
        wait_outcome(&engine).await.unwrap();

        assert_eq!(engine.total_chunks(), 0);
        assert_eq!(
            engine.whole_hash().as_deref(),
            Some(crate::uploader::fingerprint::digest_bytes(b"").as_str())
        );
        assert_eq!(strategy.merges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chunk_status_events() {
        let strategy = Arc::new(MockStrategy::default());
        let engine = engine_with(source_of(1_000), strategy, 1_000, SplitStrategy::Sequential, 1);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = statuses.clone();
        engine
            .events()
            .on(UploadEventKind::ChunkStatusChange, move |event| {
                if let UploadEvent::ChunkStatusChange { status, .. } = event {
                    statuses_clone.lock().push(*status);
                }
            });

        engine.init().await.unwrap();
        wait_outcome(&engine).await.unwrap();

        assert_eq!(
            *statuses.lock(),
            vec![
                ChunkStatus::Queued,
                ChunkStatus::Checking,
                ChunkStatus::Uploading,
                ChunkStatus::Uploaded
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_with_local_store() {
        use crate::uploader::local::LocalStoreStrategy;

        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(LocalStoreStrategy::open(dir.path()).await.unwrap());
        let source = source_of(5_500);

        let splitter =
            ChunkSplitter::new(source.clone(), 1_000, SplitStrategy::Sequential).unwrap();
        let engine = UploadEngine::new(source.clone(), store.clone(), splitter, 2);
        engine.init().await.unwrap();
        let url = wait_outcome(&engine).await.unwrap();
        let merged = std::fs::read(url.strip_prefix("file://").unwrap()).unwrap();
        assert_eq!(merged, source.read_range(0..5_500).unwrap());

        // 第二次上传同一文件：整文件已存在，直接返回相同地址
        let splitter =
            ChunkSplitter::new(source.clone(), 1_000, SplitStrategy::Sequential).unwrap();
        let engine = UploadEngine::new(source, store, splitter, 2);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = statuses.clone();
        engine
            .events()
            .on(UploadEventKind::ChunkStatusChange, move |event| {
                if let UploadEvent::ChunkStatusChange { status, .. } = event {
                    statuses_clone.lock().push(*status);
                }
            });
        engine.init().await.unwrap();
        assert_eq!(wait_outcome(&engine).await.unwrap(), url);
        assert!(!statuses.lock().contains(&ChunkStatus::Uploading));
    }
}
