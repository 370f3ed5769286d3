// 任务队列（有界并发 FIFO 调度器）
//
// - 按入队顺序取任务，同时执行的任务数不超过 concurrency
// - 任务完成（无论成功失败）只释放一个并发槽位并继续调度，不重试、不重新入队
// - pause 只停止取新任务，执行中的任务正常完成
// - clear 丢弃所有未开始的任务
// - 没有待执行任务且没有执行中任务时发布 TaskDrain

use crate::events::{EventChannel, QueueEvent};
use crate::uploader::task::{QueueStatus, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// 默认并发数
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug)]
struct QueueState {
    /// 待执行的任务
    pending: VecDeque<Task>,
    /// 当前正在执行的任务数
    running: usize,
    status: QueueStatus,
}

struct QueueInner {
    state: Mutex<QueueState>,
    concurrency: usize,
    events: EventChannel<QueueEvent>,
}

/// 有界并发任务队列
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: 0,
                    status: QueueStatus::Paused,
                }),
                concurrency: concurrency.max(1),
                events: EventChannel::new(),
            }),
        }
    }

    /// 事件通道
    pub fn events(&self) -> &EventChannel<QueueEvent> {
        &self.inner.events
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.state.lock().status
    }

    /// 待执行任务数
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// 执行中任务数
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    /// 添加任务
    pub fn add(&self, tasks: impl IntoIterator<Item = Task>) {
        self.inner.state.lock().pending.extend(tasks);
    }

    /// 添加任务并启动
    pub fn add_and_start(&self, tasks: impl IntoIterator<Item = Task>) {
        self.add(tasks);
        self.start();
    }

    /// 启动队列
    ///
    /// 已在运行时只补充调度新加入的任务；没有任何任务时直接发布 TaskDrain。
    /// 必须在 tokio 运行时中调用
    pub fn start(&self) {
        let event = {
            let mut state = self.inner.state.lock();
            match state.status {
                QueueStatus::Running => None,
                QueueStatus::Paused if state.pending.is_empty() && state.running == 0 => {
                    Some(QueueEvent::TaskDrain)
                }
                QueueStatus::Paused => {
                    state.status = QueueStatus::Running;
                    Some(QueueEvent::TaskStart)
                }
            }
        };

        match event {
            Some(QueueEvent::TaskDrain) => {
                self.inner.events.publish(&QueueEvent::TaskDrain);
            }
            Some(event) => {
                self.inner.events.publish(&event);
                self.run_next();
            }
            None => self.run_next(),
        }
    }

    /// 暂停队列，执行中的任务不会被取消
    pub fn pause(&self) {
        self.inner.state.lock().status = QueueStatus::Paused;
        self.inner.events.publish(&QueueEvent::TaskPause);
    }

    /// 丢弃所有未开始的任务，返回丢弃的数量
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        if discarded > 0 {
            debug!("任务队列已清空 {} 个待执行任务", discarded);
        }
        discarded
    }

    /// 调度：在并发上限内不断取出队首任务执行
    fn run_next(&self) {
        loop {
            let task = {
                let mut state = self.inner.state.lock();
                if state.status != QueueStatus::Running {
                    return;
                }
                if state.running >= self.inner.concurrency {
                    return;
                }
                match state.pending.pop_front() {
                    Some(task) => {
                        state.running += 1;
                        task
                    }
                    None => {
                        if state.running > 0 {
                            // 等执行中的任务完成后再判断是否排空
                            return;
                        }
                        state.status = QueueStatus::Paused;
                        drop(state);
                        self.inner.events.publish(&QueueEvent::TaskDrain);
                        return;
                    }
                }
            };

            self.spawn_task(task);
        }
    }

    fn spawn_task(&self, task: Task) {
        let queue = self.clone();
        tokio::spawn(async move {
            // 在独立任务中执行，任务 panic 也能释放槽位
            match tokio::spawn(task.run()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("任务执行失败: {:#}", e),
                Err(e) => warn!("任务异常退出: {}", e),
            }

            queue.inner.state.lock().running -= 1;
            queue.run_next();
        });
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskQueue")
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("status", &state.status)
            .field("concurrency", &self.inner.concurrency)
            .finish()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}
