//! 类型化事件通道
//!
//! 组件之间唯一的协调机制：每个组件拥有一个 `EventChannel<E>`，
//! 事件名是 `E::Kind`（封闭枚举），载荷由事件枚举本身静态携带。
//!
//! - 同一事件名下的监听器按订阅顺序调用
//! - 同一个监听器（`Arc` 指针相同）重复订阅只保留一份
//! - 发布是同步扇出；发布时先拍快照再逐个调用，监听器内部可以安全地
//!   订阅/取消订阅/再次发布
//! - 监听器 panic 会中断本次发布剩余的扇出，不做隔离

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 可在通道上发布的事件
pub trait Event: Send + Sync + 'static {
    /// 事件名（封闭集合）
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// 获取事件名
    fn kind(&self) -> Self::Kind;
}

/// 监听器
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// 订阅 ID，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<E> {
    id: ListenerId,
    listener: Listener<E>,
    once: bool,
}

/// 事件通道
pub struct EventChannel<E: Event> {
    listeners: Mutex<HashMap<E::Kind, Vec<Entry<E>>>>,
    next_id: AtomicU64,
}

impl<E: Event> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅事件
    ///
    /// 同一个监听器重复订阅同一事件时返回已有的订阅 ID
    pub fn subscribe(&self, kind: E::Kind, listener: Listener<E>) -> ListenerId {
        self.insert(kind, listener, false)
    }

    /// 订阅事件（闭包形式）
    pub fn on<F>(&self, kind: E::Kind, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(f))
    }

    /// 订阅一次，首次调用后自动取消订阅
    pub fn subscribe_once(&self, kind: E::Kind, listener: Listener<E>) -> ListenerId {
        self.insert(kind, listener, true)
    }

    /// 订阅一次（闭包形式）
    pub fn once<F>(&self, kind: E::Kind, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe_once(kind, Arc::new(f))
    }

    /// 按订阅 ID 取消订阅，返回是否确实移除了监听器
    pub fn unsubscribe(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// 按监听器本身（指针相等）取消订阅
    pub fn unsubscribe_listener(&self, kind: E::Kind, listener: &Listener<E>) -> bool {
        let id = {
            let listeners = self.listeners.lock();
            listeners.get(&kind).and_then(|entries| {
                entries
                    .iter()
                    .find(|e| Arc::ptr_eq(&e.listener, listener))
                    .map(|e| e.id)
            })
        };
        match id {
            Some(id) => self.unsubscribe(kind, id),
            None => false,
        }
    }

    /// 发布事件
    ///
    /// 没有订阅者时为空操作
    pub fn publish(&self, event: &E) {
        let kind = event.kind();
        let snapshot: Vec<Listener<E>> = {
            let mut listeners = self.listeners.lock();
            let Some(entries) = listeners.get_mut(&kind) else {
                return;
            };
            let snapshot = entries.iter().map(|e| e.listener.clone()).collect();
            // once 监听器在调用前移除，保证并发发布时也只触发一次
            entries.retain(|e| !e.once);
            if entries.is_empty() {
                listeners.remove(&kind);
            }
            snapshot
        };

        for listener in snapshot {
            listener(event);
        }
    }

    /// 某事件当前的订阅数
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .lock()
            .get(&kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// 清空所有订阅
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    fn insert(&self, kind: E::Kind, listener: Listener<E>, once: bool) -> ListenerId {
        let mut listeners = self.listeners.lock();
        let entries = listeners.entry(kind).or_default();

        if let Some(existing) = entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.listener, &listener))
        {
            return existing.id;
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(Entry { id, listener, once });
        id
    }
}

impl<E: Event> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Debug for EventChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock();
        let counts: HashMap<E::Kind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventChannel")
            .field("listeners", &counts)
            .finish()
    }
}
