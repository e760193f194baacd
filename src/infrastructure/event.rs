//! 生命周期事件总线
//!
//! 处理函数按注册顺序在触发线程上同步执行。某个处理函数返回错误时，
//! 剩余处理函数不再执行，错误带上阶段名向上传播。

use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::ContextError;
use crate::logging::OperationTimer;

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 事件阶段
pub trait LifecyclePhase: Copy + Eq + Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// 按名称解析阶段：去空白、不区分大小写，空名称表示 `loaded`
    fn parse(name: &str) -> Option<Self>;
}

/// 应用上下文的生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Loaded,
    Started,
    Exit,
}

impl LifecyclePhase for Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Loaded => "loaded",
            Phase::Started => "started",
            Phase::Exit => "exit",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "loaded" => Some(Phase::Loaded),
            "init" => Some(Phase::Init),
            "started" => Some(Phase::Started),
            "exit" => Some(Phase::Exit),
            _ => None,
        }
    }
}

/// Web 上下文的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebPhase {
    Loaded,
    Started,
}

impl LifecyclePhase for WebPhase {
    fn name(&self) -> &'static str {
        match self {
            WebPhase::Loaded => "loaded",
            WebPhase::Started => "started",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "loaded" => Some(WebPhase::Loaded),
            "started" => Some(WebPhase::Started),
            _ => None,
        }
    }
}

struct Listener<P, H: ?Sized> {
    id: SubscriptionId,
    phase: P,
    handler: Arc<H>,
}

/// 事件总线
///
/// `H` 是处理函数的类型（通常是 `dyn Fn(&Event) -> anyhow::Result<()>`），
/// 具体的调用方式由触发方通过 [`EventBus::emit_with`] 提供。
pub struct EventBus<P, H: ?Sized> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Listener<P, H>>>,
}

impl<P: LifecyclePhase, H: ?Sized> EventBus<P, H> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, phase: P, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Listener { id, phase, handler });
        tracing::debug!(phase = phase.name(), subscription = id.0, "注册事件处理函数");
        id
    }

    /// 取消订阅；句柄不存在时返回 false
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        before != listeners.len()
    }

    /// 当前阶段的处理函数快照，按注册顺序
    pub fn handlers(&self, phase: P) -> Vec<Arc<H>> {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.phase == phase)
            .map(|listener| listener.handler.clone())
            .collect()
    }

    pub fn listener_count(&self, phase: P) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.phase == phase)
            .count()
    }

    /// 清空所有处理函数
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// 触发阶段，依次调用处理函数，返回被调用的数量
    ///
    /// 调用前先取快照并释放锁，处理函数内可以继续订阅。
    pub fn emit_with<F>(&self, phase: P, mut invoke: F) -> Result<usize, ContextError>
    where
        F: FnMut(&H) -> anyhow::Result<()>,
    {
        let handlers = self.handlers(phase);
        let timer = OperationTimer::new("emit").with_metadata("phase", phase.name());
        tracing::debug!(phase = phase.name(), handlers = handlers.len(), "触发事件");

        for handler in &handlers {
            if let Err(source) = invoke(handler.as_ref()) {
                tracing::error!(phase = phase.name(), error = %source, "事件处理函数失败");
                return Err(ContextError::Handler {
                    phase: phase.name(),
                    source,
                });
            }
        }

        timer.finish();
        Ok(handlers.len())
    }

    /// 按名称触发；未知名称记录日志后忽略，返回 `Ok(None)`
    pub fn emit_named_with<F>(&self, name: &str, mut invoke: F) -> Result<Option<usize>, ContextError>
    where
        F: FnMut(P, &H) -> anyhow::Result<()>,
    {
        let Some(phase) = P::parse(name) else {
            tracing::info!(event = name, "未知事件名称，忽略");
            return Ok(None);
        };
        self.emit_with(phase, |handler| invoke(phase, handler)).map(Some)
    }
}

impl<P: LifecyclePhase, H: ?Sized> Default for EventBus<P, H> {
    fn default() -> Self {
        Self::new()
    }
}
