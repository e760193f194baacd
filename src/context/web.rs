//! Web 上下文
//!
//! 只持有 Web 根对象（由外部 Web 框架提供，类型不透明）与独立的事件总线。

use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

use crate::errors::ContextError;
use crate::infrastructure::{EventBus, SubscriptionId, WebPhase};

/// Web 根对象，例如路由器或服务器实例
pub type WebRoot = Arc<dyn Any + Send + Sync>;

/// Web 事件处理函数
pub type WebHandler = dyn Fn(&WebEvent<'_>) -> anyhow::Result<()> + Send + Sync;

pub struct WebEvent<'a> {
    pub phase: WebPhase,
    pub root: Option<&'a WebRoot>,
}

impl WebEvent<'_> {
    /// 以具体类型取出 Web 根对象
    pub fn root_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.root.and_then(|root| root.clone().downcast::<T>().ok())
    }
}

#[derive(Default)]
pub struct WebContext {
    root: RwLock<Option<WebRoot>>,
    events: EventBus<WebPhase, WebHandler>,
}

impl WebContext {
    pub fn new(root: Option<WebRoot>) -> Self {
        Self {
            root: RwLock::new(root),
            events: EventBus::new(),
        }
    }

    pub fn root(&self) -> Option<WebRoot> {
        self.root.read().clone()
    }

    pub fn root_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.root().and_then(|root| root.downcast::<T>().ok())
    }

    /// 绑定 Web 根对象，返回之前绑定的对象
    pub fn bind_root(&self, root: WebRoot) -> Option<WebRoot> {
        self.root.write().replace(root)
    }

    pub fn events(&self) -> &EventBus<WebPhase, WebHandler> {
        &self.events
    }

    pub fn on<F>(&self, phase: WebPhase, handler: F) -> SubscriptionId
    where
        F: Fn(&WebEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(phase, Arc::new(handler))
    }

    pub fn on_loaded<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&WebEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(WebPhase::Loaded, handler)
    }

    pub fn on_started<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&WebEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(WebPhase::Started, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn emit(&self, phase: WebPhase) -> Result<usize, ContextError> {
        let root = self.root();
        let event = WebEvent {
            phase,
            root: root.as_ref(),
        };
        self.events.emit_with(phase, |handler| handler(&event))
    }

    pub fn emit_named(&self, name: &str) -> Result<bool, ContextError> {
        let root = self.root();
        self.events
            .emit_named_with(name, |phase, handler| {
                handler(&WebEvent {
                    phase,
                    root: root.as_ref(),
                })
            })
            .map(|invoked| invoked.is_some())
    }

    pub fn clear(&self) {
        self.events.clear();
    }
}
