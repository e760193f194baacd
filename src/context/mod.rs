//! 应用上下文
//!
//! 持有配置文档、Bean 注册表、生命周期事件总线与驱动注册表。
//! 不存在全局实例：上下文由启动入口显式创建，以引用或 `Arc` 传递。

pub mod bootstrap;
pub mod web;

use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::{ConfigSection, ConfigurationCache, ConfigurationDocument};
use crate::datasource::{Driver, DriverRegistry};
use crate::errors::ContextError;
use crate::infrastructure::{
    BeanRegistry, EventBus, LifecyclePhase, Module, ModuleManager, Phase, SubscriptionId,
};
use crate::logging::OperationTimer;

pub use bootstrap::{Application, StartOptions};
pub use web::{WebContext, WebEvent, WebHandler, WebRoot};

/// 生命周期处理函数
pub type LifecycleHandler = dyn Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync;

/// 生命周期事件：阶段、上下文与本次涉及的模块
pub struct LifecycleEvent<'a> {
    pub phase: Phase,
    pub context: &'a ApplicationContext,
    pub modules: &'a [String],
}

/// 上下文生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Loading,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Loading)
                | (Loading, Running)
                | (Initializing, Stopping)
                | (Loading, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 应用上下文
pub struct ApplicationContext {
    config: Arc<ConfigurationDocument>,
    beans: BeanRegistry,
    events: EventBus<Phase, LifecycleHandler>,
    drivers: DriverRegistry,
    modules: ModuleManager,
    state: RwLock<LifecycleState>,
}

impl ApplicationContext {
    pub fn new(config: Arc<ConfigurationDocument>) -> Self {
        Self {
            config,
            beans: BeanRegistry::new(),
            events: EventBus::new(),
            drivers: DriverRegistry::new(),
            modules: ModuleManager::new(),
            state: RwLock::new(LifecycleState::Uninitialized),
        }
    }

    /// 通过配置缓存加载配置并创建上下文
    pub fn load(path: impl AsRef<Path>, cache: &ConfigurationCache) -> Result<Self, ContextError> {
        let config = cache.load(path)?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &Arc<ConfigurationDocument> {
        &self.config
    }

    /// 解析 `${a.b.c:default}` 表达式
    pub fn value(&self, expr: &str) -> String {
        self.config.value(expr)
    }

    // ---- Bean ----

    pub fn beans(&self) -> &BeanRegistry {
        &self.beans
    }

    pub fn register_bean<T>(&self, key: impl Into<String>, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.beans.register(key, instance);
    }

    pub fn register_type<T>(&self, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.beans.register_type(instance);
    }

    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        self.beans.resolve(key)
    }

    pub fn resolve_type<T>(&self) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        self.beans.resolve_type()
    }

    pub fn contains_bean(&self, key: &str) -> bool {
        self.beans.contains(key)
    }

    /// 以配置节初始化组件
    ///
    /// 配置节存在时调用一次 `initializer` 并返回其结果；
    /// 不存在时记录警告并返回 `Ok(None)`。
    pub fn bind_section<R, F>(&self, prefix: &str, initializer: F) -> Result<Option<R>, ContextError>
    where
        F: FnOnce(&ConfigSection) -> anyhow::Result<R>,
    {
        let Some(section) = self.config.get_config(prefix) else {
            tracing::warn!(prefix = prefix, "配置节不存在，跳过初始化");
            return Ok(None);
        };

        initializer(&section)
            .map(Some)
            .map_err(|source| ContextError::Section {
                prefix: prefix.to_string(),
                source,
            })
    }

    // ---- 驱动 ----

    pub fn register_driver(&self, driver: Arc<dyn Driver>) {
        self.drivers.register(driver);
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    // ---- 事件 ----

    pub fn events(&self) -> &EventBus<Phase, LifecycleHandler> {
        &self.events
    }

    pub fn on<F>(&self, phase: Phase, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(phase, Arc::new(handler))
    }

    pub fn on_init<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(Phase::Init, handler)
    }

    pub fn on_loaded<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(Phase::Loaded, handler)
    }

    pub fn on_started<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(Phase::Started, handler)
    }

    pub fn on_exit<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(Phase::Exit, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// 触发阶段，不改变生命周期状态
    pub fn emit(&self, phase: Phase, modules: &[String]) -> Result<usize, ContextError> {
        let event = LifecycleEvent {
            phase,
            context: self,
            modules,
        };
        self.events.emit_with(phase, |handler| handler(&event))
    }

    /// 按名称触发；未知名称被忽略并返回 false
    pub fn emit_named(&self, name: &str, modules: &[String]) -> Result<bool, ContextError> {
        self.events
            .emit_named_with(name, |phase, handler| {
                handler(&LifecycleEvent {
                    phase,
                    context: self,
                    modules,
                })
            })
            .map(|invoked| invoked.is_some())
    }

    // ---- 生命周期 ----

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    fn transition(&self, next: LifecycleState) -> Result<(), ContextError> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(ContextError::InvalidLifecycle {
                from: state.to_string(),
                to: next.to_string(),
            });
        }
        let previous = *state;
        tracing::debug!(from = %previous, to = %next, "生命周期状态切换");
        *state = next;
        Ok(())
    }

    /// 注册内部模块并触发 `init`
    pub fn initialize(&self, internal: Vec<Arc<dyn Module>>) -> Result<Vec<String>, ContextError> {
        self.transition(LifecycleState::Initializing)?;
        let timer = OperationTimer::new("context.initialize");
        let names = self.modules.register_all(self, internal)?;
        self.emit(Phase::Init, &names)?;
        timer.with_metadata("modules", &names.len().to_string()).finish();
        Ok(names)
    }

    /// 注册应用模块并触发 `loaded`
    pub fn load_modules(&self, modules: Vec<Arc<dyn Module>>) -> Result<Vec<String>, ContextError> {
        self.transition(LifecycleState::Loading)?;
        let timer = OperationTimer::new("context.load_modules");
        let names = self.modules.register_all(self, modules)?;
        self.emit(Phase::Loaded, &names)?;
        timer.with_metadata("modules", &names.len().to_string()).finish();
        tracing::info!(modules = ?names, "应用模块已加载");
        Ok(names)
    }

    /// 触发 `started`
    pub fn start(&self) -> Result<(), ContextError> {
        self.transition(LifecycleState::Running)?;
        let modules = self.modules.registered_modules();
        self.emit(Phase::Started, &modules)?;
        Ok(())
    }

    /// 触发 `exit`、卸载模块并清空处理函数
    ///
    /// `exit` 处理函数失败时仍会完成清理，错误在最后返回。
    pub fn shutdown(&self) -> Result<(), ContextError> {
        self.transition(LifecycleState::Stopping)?;
        let modules = self.modules.registered_modules();
        let result = self.emit(Phase::Exit, &modules);
        if let Err(e) = &result {
            tracing::error!(error = %e, phase = Phase::Exit.name(), "退出处理函数失败，继续清理");
        }

        self.modules.unload_all(self);
        self.events.clear();
        self.transition(LifecycleState::Stopped)?;
        tracing::info!("应用上下文已停止");
        result.map(|_| ())
    }
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("source", &self.config.source())
            .field("state", &self.state())
            .field("beans", &self.beans)
            .finish()
    }
}
