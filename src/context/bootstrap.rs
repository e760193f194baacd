//! 启动入口
//!
//! [`Application`] 持有进程内唯一的应用上下文与 Web 上下文，
//! 按固定顺序驱动生命周期：内部模块 → `init` → 应用模块 → `loaded`
//! → Web `loaded`；之后由调用方触发 `started` 与关闭。

use std::path::PathBuf;
use std::sync::Arc;

use super::web::{WebContext, WebEvent, WebHandler, WebRoot};
use super::{ApplicationContext, LifecycleEvent, LifecycleHandler, LifecycleState};
use crate::config::ConfigurationCache;
use crate::datasource::{DataSourceModule, Driver};
use crate::errors::ContextError;
use crate::infrastructure::{
    Module, ModuleCatalog, Phase, ScanPath, WebPhase, INTERNAL_NAMESPACE,
};
use crate::logging::OperationTimer;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "conf/application.yaml";
/// 默认应用模块扫描路径
pub const DEFAULT_SCAN_PATH: &str = "dataflow.application";

/// 启动参数
#[derive(Clone)]
pub struct StartOptions {
    pub config_path: PathBuf,
    pub scan: String,
    pub web_root: Option<WebRoot>,
}

impl StartOptions {
    pub fn new(config_path: impl Into<PathBuf>, scan: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
            scan: scan.into(),
            web_root: None,
        }
    }

    pub fn with_web_root(mut self, root: WebRoot) -> Self {
        self.web_root = Some(root);
        self
    }
}

impl Default for StartOptions {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH, DEFAULT_SCAN_PATH)
    }
}

impl std::fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartOptions")
            .field("config_path", &self.config_path)
            .field("scan", &self.scan)
            .field("web_root", &self.web_root.is_some())
            .finish()
    }
}

/// 应用
pub struct Application {
    cache: Arc<ConfigurationCache>,
    catalog: ModuleCatalog,
    drivers: Vec<Arc<dyn Driver>>,
    listeners: Vec<(Phase, Arc<LifecycleHandler>)>,
    web_listeners: Vec<(WebPhase, Arc<WebHandler>)>,
    context: Option<Arc<ApplicationContext>>,
    web: Option<Arc<WebContext>>,
}

impl Application {
    /// 使用进程级配置缓存，并登记内置模块
    pub fn new() -> Self {
        Self::with_cache(ConfigurationCache::global())
    }

    pub fn with_cache(cache: Arc<ConfigurationCache>) -> Self {
        let catalog = ModuleCatalog::new().with(DataSourceModule);
        Self {
            cache,
            catalog,
            drivers: Vec::new(),
            listeners: Vec::new(),
            web_listeners: Vec::new(),
            context: None,
            web: None,
        }
    }

    /// 登记模块
    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.catalog.add(Arc::new(module));
        self
    }

    pub fn catalog_mut(&mut self) -> &mut ModuleCatalog {
        &mut self.catalog
    }

    /// 登记数据库驱动，上下文创建时注册
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// 预先订阅生命周期事件，上下文创建时挂载
    pub fn listener<F>(mut self, phase: Phase, handler: F) -> Self
    where
        F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.push((phase, Arc::new(handler)));
        self
    }

    pub fn web_listener<F>(mut self, phase: WebPhase, handler: F) -> Self
    where
        F: Fn(&WebEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.web_listeners.push((phase, Arc::new(handler)));
        self
    }

    /// 启动应用上下文
    ///
    /// 重复调用只记录警告，返回已存在的上下文。
    /// 任一模块注册失败则启动失败，不保留部分启动的上下文。
    pub fn start(&mut self, options: StartOptions) -> Result<Arc<ApplicationContext>, ContextError> {
        let timer = OperationTimer::new("application.start")
            .with_metadata("config", &options.config_path.to_string_lossy())
            .with_metadata("scan", &options.scan);

        let web = match &self.web {
            Some(web) => web.clone(),
            None => {
                let web = Arc::new(WebContext::new(options.web_root.clone()));
                for (phase, handler) in &self.web_listeners {
                    web.events().subscribe(*phase, handler.clone());
                }
                self.web = Some(web.clone());
                web
            }
        };

        let context = match &self.context {
            Some(context) => {
                tracing::warn!("应用上下文已经启动，忽略重复启动");
                context.clone()
            }
            None => {
                let context = Arc::new(self.create_context(&options)?);
                self.context = Some(context.clone());
                context
            }
        };

        web.emit(WebPhase::Loaded)?;
        timer.finish();
        Ok(context)
    }

    fn create_context(&self, options: &StartOptions) -> Result<ApplicationContext, ContextError> {
        let context = ApplicationContext::load(&options.config_path, &self.cache)?;
        for driver in &self.drivers {
            context.register_driver(driver.clone());
        }
        for (phase, handler) in &self.listeners {
            context.events().subscribe(*phase, handler.clone());
        }

        if let Err(e) = self.register_modules(&context, options) {
            tracing::error!(error = %e, "应用上下文启动失败");
            if let Err(cleanup) = context.shutdown() {
                tracing::warn!(error = %cleanup, "启动失败后的清理出错");
            }
            return Err(e);
        }

        tracing::info!(config = %options.config_path.display(), "应用上下文启动完成");
        Ok(context)
    }

    fn register_modules(&self, context: &ApplicationContext, options: &StartOptions) -> Result<(), ContextError> {
        let internal_scan = ScanPath::Recursive(INTERNAL_NAMESPACE.to_string());
        let internal_names = context.initialize(self.catalog.scan(&internal_scan))?;
        tracing::info!(modules = ?internal_names, "内部模块已注册");

        let scan = ScanPath::parse(&options.scan);
        let application = self
            .catalog
            .scan(&scan)
            .into_iter()
            .filter(|module| !internal_scan.matches(module.name()))
            .collect();
        context.load_modules(application)?;
        Ok(())
    }

    /// 触发 `started`，先 Web 上下文后应用上下文
    ///
    /// Web 处理函数失败时应用上下文停留在 `Loading`。
    pub fn started(&self) -> Result<(), ContextError> {
        let context = self.require_context()?;
        if let Some(web) = &self.web {
            web.emit(WebPhase::Started)?;
        }
        context.start()
    }

    /// 关闭应用：触发 `exit`、关闭数据源、清空处理函数
    pub fn shutdown(&mut self) -> Result<(), ContextError> {
        if let Some(web) = &self.web {
            web.clear();
        }
        let Some(context) = &self.context else {
            return Ok(());
        };
        if context.state() == LifecycleState::Stopped {
            return Ok(());
        }
        context.shutdown()
    }

    pub fn context(&self) -> Option<Arc<ApplicationContext>> {
        self.context.clone()
    }

    pub fn web_context(&self) -> Option<Arc<WebContext>> {
        self.web.clone()
    }

    fn require_context(&self) -> Result<Arc<ApplicationContext>, ContextError> {
        self.context.clone().ok_or_else(|| ContextError::InvalidLifecycle {
            from: LifecycleState::Uninitialized.to_string(),
            to: LifecycleState::Running.to_string(),
        })
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}
