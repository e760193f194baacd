//! 模块抽象层
//!
//! 模块以点分标识（如 `dataflow.module.context.datasource`）登记在
//! [`ModuleCatalog`] 中，启动时按扫描路径挑选、按依赖顺序注册到上下文。

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::context::ApplicationContext;
use crate::errors::ContextError;

/// 框架内部模块的命名空间
pub const INTERNAL_NAMESPACE: &str = "dataflow.module";

/// 模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// 未初始化
    NotInitialized,
    /// 初始化中
    Initializing,
    /// 已初始化
    Initialized,
    /// 初始化失败
    Failed,
    /// 已卸载
    Unloaded,
}

/// 模块接口
pub trait Module: Send + Sync {
    /// 模块标识，点分形式
    fn name(&self) -> &str;

    /// 依赖的模块
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }

    /// 检查模块是否可用
    fn is_enabled(&self) -> bool {
        true
    }

    /// 向上下文注册 Bean 与事件处理函数
    fn register(&self, context: &ApplicationContext) -> anyhow::Result<()>;

    /// 卸载模块
    fn unload(&self, _context: &ApplicationContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 模块扫描路径
///
/// - `pkg` 或 `pkg.*`：只匹配 `pkg` 包下的直接模块
/// - `pkg.**`：匹配 `pkg` 本身及其所有子孙模块
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPath {
    Package(String),
    Recursive(String),
}

impl ScanPath {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if let Some(package) = pattern.strip_suffix(".**") {
            ScanPath::Recursive(package.to_string())
        } else if let Some(package) = pattern.strip_suffix(".*") {
            ScanPath::Package(package.to_string())
        } else {
            ScanPath::Package(pattern.to_string())
        }
    }

    pub fn package(&self) -> &str {
        match self {
            ScanPath::Package(package) | ScanPath::Recursive(package) => package,
        }
    }

    pub fn matches(&self, module: &str) -> bool {
        match self {
            ScanPath::Package(package) => module
                .rsplit_once('.')
                .map(|(parent, _)| parent == package)
                .unwrap_or(false),
            ScanPath::Recursive(package) => {
                module == package
                    || (module.starts_with(package.as_str())
                        && module[package.len()..].starts_with('.'))
            }
        }
    }
}

impl fmt::Display for ScanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPath::Package(package) => write!(f, "{}.*", package),
            ScanPath::Recursive(package) => write!(f, "{}.**", package),
        }
    }
}

/// 模块目录：显式登记，取代导入副作用
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    modules: Vec<Arc<dyn Module>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记模块；同名模块只保留第一个
    pub fn add(&mut self, module: Arc<dyn Module>) -> &mut Self {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            tracing::warn!(module = module.name(), "模块重复登记，忽略");
        } else {
            self.modules.push(module);
        }
        self
    }

    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.add(Arc::new(module));
        self
    }

    /// 按扫描路径挑选模块，保持登记顺序
    pub fn scan(&self, path: &ScanPath) -> Vec<Arc<dyn Module>> {
        self.modules
            .iter()
            .filter(|module| path.matches(module.name()))
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("modules", &self.names())
            .finish()
    }
}

/// 模块管理器
///
/// 跟踪已注册模块的状态，卸载时按注册的逆序进行。
#[derive(Default)]
pub struct ModuleManager {
    registered: RwLock<Vec<Arc<dyn Module>>>,
    status: RwLock<HashMap<String, ModuleStatus>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按依赖顺序注册一批模块，返回实际注册的模块标识
    ///
    /// 依赖既可以在本批次内，也可以是之前已初始化的模块。
    /// 任一模块失败即中止，不做部分回滚。
    pub fn register_all(
        &self,
        context: &ApplicationContext,
        modules: Vec<Arc<dyn Module>>,
    ) -> Result<Vec<String>, ContextError> {
        let batch: HashSet<String> = modules.iter().map(|m| m.name().to_string()).collect();
        for module in &modules {
            for dependency in module.dependencies() {
                if !batch.contains(dependency) && !self.is_initialized(dependency) {
                    return Err(ContextError::ModuleDependency {
                        module: module.name().to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }

        let mut pending = modules;
        let mut names = Vec::new();
        while !pending.is_empty() {
            let ready = pending.iter().position(|module| {
                module
                    .dependencies()
                    .iter()
                    .all(|dependency| self.is_initialized(dependency))
            });

            let Some(index) = ready else {
                let module = &pending[0];
                let dependency = module
                    .dependencies()
                    .iter()
                    .find(|dependency| !self.is_initialized(dependency))
                    .map(|dependency| dependency.to_string())
                    .unwrap_or_default();
                return Err(ContextError::ModuleDependency {
                    module: module.name().to_string(),
                    dependency,
                });
            };

            let module = pending.remove(index);
            if self.initialize_module(context, &module)? {
                names.push(module.name().to_string());
            }
        }

        Ok(names)
    }

    /// 初始化特定模块；未启用的模块视为已初始化但不执行注册
    fn initialize_module(
        &self,
        context: &ApplicationContext,
        module: &Arc<dyn Module>,
    ) -> Result<bool, ContextError> {
        let module_name = module.name().to_string();
        if self.is_initialized(&module_name) {
            tracing::debug!(module = %module_name, "模块已注册，跳过");
            return Ok(false);
        }

        if !module.is_enabled() {
            tracing::info!(module = %module_name, "模块未启用，跳过");
            self.set_status(&module_name, ModuleStatus::Initialized);
            return Ok(false);
        }

        self.set_status(&module_name, ModuleStatus::Initializing);
        match module.register(context) {
            Ok(()) => {
                self.set_status(&module_name, ModuleStatus::Initialized);
                self.registered.write().push(module.clone());
                tracing::debug!(module = %module_name, "模块注册完成");
                Ok(true)
            }
            Err(source) => {
                self.set_status(&module_name, ModuleStatus::Failed);
                tracing::error!(module = %module_name, error = %source, "模块注册失败");
                Err(ContextError::Startup {
                    module: module_name,
                    source,
                })
            }
        }
    }

    /// 卸载所有模块，按注册的逆序；单个模块失败只记录日志
    pub fn unload_all(&self, context: &ApplicationContext) {
        let modules: Vec<Arc<dyn Module>> = self.registered.write().drain(..).rev().collect();
        for module in modules {
            if let Err(e) = module.unload(context) {
                tracing::warn!(module = module.name(), error = %e, "模块卸载失败");
            }
            self.set_status(module.name(), ModuleStatus::Unloaded);
        }
    }

    fn set_status(&self, name: &str, status: ModuleStatus) {
        self.status.write().insert(name.to_string(), status);
    }

    fn is_initialized(&self, name: &str) -> bool {
        self.get_module_status(name) == Some(ModuleStatus::Initialized)
    }

    /// 获取模块状态
    pub fn get_module_status(&self, module_name: &str) -> Option<ModuleStatus> {
        self.status.read().get(module_name).copied()
    }

    /// 获取已注册的模块，按注册顺序
    pub fn registered_modules(&self) -> Vec<String> {
        self.registered
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }
}
