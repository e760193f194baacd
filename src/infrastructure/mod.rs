//! 基础设施层
//!
//! 提供上下文依赖的通用机制，包括：
//! - Bean 注册表
//! - 生命周期事件总线
//! - 模块目录与注册

// 容器实现
pub mod container;
pub mod event;
pub mod module;

// 重新导出API
pub use container::{Bean, BeanRegistry, RegistryStats};
pub use event::{EventBus, LifecyclePhase, Phase, SubscriptionId, WebPhase};
pub use module::{Module, ModuleCatalog, ModuleManager, ModuleStatus, ScanPath, INTERNAL_NAMESPACE};
