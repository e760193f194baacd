//! 数据源层
//!
//! 定义驱动、连接、会话与数据源的契约，并提供带连接池的参考实现。
//! 具体数据库驱动通过 [`Driver`] 接入，按 URL scheme 选择。

pub mod context;
pub mod dialect;
pub mod memory;
pub mod pool;
pub mod settings;

use parking_lot::RwLock;
use std::sync::Arc;

use crate::errors::DataSourceError;

pub use context::{DataSourceContext, DataSourceModule};
pub use dialect::{Dialect, Pagination};
pub use memory::{JournalEntry, MemoryDriver, MemoryJournal};
pub use pool::{PoolStatus, PooledDataSource};
pub use settings::{DataSourceSettings, PoolSettings};

/// 默认数据源的 Bean 键
pub const DEFAULT_DATASOURCE: &str = "ds";
/// 数据源配置节前缀
pub const DATASOURCE_PREFIX: &str = "context.database";

/// 物理连接
pub trait Connection: Send {
    fn begin(&mut self) -> Result<(), DataSourceError>;
    fn commit(&mut self) -> Result<(), DataSourceError>;
    fn rollback(&mut self) -> Result<(), DataSourceError>;

    /// 执行语句，返回影响行数
    fn execute(&mut self, sql: &str) -> Result<u64, DataSourceError>;

    /// 连接是否仍然可用
    fn ping(&mut self) -> bool {
        true
    }

    fn close(&mut self) {}
}

/// 数据库驱动
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// 是否接受该 URL scheme（已去掉 `+` 后的方言后缀）
    fn accepts(&self, scheme: &str) -> bool;

    fn connect(&self, url: &str) -> Result<Box<dyn Connection>, DataSourceError>;
}

/// 数据库会话
///
/// 会话在释放（drop）时归还底层连接；仍处于事务中的会话先回滚。
pub trait Session: Send {
    fn begin(&mut self) -> Result<(), DataSourceError>;
    fn commit(&mut self) -> Result<(), DataSourceError>;
    fn rollback(&mut self) -> Result<(), DataSourceError>;
    fn in_transaction(&self) -> bool;
    fn execute(&mut self, sql: &str) -> Result<u64, DataSourceError>;
}

/// 数据源
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;
    fn dialect(&self) -> Dialect;
    fn open_session(&self) -> Result<Box<dyn Session>, DataSourceError>;
    fn close(&self);
}

/// URL 中的 scheme，去掉 `+driver` 后缀并转为小写
pub fn url_scheme(url: &str) -> Option<String> {
    let (scheme, _) = url.split_once("://")?;
    let scheme = scheme.split('+').next().unwrap_or(scheme).trim();
    if scheme.is_empty() {
        None
    } else {
        Some(scheme.to_ascii_lowercase())
    }
}

/// 驱动注册表，按注册顺序匹配 scheme
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, driver: Arc<dyn Driver>) {
        tracing::debug!(driver = driver.name(), "注册数据库驱动");
        self.drivers.write().push(driver);
    }

    pub fn find(&self, url: &str) -> Result<Arc<dyn Driver>, DataSourceError> {
        let scheme = url_scheme(url).ok_or_else(|| DataSourceError::NoDriver(url.to_string()))?;
        self.drivers
            .read()
            .iter()
            .find(|driver| driver.accepts(&scheme))
            .cloned()
            .ok_or_else(|| DataSourceError::NoDriver(settings::mask_password(url)))
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }
}
