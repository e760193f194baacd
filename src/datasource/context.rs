//! 配置驱动的数据源初始化
//!
//! 读取 `context.database`：
//!
//! ```yaml
//! context:
//!   database:
//!     primary:
//!       url: postgresql://localhost/app
//!       pool_size: 10
//!     report:
//!       url: mysql://localhost/report
//! ```
//!
//! 每个映射条目创建一个连接池并以其键注册，第一个同时注册为 `ds`；
//! 没有映射条目但带 `url` 时整个配置节就是 `ds`。随后以默认数据源
//! 创建唯一的事务管理器 `transactionManager`。

use std::sync::Arc;

use super::settings::DataSourceSettings;
use super::{DataSource, PooledDataSource, DATASOURCE_PREFIX, DEFAULT_DATASOURCE};
use crate::config::ConfigSection;
use crate::context::ApplicationContext;
use crate::errors::{ContextError, DataSourceError};
use crate::infrastructure::Module;
use crate::transaction::{TransactionalManager, DEFAULT_TRANSACTION_MANAGER};

/// 数据源内部模块
#[derive(Debug, Default, Clone, Copy)]
pub struct DataSourceModule;

impl Module for DataSourceModule {
    fn name(&self) -> &str {
        "dataflow.module.context.datasource"
    }

    fn register(&self, context: &ApplicationContext) -> anyhow::Result<()> {
        DataSourceContext::initialize(context)?;
        Ok(())
    }

    /// 上下文关闭时无论 `exit` 处理函数是否成功都会调用
    fn unload(&self, context: &ApplicationContext) -> anyhow::Result<()> {
        DataSourceContext::close_all(context);
        Ok(())
    }
}

pub struct DataSourceContext;

impl DataSourceContext {
    /// 初始化全部数据源，返回注册的数据源名称
    pub fn initialize(context: &ApplicationContext) -> Result<Vec<String>, ContextError> {
        let names = context.bind_section(DATASOURCE_PREFIX, |section| {
            Ok(Self::configure(context, section)?)
        })?;

        match names {
            Some(names) => Ok(names),
            None => {
                tracing::info!(prefix = DATASOURCE_PREFIX, "未配置数据源");
                Ok(Vec::new())
            }
        }
    }

    fn configure(context: &ApplicationContext, section: &ConfigSection) -> Result<Vec<String>, DataSourceError> {
        let mut entries: Vec<(String, ConfigSection)> = section
            .entries()
            .into_iter()
            .filter(|(_, entry)| entry.is_mapping())
            .collect();

        if entries.is_empty() {
            if !section.contains("url") {
                tracing::warn!(prefix = DATASOURCE_PREFIX, "数据源配置节中没有可用的条目");
                return Ok(Vec::new());
            }
            entries.push((DEFAULT_DATASOURCE.to_string(), section.clone()));
        }

        let mut created: Vec<(String, Arc<PooledDataSource>)> = Vec::new();
        for (name, entry) in entries {
            match Self::create(context, &name, &entry) {
                Ok(datasource) => created.push((name, datasource)),
                Err(e) => {
                    for (_, datasource) in &created {
                        datasource.close();
                    }
                    return Err(e);
                }
            }
        }

        let mut names = Vec::with_capacity(created.len());
        for (name, datasource) in &created {
            context.register_bean(name.clone(), datasource.clone());
            names.push(name.clone());
        }

        if let Some((name, default)) = created.first() {
            context.register_bean(DEFAULT_DATASOURCE, default.clone());
            let datasource: Arc<dyn DataSource> = default.clone();
            let manager = TransactionalManager::new(DEFAULT_TRANSACTION_MANAGER, datasource);
            context.register_bean(DEFAULT_TRANSACTION_MANAGER, Arc::new(manager));
            tracing::info!(default = %name, datasources = ?names, "数据源初始化完成");
        }

        Ok(names)
    }

    fn create(
        context: &ApplicationContext,
        name: &str,
        section: &ConfigSection,
    ) -> Result<Arc<PooledDataSource>, DataSourceError> {
        let settings = DataSourceSettings::from_section(name, section)?;
        let driver = context.drivers().find(&settings.url)?;
        Ok(Arc::new(PooledDataSource::connect(&settings, driver)?))
    }

    /// 按名称获取数据源；名称为空时返回默认数据源
    pub fn get_ds(context: &ApplicationContext, name: Option<&str>) -> Result<Arc<PooledDataSource>, ContextError> {
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DATASOURCE);
        context.resolve::<PooledDataSource>(name)
    }

    pub fn transaction_manager(context: &ApplicationContext) -> Result<Arc<TransactionalManager>, ContextError> {
        context.resolve::<TransactionalManager>(DEFAULT_TRANSACTION_MANAGER)
    }

    /// 关闭上下文中的所有连接池
    pub fn close_all(context: &ApplicationContext) {
        for (name, datasource) in context.beans().beans_of_type::<PooledDataSource>() {
            if !datasource.is_closed() {
                tracing::debug!(datasource = %name, "关闭数据源");
                datasource.close();
            }
        }
    }
}
