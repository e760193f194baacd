use thiserror::Error;

/// 框架统一错误类型
#[allow(unused)]
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("DataSource error: {0}")]
    DataSource(#[from] DataSourceError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Application error: {0}")]
    Generic(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("Failed to parse YAML from file '{0}': {1}")]
    YamlParse(String, #[source] serde_yaml::Error),
    #[error("Failed to parse TOML from file '{0}': {1}")]
    TomlParse(String, #[source] toml::de::Error),
    #[error("Failed to bind configuration section '{0}': {1}")]
    Bind(String, String),
    #[error("Required configuration field '{0}' is missing or invalid")]
    FieldMissing(String),
    #[error("Other Config Error: {0}")]
    Other(String),
}

/// 容器与生命周期错误
#[derive(Debug, Error)]
pub enum ContextError {
    /// Bean 未注册；解析没有默认值
    #[error("Bean '{0}' is not registered")]
    BeanNotFound(String),
    #[error("Bean '{key}' is not of type {expected}")]
    BeanTypeMismatch { key: String, expected: &'static str },
    #[error("Illegal lifecycle transition from {from} to {to}")]
    InvalidLifecycle { from: String, to: String },
    /// 事件处理函数失败，剩余处理函数不会再执行
    #[error("Handler for '{phase}' failed: {source}")]
    Handler {
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("Startup failed in module '{module}': {source}")]
    Startup {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Initializer for configuration section '{prefix}' failed: {source}")]
    Section {
        prefix: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Module dependency '{dependency}' of '{module}' cannot be resolved")]
    ModuleDependency { module: String, dependency: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("No driver registered for url '{0}'")]
    NoDriver(String),
    #[error("Invalid datasource configuration '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
    #[error("Failed to connect to '{url}': {reason}")]
    Connect { url: String, reason: String },
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(std::time::Duration),
    #[error("Connection pool '{0}' is closed")]
    PoolClosed(String),
    #[error("Statement failed: {0}")]
    Statement(String),
    #[error("Session error: {0}")]
    Session(String),
}

/// 事务错误：传播规则违例是立即失败、不可重试的
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No existing transaction found for transaction marked with propagation 'MANDATORY'")]
    NoTransaction,
    #[error("Existing transaction found for transaction marked with propagation 'NEVER'")]
    TransactionPresent,
    #[error("Transaction manager '{0}' is not registered")]
    ManagerNotFound(String),
    #[error("No session bound to the current transaction scope")]
    NoSession,
    #[error("Transaction scope used outside the thread that opened it")]
    ForeignThread,
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: AppError = TransactionError::NoTransaction.into();
        assert!(matches!(err, AppError::Transaction(TransactionError::NoTransaction)));

        let err: ContextError = DataSourceError::PoolClosed("ds".into()).into();
        assert_eq!(err.to_string(), "Connection pool 'ds' is closed");
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let err = ContextError::Handler {
            phase: "loaded",
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "Handler for 'loaded' failed: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
