pub mod config;
pub mod context;
pub mod datasource;
pub mod errors;
pub mod infrastructure;
pub mod logging;
pub mod transaction;

// Re-export commonly used items for convenience
pub use config::{ConfigSection, ConfigurationCache, ConfigurationDocument};
pub use context::{Application, ApplicationContext, StartOptions, WebContext};
pub use datasource::{DataSource, DataSourceContext, Driver, MemoryDriver, PooledDataSource};
pub use errors::{AppError, ContextError, DataSourceError, TransactionError};
pub use infrastructure::{BeanRegistry, Module, Phase, WebPhase};
pub use transaction::{tx, Propagation, TransactionDefinition, TransactionalManager};
