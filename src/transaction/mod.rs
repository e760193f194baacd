//! 事务
//!
//! 传播行为与回滚规则在 [`definition`]，按线程维护事务帧的
//! [`TransactionalManager`] 在 [`manager`]，从上下文取管理器的便捷入口在 [`template`]。

pub mod definition;
pub mod manager;
pub mod template;

pub use definition::{Propagation, RollbackRule, TransactionDefinition};
pub use manager::{TransactionScope, TransactionStats, TransactionalManager};
pub use template::{tx, tx_with};

/// 默认事务管理器的注册名
pub const DEFAULT_TRANSACTION_MANAGER: &str = "transactionManager";
