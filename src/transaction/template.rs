//! 基于应用上下文的声明式事务入口

use std::error::Error;

use super::definition::TransactionDefinition;
use super::manager::{TransactionScope, TransactionalManager};
use super::DEFAULT_TRANSACTION_MANAGER;
use crate::context::ApplicationContext;
use crate::errors::TransactionError;

/// 使用默认事务管理器执行代码块
pub fn tx<T, E, F>(context: &ApplicationContext, definition: &TransactionDefinition, body: F) -> Result<T, E>
where
    F: FnOnce(&TransactionScope<'_>) -> Result<T, E>,
    E: Error + From<TransactionError> + 'static,
{
    tx_with(context, DEFAULT_TRANSACTION_MANAGER, definition, body)
}

/// 使用指定名称的事务管理器执行代码块
pub fn tx_with<T, E, F>(
    context: &ApplicationContext,
    manager: &str,
    definition: &TransactionDefinition,
    body: F,
) -> Result<T, E>
where
    F: FnOnce(&TransactionScope<'_>) -> Result<T, E>,
    E: Error + From<TransactionError> + 'static,
{
    let manager = context
        .resolve::<TransactionalManager>(manager)
        .map_err(|_| TransactionError::ManagerNotFound(manager.to_string()))?;
    manager.transactional(definition, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationDocument;
    use crate::datasource::{DataSourceContext, MemoryDriver};
    use crate::transaction::Propagation;
    use std::sync::Arc;

    #[test]
    fn test_missing_manager() {
        let document = ConfigurationDocument::from_yaml_str("empty.yaml", "app: {}\n").unwrap();
        let ctx = ApplicationContext::new(Arc::new(document));

        let result = tx(&ctx, &TransactionDefinition::default(), |_| Ok::<_, TransactionError>(()));
        assert!(matches!(result, Err(TransactionError::ManagerNotFound(name)) if name == DEFAULT_TRANSACTION_MANAGER));
    }

    #[test]
    fn test_commits_through_context() {
        let yaml = "context:\n  database:\n    url: mem://app\n";
        let document = ConfigurationDocument::from_yaml_str("app.yaml", yaml).unwrap();
        let ctx = ApplicationContext::new(Arc::new(document));
        let driver = MemoryDriver::new();
        let journal = driver.journal();
        ctx.register_driver(Arc::new(driver));
        DataSourceContext::initialize(&ctx).unwrap();

        let definition = TransactionDefinition::new(Propagation::Required);
        let rows = tx(&ctx, &definition, |scope| scope.execute("insert into t values (1)")).unwrap();

        assert_eq!(rows, 1);
        assert_eq!(journal.committed(), vec!["insert into t values (1)".to_string()]);
    }
}
