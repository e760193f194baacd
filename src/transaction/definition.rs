use std::any::type_name;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// 事务传播行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// 加入当前事务，没有则新建
    #[default]
    Required,
    /// 挂起当前事务，总是新建
    RequiresNew,
    /// 有事务则加入，没有则以非事务方式执行
    Supports,
    /// 必须在已有事务中执行
    Mandatory,
    /// 不能在事务中执行
    Never,
    /// 以非事务方式执行，已有事务先回滚
    NotSupported,
}

impl Propagation {
    pub const ALL: [Propagation; 6] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Supports,
        Propagation::Mandatory,
        Propagation::Never,
        Propagation::NotSupported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Never => "NEVER",
            Propagation::NotSupported => "NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Propagation::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("unknown propagation '{}'", s))
    }
}

/// 回滚规则：按错误类型匹配，检查错误本身及其 `source()` 链
#[derive(Clone, Copy)]
pub struct RollbackRule {
    name: &'static str,
    matcher: fn(&(dyn Error + 'static)) -> bool,
}

impl RollbackRule {
    pub fn of<E: Error + 'static>() -> Self {
        Self {
            name: type_name::<E>(),
            matcher: |error| error.is::<E>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, error: &(dyn Error + 'static)) -> bool {
        let mut current = Some(error);
        while let Some(error) = current {
            if (self.matcher)(error) {
                return true;
            }
            current = error.source();
        }
        false
    }
}

impl fmt::Debug for RollbackRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RollbackRule").field(&self.name).finish()
    }
}

/// 声明式事务定义
#[derive(Debug, Clone, Default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub read_only: bool,
    pub rollback_for: Vec<RollbackRule>,
    pub no_rollback_for: Vec<RollbackRule>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// 声明需要回滚的错误类型
    ///
    /// 任何错误默认都会回滚，这里的规则不改变结果，只在日志中标明命中的规则。
    /// 要让某类错误提交，使用 [`Self::no_rollback_for`]。
    pub fn rollback_for<E: Error + 'static>(mut self) -> Self {
        self.rollback_for.push(RollbackRule::of::<E>());
        self
    }

    pub fn no_rollback_for<E: Error + 'static>(mut self) -> Self {
        self.no_rollback_for.push(RollbackRule::of::<E>());
        self
    }

    /// 错误是否需要回滚
    ///
    /// 命中 `no_rollback_for` 时提交，其余错误一律回滚。
    pub fn should_rollback(&self, error: &(dyn Error + 'static)) -> bool {
        if let Some(rule) = self.no_rollback_for.iter().find(|rule| rule.matches(error)) {
            tracing::debug!(rule = rule.name(), "命中 no_rollback_for，提交事务");
            return false;
        }
        match self.rollback_for.iter().find(|rule| rule.matches(error)) {
            Some(rule) => tracing::debug!(rule = rule.name(), "命中 rollback_for，回滚事务"),
            None => tracing::debug!(error = %error, "未命中回滚规则，按默认回滚"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("validation failed")]
    struct ValidationError;

    #[derive(Debug, Error)]
    #[error("io failed")]
    struct IoFailure;

    #[derive(Debug, Error)]
    enum ServiceError {
        #[error("validation: {0}")]
        Validation(#[from] ValidationError),
        #[error("io: {0}")]
        Io(#[from] IoFailure),
    }

    #[test]
    fn test_propagation_parse() {
        assert_eq!("requires_new".parse::<Propagation>(), Ok(Propagation::RequiresNew));
        assert_eq!("NOT-SUPPORTED".parse::<Propagation>(), Ok(Propagation::NotSupported));
        assert!("sometimes".parse::<Propagation>().is_err());
        assert_eq!(Propagation::default(), Propagation::Required);
    }

    #[test]
    fn test_rule_matches_source_chain() {
        let rule = RollbackRule::of::<ValidationError>();
        let wrapped = ServiceError::Validation(ValidationError);
        assert!(rule.matches(&wrapped));
        assert!(!rule.matches(&ServiceError::Io(IoFailure)));
    }

    #[test]
    fn test_no_rollback_for_takes_precedence() {
        let definition = TransactionDefinition::new(Propagation::Required)
            .rollback_for::<ServiceError>()
            .no_rollback_for::<ValidationError>();

        assert!(!definition.should_rollback(&ServiceError::Validation(ValidationError)));
        assert!(definition.should_rollback(&ServiceError::Io(IoFailure)));
        assert!(TransactionDefinition::default().should_rollback(&IoFailure));
    }

    #[test]
    fn test_rollback_for_does_not_narrow_default() {
        let definition = TransactionDefinition::new(Propagation::Required).rollback_for::<ValidationError>();

        assert!(definition.should_rollback(&ValidationError));
        assert!(definition.should_rollback(&IoFailure));
    }
}
