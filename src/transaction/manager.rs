//! 事务管理器
//!
//! 每个管理器按线程维护一个帧栈。帧记录自己是否开启了物理事务（owner），
//! 只有 owner 帧提交或回滚；帧栈清空时释放会话。
//! REQUIRES_NEW 挂起外层会话并在新会话上开启事务，帧结束后恢复外层。
//!
//! 线程状态从表中克隆出来后再加锁，数据库操作期间不持有表的分片锁。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::definition::{Propagation, TransactionDefinition};
use crate::datasource::{DataSource, Dialect, Session};
use crate::errors::TransactionError;

#[derive(Debug, Clone, Copy)]
struct Frame {
    propagation: Propagation,
    owner: bool,
    suspended: bool,
    read_only: bool,
    transactional: bool,
}

struct Suspended {
    session: Option<Box<dyn Session>>,
    rollback_only: bool,
}

#[derive(Default)]
struct ThreadScope {
    session: Option<Box<dyn Session>>,
    active: bool,
    rollback_only: bool,
    frames: Vec<Frame>,
    suspended: Vec<Suspended>,
}

#[derive(Default)]
struct InnerStats {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// 事务统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

/// 事务管理器
pub struct TransactionalManager {
    name: String,
    datasource: Arc<dyn DataSource>,
    scopes: DashMap<ThreadId, Arc<Mutex<ThreadScope>>>,
    stats: InnerStats,
}

impl TransactionalManager {
    pub fn new(name: impl Into<String>, datasource: Arc<dyn DataSource>) -> Self {
        Self {
            name: name.into(),
            datasource,
            scopes: DashMap::new(),
            stats: InnerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datasource(&self) -> &Arc<dyn DataSource> {
        &self.datasource
    }

    pub fn dialect(&self) -> Dialect {
        self.datasource.dialect()
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.stats.begun.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            rolled_back: self.stats.rolled_back.load(Ordering::Relaxed),
        }
    }

    /// 当前线程是否处于事务中
    pub fn is_active(&self) -> bool {
        self.current_scope()
            .map(|scope| scope.lock().active)
            .unwrap_or(false)
    }

    /// 当前线程的帧栈深度
    pub fn depth(&self) -> usize {
        self.current_scope()
            .map(|scope| scope.lock().frames.len())
            .unwrap_or(0)
    }

    /// 按传播行为执行代码块
    ///
    /// 代码块返回错误（或 panic）时，owner 帧回滚；正常返回不会隐式提交，
    /// 需要在代码块内调用 [`TransactionScope::commit`]。
    pub fn transaction_context<T, E, F>(&self, propagation: Propagation, body: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionScope<'_>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        self.run(&TransactionDefinition::new(propagation), body)
    }

    /// 声明式事务
    ///
    /// owner 帧在成功时提交（只读事务改为回滚）；失败时按回滚规则决定
    /// 提交还是回滚，原错误总是返回给调用方。
    pub fn transactional<T, E, F>(&self, definition: &TransactionDefinition, body: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionScope<'_>) -> Result<T, E>,
        E: Error + From<TransactionError> + 'static,
    {
        self.run(definition, |tx| {
            let result = body(tx);
            if !tx.is_owner() {
                return result;
            }

            match result {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(error) => {
                    if definition.should_rollback(&error) {
                        tx.rollback_quietly();
                    } else if let Err(commit_error) = tx.commit() {
                        tracing::error!(manager = %self.name, error = %commit_error, "按规则提交失败");
                    }
                    Err(error)
                }
            }
        })
    }

    fn run<T, E, F>(&self, definition: &TransactionDefinition, body: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionScope<'_>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let frame = self.enter(definition)?;
        let guard = FrameGuard {
            manager: self,
            frame,
            finished: false,
        };
        let scope = TransactionScope {
            manager: self,
            frame,
            thread: thread::current().id(),
        };

        let result = body(&scope);
        guard.finish(result.is_err());
        result
    }

    fn current_scope(&self) -> Option<Arc<Mutex<ThreadScope>>> {
        self.scopes
            .get(&thread::current().id())
            .map(|scope| scope.value().clone())
    }

    fn scope(&self) -> Arc<Mutex<ThreadScope>> {
        if let Some(scope) = self.current_scope() {
            return scope;
        }
        self.scopes
            .entry(thread::current().id())
            .or_default()
            .value()
            .clone()
    }

    /// 分片守卫在加锁前已释放，`f` 内可以执行数据库操作
    fn with_scope<R>(&self, f: impl FnOnce(&mut ThreadScope) -> R) -> R {
        let scope = self.scope();
        let mut guard = scope.lock();
        f(&mut guard)
    }

    fn release_if_idle(&self) {
        let removed = self
            .scopes
            .remove_if(&thread::current().id(), |_, scope| scope.lock().frames.is_empty());
        drop(removed);
    }

    fn enter(&self, definition: &TransactionDefinition) -> Result<Frame, TransactionError> {
        let result = self.try_enter(definition);
        if let Err(e) = &result {
            tracing::debug!(
                manager = %self.name,
                propagation = %definition.propagation,
                error = %e,
                "进入事务作用域失败"
            );
            self.release_if_idle();
        }
        result
    }

    fn try_enter(&self, definition: &TransactionDefinition) -> Result<Frame, TransactionError> {
        let propagation = definition.propagation;
        let needs_session = self.with_scope(|scope| Self::check(scope, propagation))?;

        // 在作用域锁之外从连接池取会话
        let fresh = if needs_session {
            Some(self.datasource.open_session()?)
        } else {
            None
        };

        self.with_scope(|scope| self.push_frame(scope, definition, fresh))
    }

    /// 校验传播规则，返回是否需要新会话
    fn check(scope: &ThreadScope, propagation: Propagation) -> Result<bool, TransactionError> {
        match propagation {
            Propagation::Mandatory if !scope.active => Err(TransactionError::NoTransaction),
            Propagation::Never if scope.active => Err(TransactionError::TransactionPresent),
            Propagation::Required => Ok(!scope.active && scope.session.is_none()),
            Propagation::RequiresNew => Ok(scope.active || scope.session.is_none()),
            _ => Ok(false),
        }
    }

    fn push_frame(
        &self,
        scope: &mut ThreadScope,
        definition: &TransactionDefinition,
        fresh: Option<Box<dyn Session>>,
    ) -> Result<Frame, TransactionError> {
        let propagation = definition.propagation;
        let mut frame = Frame {
            propagation,
            owner: false,
            suspended: false,
            read_only: definition.read_only,
            transactional: false,
        };

        match propagation {
            Propagation::Required if !scope.active => {
                if fresh.is_some() {
                    scope.session = fresh;
                }
                self.begin(scope)?;
                frame.owner = true;
            }
            Propagation::RequiresNew => {
                if scope.active {
                    scope.suspended.push(Suspended {
                        session: scope.session.take(),
                        rollback_only: mem::take(&mut scope.rollback_only),
                    });
                    scope.active = false;
                    frame.suspended = true;
                    tracing::debug!(manager = %self.name, "挂起外层事务");
                }
                if fresh.is_some() {
                    scope.session = fresh;
                }
                if let Err(e) = self.begin(scope) {
                    if frame.suspended {
                        self.resume(scope);
                    }
                    return Err(e);
                }
                frame.owner = true;
            }
            Propagation::NotSupported if scope.active => {
                tracing::debug!(manager = %self.name, "NOT_SUPPORTED: 回滚当前事务，保留会话");
                self.rollback_scope(scope);
            }
            _ => {}
        }

        frame.transactional = scope.active;
        scope.frames.push(frame);
        tracing::trace!(
            manager = %self.name,
            propagation = %propagation,
            owner = frame.owner,
            depth = scope.frames.len(),
            "进入事务帧"
        );
        Ok(frame)
    }

    fn exit(&self, frame: Frame, failed: bool) {
        let released = self.with_scope(|scope| {
            scope.frames.pop();

            if frame.owner && scope.active {
                if !failed {
                    tracing::warn!(
                        manager = %self.name,
                        propagation = %frame.propagation,
                        "事务作用域结束时仍未提交，执行回滚"
                    );
                }
                self.rollback_scope(scope);
            }

            if frame.suspended {
                self.resume(scope);
            }

            if scope.frames.is_empty() {
                scope.active = false;
                scope.rollback_only = false;
                scope.session.take()
            } else {
                None
            }
        });

        drop(released);
        self.release_if_idle();
    }

    fn begin(&self, scope: &mut ThreadScope) -> Result<(), TransactionError> {
        let session = scope.session.as_mut().ok_or(TransactionError::NoSession)?;
        session.begin()?;
        scope.active = true;
        scope.rollback_only = false;
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(manager = %self.name, "开启事务");
        Ok(())
    }

    fn commit_scope(&self, scope: &mut ThreadScope) -> Result<(), TransactionError> {
        if scope.rollback_only {
            tracing::warn!(manager = %self.name, "事务已被标记为只能回滚，放弃提交");
            self.rollback_scope(scope);
            return Ok(());
        }
        let session = scope.session.as_mut().ok_or(TransactionError::NoSession)?;
        session.commit()?;
        scope.active = false;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(manager = %self.name, "提交事务");
        Ok(())
    }

    /// 回滚失败只记录日志
    fn rollback_scope(&self, scope: &mut ThreadScope) {
        if let Some(session) = scope.session.as_mut() {
            if let Err(e) = session.rollback() {
                tracing::error!(manager = %self.name, error = %e, "事务回滚失败");
            }
        }
        scope.active = false;
        scope.rollback_only = false;
        self.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(manager = %self.name, "回滚事务");
    }

    /// 释放当前会话并恢复被挂起的外层会话
    fn resume(&self, scope: &mut ThreadScope) {
        drop(scope.session.take());
        if let Some(outer) = scope.suspended.pop() {
            scope.active = outer.session.as_ref().map(|s| s.in_transaction()).unwrap_or(false);
            scope.session = outer.session;
            scope.rollback_only = outer.rollback_only;
            tracing::debug!(manager = %self.name, "恢复外层事务");
        }
    }
}

impl fmt::Debug for TransactionalManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalManager")
            .field("name", &self.name)
            .field("datasource", &self.datasource.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// 帧守卫：代码块 panic 时按失败处理
struct FrameGuard<'m> {
    manager: &'m TransactionalManager,
    frame: Frame,
    finished: bool,
}

impl FrameGuard<'_> {
    fn finish(mut self, failed: bool) {
        self.finished = true;
        self.manager.exit(self.frame, failed);
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.exit(self.frame, true);
        }
    }
}

/// 代码块内可见的事务作用域
///
/// 作用域绑定在打开它的线程上，其他线程上的操作返回
/// [`TransactionError::ForeignThread`]。
pub struct TransactionScope<'m> {
    manager: &'m TransactionalManager,
    frame: Frame,
    thread: ThreadId,
}

impl TransactionScope<'_> {
    pub fn propagation(&self) -> Propagation {
        self.frame.propagation
    }

    /// 本帧是否开启了物理事务
    pub fn is_owner(&self) -> bool {
        self.frame.owner
    }

    /// 进入本帧时是否处于事务中
    pub fn is_transactional(&self) -> bool {
        self.frame.transactional
    }

    pub fn is_read_only(&self) -> bool {
        self.frame.read_only
    }

    /// 当前是否仍有活动事务
    pub fn is_active(&self) -> bool {
        self.ensure_thread().is_ok() && self.manager.is_active()
    }

    pub fn dialect(&self) -> Dialect {
        self.manager.dialect()
    }

    /// 在当前会话上执行语句；没有会话时使用临时会话自动提交
    pub fn execute(&self, sql: &str) -> Result<u64, TransactionError> {
        self.ensure_thread()?;
        let bound = self
            .manager
            .with_scope(|scope| scope.session.as_mut().map(|session| session.execute(sql)));
        match bound {
            Some(result) => Ok(result?),
            None => {
                let mut session = self.manager.datasource.open_session()?;
                Ok(session.execute(sql)?)
            }
        }
    }

    /// 提交事务
    ///
    /// 非 owner 帧的提交被忽略；只读事务改为回滚。
    pub fn commit(&self) -> Result<(), TransactionError> {
        self.ensure_thread()?;
        if !self.frame.owner {
            tracing::debug!(propagation = %self.frame.propagation, "非事务发起方，忽略提交");
            return Ok(());
        }
        self.manager.with_scope(|scope| {
            if !scope.active {
                return Ok(());
            }
            if self.frame.read_only {
                self.manager.rollback_scope(scope);
                return Ok(());
            }
            self.manager.commit_scope(scope)
        })
    }

    /// 回滚事务
    ///
    /// 非 owner 帧只把事务标记为只能回滚，由 owner 帧执行回滚。
    pub fn rollback(&self) -> Result<(), TransactionError> {
        self.ensure_thread()?;
        self.manager.with_scope(|scope| {
            if !scope.active {
                return Ok(());
            }
            if self.frame.owner {
                let session = scope.session.as_mut().ok_or(TransactionError::NoSession)?;
                let result = session.rollback();
                scope.active = false;
                scope.rollback_only = false;
                self.manager.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
                result.map_err(TransactionError::from)
            } else {
                scope.rollback_only = true;
                Ok(())
            }
        })
    }

    fn ensure_thread(&self) -> Result<(), TransactionError> {
        if thread::current().id() == self.thread {
            Ok(())
        } else {
            tracing::warn!(manager = %self.manager.name, "事务作用域被跨线程使用");
            Err(TransactionError::ForeignThread)
        }
    }

    fn rollback_quietly(&self) {
        if let Err(e) = self.rollback() {
            tracing::error!(error = %e, "事务回滚失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DataSourceSettings, MemoryDriver, MemoryJournal, PooledDataSource};

    fn manager() -> (TransactionalManager, Arc<MemoryJournal>) {
        let driver = MemoryDriver::new();
        let journal = driver.journal();
        let settings = DataSourceSettings::new("test", "mem://test");
        let ds = PooledDataSource::connect(&settings, Arc::new(driver)).unwrap();
        (TransactionalManager::new("test", Arc::new(ds)), journal)
    }

    #[test]
    fn test_required_begins_and_commits() {
        let (tm, journal) = manager();
        tm.transaction_context(Propagation::Required, |tx| {
            assert!(tx.is_owner());
            tx.execute("insert into t values (1)")?;
            tx.commit()
        })
        .unwrap();

        assert_eq!(journal.committed(), vec!["insert into t values (1)".to_string()]);
        assert_eq!(tm.stats().committed, 1);
        assert_eq!(tm.depth(), 0);
    }

    #[test]
    fn test_uncommitted_owner_is_rolled_back() {
        let (tm, journal) = manager();
        tm.transaction_context::<_, TransactionError, _>(Propagation::Required, |tx| {
            tx.execute("insert into t values (1)")?;
            Ok(())
        })
        .unwrap();

        assert!(journal.committed().is_empty());
        assert_eq!(tm.stats().rolled_back, 1);
    }

    #[test]
    fn test_joined_frame_commit_is_deferred_to_owner() {
        let (tm, journal) = manager();
        tm.transaction_context(Propagation::Required, |outer| {
            tm.transaction_context(Propagation::Required, |inner| {
                assert!(!inner.is_owner());
                inner.execute("insert into t values (1)")?;
                inner.commit()
            })?;
            assert!(journal.committed().is_empty());
            outer.commit()
        })
        .unwrap();

        assert_eq!(journal.committed().len(), 1);
        assert_eq!(journal.commits(), 1);
    }

    #[test]
    fn test_joined_rollback_marks_rollback_only() {
        let (tm, journal) = manager();
        tm.transaction_context(Propagation::Required, |outer| {
            tm.transaction_context(Propagation::Supports, |inner| {
                inner.execute("update t set a = 1")?;
                inner.rollback()
            })?;
            outer.commit()
        })
        .unwrap();

        assert!(journal.committed().is_empty());
        assert_eq!(journal.commits(), 0);
    }

    #[test]
    fn test_panic_in_body_rolls_back() {
        let (tm, journal) = manager();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = tm.transaction_context::<(), TransactionError, _>(Propagation::Required, |tx| {
                tx.execute("insert into t values (1)")?;
                panic!("boom");
            });
        }));

        assert!(result.is_err());
        assert_eq!(journal.rollbacks(), 1);
        assert_eq!(tm.depth(), 0);
        assert!(!tm.is_active());
    }

    #[test]
    fn test_scopes_are_per_thread() {
        let (tm, _journal) = manager();
        let tm = Arc::new(tm);
        tm.transaction_context(Propagation::Required, |_| {
            let other = tm.clone();
            let joined = std::thread::spawn(move || {
                other.transaction_context(Propagation::Mandatory, |_| Ok::<_, TransactionError>(()))
            })
            .join()
            .unwrap();
            assert!(matches!(joined, Err(TransactionError::NoTransaction)));
            Ok::<_, TransactionError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_scope_rejects_other_threads() {
        let (tm, journal) = manager();
        let result = tm.transaction_context(Propagation::Required, |tx| {
            let (executed, committed) = std::thread::scope(|s| {
                s.spawn(|| (tx.execute("insert into t values (9)"), tx.commit()))
                    .join()
                    .unwrap()
            });
            assert!(matches!(executed, Err(TransactionError::ForeignThread)));
            assert!(matches!(committed, Err(TransactionError::ForeignThread)));
            assert!(tx.is_active());

            tx.execute("insert into t values (1)")?;
            Err::<(), _>(TransactionError::NoSession)
        });

        assert!(result.is_err());
        assert!(journal.committed().is_empty());
        assert_eq!(journal.rollbacks(), 1);
        assert_eq!(tm.depth(), 0);
    }
}
