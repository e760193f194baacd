//! 连接池
//!
//! 常驻 `pool_size` 个连接，繁忙时最多再临时创建 `max_overflow` 个；
//! 临时连接归还时直接关闭。取连接最多等待 `pool_timeout`。
//! 会话是连接的守卫，释放时自动归还。

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::settings::{mask_password, DataSourceSettings, PoolSettings};
use super::{Connection, DataSource, Dialect, Driver, Session};
use crate::errors::DataSourceError;

struct PooledConnection {
    connection: Box<dyn Connection>,
    created_at: Instant,
}

impl PooledConnection {
    fn close(mut self) {
        self.connection.close();
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConnection>,
    checked_out: usize,
    closed: bool,
}

struct PoolInner {
    name: String,
    url: String,
    display_url: String,
    dialect: Dialect,
    settings: PoolSettings,
    driver: Arc<dyn Driver>,
    state: Mutex<PoolState>,
    available: Condvar,
    created: AtomicU64,
    discarded: AtomicU64,
}

/// 连接池快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
    pub created: u64,
    pub discarded: u64,
    pub closed: bool,
}

/// 带连接池的数据源
pub struct PooledDataSource {
    inner: Arc<PoolInner>,
}

impl PooledDataSource {
    /// 创建连接池；配置了 `test` 语句时立即执行一次
    pub fn connect(settings: &DataSourceSettings, driver: Arc<dyn Driver>) -> Result<Self, DataSourceError> {
        let url = settings.connect_url();
        let display_url = mask_password(&url);

        let datasource = Self {
            inner: Arc::new(PoolInner {
                name: settings.name.clone(),
                dialect: Dialect::from_url(&url),
                url,
                display_url,
                settings: settings.pool.clone(),
                driver,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        };

        if let Some(test) = &settings.test {
            let mut session = datasource.open_session()?;
            session.execute(test)?;
            tracing::debug!(datasource = %settings.name, test = %test, "探测语句执行成功");
        }

        tracing::info!(
            datasource = %settings.name,
            url = %datasource.inner.display_url,
            pool_size = settings.pool.pool_size,
            max_overflow = settings.pool.max_overflow,
            "数据源已创建"
        );
        Ok(datasource)
    }

    pub fn url(&self) -> &str {
        &self.inner.display_url
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            created: self.inner.created.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl DataSource for PooledDataSource {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    fn open_session(&self) -> Result<Box<dyn Session>, DataSourceError> {
        let connection = self.inner.checkout()?;
        Ok(Box::new(PooledSession {
            connection: Some(connection),
            pool: self.inner.clone(),
            in_transaction: false,
        }))
    }

    /// 关闭连接池：空闲连接立即关闭，借出的连接在归还时关闭
    fn close(&self) {
        let idle: Vec<PooledConnection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        for connection in idle {
            connection.close();
        }
        self.inner.available.notify_all();
        tracing::info!(datasource = %self.inner.name, "数据源已关闭");
    }
}

impl std::fmt::Debug for PooledDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDataSource")
            .field("name", &self.inner.name)
            .field("url", &self.inner.display_url)
            .field("dialect", &self.inner.dialect)
            .finish()
    }
}

impl PoolInner {
    fn checkout(&self) -> Result<PooledConnection, DataSourceError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(DataSourceError::PoolClosed(self.name.clone()));
            }

            if let Some(mut pooled) = state.idle.pop_front() {
                state.checked_out += 1;
                drop(state);
                if self.is_usable(&mut pooled) {
                    return Ok(pooled);
                }
                self.discarded.fetch_add(1, Ordering::Relaxed);
                pooled.close();
                state = self.state.lock();
                state.checked_out -= 1;
                continue;
            }

            if state.checked_out < self.settings.max_connections() {
                state.checked_out += 1;
                drop(state);
                return match self.open() {
                    Ok(pooled) => Ok(pooled),
                    Err(e) => {
                        self.state.lock().checked_out -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            if self.available.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(datasource = %self.name, timeout = ?self.settings.timeout, "获取连接超时");
                return Err(DataSourceError::PoolTimeout(self.settings.timeout));
            }
        }
    }

    fn open(&self) -> Result<PooledConnection, DataSourceError> {
        let connection = self.driver.connect(&self.url).map_err(|e| match e {
            DataSourceError::Connect { .. } => e,
            other => DataSourceError::Connect {
                url: self.display_url.clone(),
                reason: other.to_string(),
            },
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(datasource = %self.name, "创建新连接");
        Ok(PooledConnection {
            connection,
            created_at: Instant::now(),
        })
    }

    /// 超过回收时间或探活失败的连接不再使用
    fn is_usable(&self, pooled: &mut PooledConnection) -> bool {
        if !self.settings.recycle.is_zero() && pooled.created_at.elapsed() >= self.settings.recycle {
            tracing::debug!(datasource = %self.name, "连接超过回收时间");
            return false;
        }
        if self.settings.pre_ping && !pooled.connection.ping() {
            tracing::debug!(datasource = %self.name, "连接探活失败");
            return false;
        }
        true
    }

    fn release(&self, pooled: PooledConnection) {
        let overflow = {
            let mut state = self.state.lock();
            state.checked_out -= 1;
            if !state.closed && state.idle.len() < self.settings.pool_size {
                state.idle.push_back(pooled);
                None
            } else {
                Some(pooled)
            }
        };
        if let Some(pooled) = overflow {
            pooled.close();
        }
        self.available.notify_one();
    }
}

/// 池化会话，释放时归还连接
struct PooledSession {
    connection: Option<PooledConnection>,
    pool: Arc<PoolInner>,
    in_transaction: bool,
}

impl PooledSession {
    fn connection(&mut self) -> Result<&mut Box<dyn Connection>, DataSourceError> {
        self.connection
            .as_mut()
            .map(|pooled| &mut pooled.connection)
            .ok_or_else(|| DataSourceError::Session("session already released".to_string()))
    }
}

impl Session for PooledSession {
    fn begin(&mut self) -> Result<(), DataSourceError> {
        self.connection()?.begin()?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DataSourceError> {
        let result = self.connection()?.commit();
        self.in_transaction = false;
        result
    }

    fn rollback(&mut self) -> Result<(), DataSourceError> {
        let result = self.connection()?.rollback();
        self.in_transaction = false;
        result
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DataSourceError> {
        self.connection()?.execute(sql)
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(mut pooled) = self.connection.take() else {
            return;
        };
        if self.in_transaction {
            if let Err(e) = pooled.connection.rollback() {
                tracing::warn!(datasource = %self.pool.name, error = %e, "归还连接前回滚失败");
            }
        }
        self.pool.release(pooled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MemoryDriver;
    use std::thread;
    use std::time::Duration;

    fn datasource(pool: PoolSettings) -> (PooledDataSource, MemoryDriver) {
        let driver = MemoryDriver::new();
        let settings = DataSourceSettings::new("test", "mem://test").with_pool(pool);
        let ds = PooledDataSource::connect(&settings, Arc::new(driver.clone())).unwrap();
        (ds, driver)
    }

    fn small_pool() -> PoolSettings {
        PoolSettings {
            pool_size: 1,
            max_overflow: 1,
            timeout: Duration::from_millis(50),
            ..PoolSettings::default()
        }
    }

    #[test]
    fn test_session_returns_connection_to_pool() {
        let (ds, driver) = datasource(small_pool());
        {
            let mut session = ds.open_session().unwrap();
            session.execute("select 1").unwrap();
            assert_eq!(ds.status().checked_out, 1);
        }
        assert_eq!(ds.status().idle, 1);

        drop(ds.open_session().unwrap());
        assert_eq!(driver.journal().connects(), 1);
    }

    #[test]
    fn test_overflow_is_closed_on_return_and_timeout_when_exhausted() {
        let (ds, driver) = datasource(small_pool());
        let first = ds.open_session().unwrap();
        let second = ds.open_session().unwrap();

        assert!(matches!(ds.open_session(), Err(DataSourceError::PoolTimeout(_))));

        drop(first);
        drop(second);
        let status = ds.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.checked_out, 0);
        assert_eq!(driver.journal().closes(), 1);
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let pool = PoolSettings {
            pool_size: 1,
            max_overflow: 0,
            timeout: Duration::from_secs(5),
            ..PoolSettings::default()
        };
        let (ds, _driver) = datasource(pool);
        let ds = Arc::new(ds);
        let held = ds.open_session().unwrap();

        let waiter = {
            let ds = ds.clone();
            thread::spawn(move || ds.open_session().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_uncommitted_session_is_rolled_back_on_release() {
        let (ds, driver) = datasource(small_pool());
        {
            let mut session = ds.open_session().unwrap();
            session.begin().unwrap();
            session.execute("insert into t values (1)").unwrap();
        }
        let journal = driver.journal();
        assert_eq!(journal.rollbacks(), 1);
        assert!(journal.committed().is_empty());
    }

    #[test]
    fn test_pre_ping_discards_dead_connections() {
        let (ds, driver) = datasource(small_pool());
        drop(ds.open_session().unwrap());

        driver.journal().set_healthy(false);
        drop(ds.open_session().unwrap());

        assert_eq!(ds.status().discarded, 1);
        assert_eq!(driver.journal().connects(), 2);
    }

    #[test]
    fn test_test_query_runs_once_at_construction() {
        let driver = MemoryDriver::new();
        let mut settings = DataSourceSettings::new("test", "mem://test");
        settings.test = Some("select 1".to_string());
        PooledDataSource::connect(&settings, Arc::new(driver.clone())).unwrap();

        assert_eq!(driver.journal().committed(), vec!["select 1".to_string()]);
    }

    #[test]
    fn test_closed_pool_rejects_checkout() {
        let (ds, driver) = datasource(small_pool());
        let held = ds.open_session().unwrap();
        drop(ds.open_session().unwrap());
        ds.close();

        assert!(ds.is_closed());
        assert!(matches!(ds.open_session(), Err(DataSourceError::PoolClosed(_))));
        drop(held);
        assert_eq!(driver.journal().closes(), 2);
    }
}
