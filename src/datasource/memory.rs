//! 内存驱动
//!
//! 不连接真实数据库，只把语句与事务操作记录到共享的 [`MemoryJournal`]，
//! 供命令行演示与测试使用。事务内的语句在提交后才进入已提交列表。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{Connection, Driver};
use crate::errors::DataSourceError;

/// 驱动记录的操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Connect { connection: u64, url: String },
    Begin { connection: u64 },
    Execute { connection: u64, sql: String },
    Commit { connection: u64 },
    Rollback { connection: u64 },
    Close { connection: u64 },
}

/// 共享操作日志
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    committed: Mutex<Vec<String>>,
    next_connection: AtomicU64,
    unhealthy: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// 已生效（提交或自动提交）的语句
    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&JournalEntry) -> bool) -> usize {
        self.entries.lock().iter().filter(|entry| predicate(entry)).count()
    }

    pub fn begins(&self) -> usize {
        self.count(|e| matches!(e, JournalEntry::Begin { .. }))
    }

    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, JournalEntry::Commit { .. }))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, JournalEntry::Rollback { .. }))
    }

    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, JournalEntry::Connect { .. }))
    }

    pub fn closes(&self) -> usize {
        self.count(|e| matches!(e, JournalEntry::Close { .. }))
    }

    /// 让后续的探活失败
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.committed.lock().clear();
    }
}

/// 内存驱动，默认接受 `mem` 与 `memory` scheme
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    schemes: Vec<String>,
    journal: Arc<MemoryJournal>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::with_schemes(&["mem", "memory"])
    }

    pub fn with_schemes(schemes: &[&str]) -> Self {
        Self {
            schemes: schemes.iter().map(|s| s.to_ascii_lowercase()).collect(),
            journal: Arc::new(MemoryJournal::new()),
        }
    }

    pub fn journal(&self) -> Arc<MemoryJournal> {
        self.journal.clone()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn accepts(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }

    fn connect(&self, url: &str) -> Result<Box<dyn Connection>, DataSourceError> {
        let id = self.journal.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        self.journal.record(JournalEntry::Connect {
            connection: id,
            url: url.to_string(),
        });
        Ok(Box::new(MemoryConnection {
            id,
            journal: self.journal.clone(),
            pending: None,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    journal: Arc<MemoryJournal>,
    /// 事务中的语句；None 表示自动提交模式
    pending: Option<Vec<String>>,
}

impl Connection for MemoryConnection {
    fn begin(&mut self) -> Result<(), DataSourceError> {
        if self.pending.is_some() {
            return Err(DataSourceError::Session(
                "transaction already begun on this connection".to_string(),
            ));
        }
        self.pending = Some(Vec::new());
        self.journal.record(JournalEntry::Begin { connection: self.id });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DataSourceError> {
        let statements = self.pending.take().unwrap_or_default();
        self.journal.committed.lock().extend(statements);
        self.journal.record(JournalEntry::Commit { connection: self.id });
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DataSourceError> {
        self.pending = None;
        self.journal.record(JournalEntry::Rollback { connection: self.id });
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DataSourceError> {
        if sql.trim().is_empty() {
            return Err(DataSourceError::Statement("empty statement".to_string()));
        }
        self.journal.record(JournalEntry::Execute {
            connection: self.id,
            sql: sql.to_string(),
        });
        match self.pending.as_mut() {
            Some(pending) => pending.push(sql.to_string()),
            None => self.journal.committed.lock().push(sql.to_string()),
        }
        Ok(1)
    }

    fn ping(&mut self) -> bool {
        !self.journal.unhealthy.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.pending = None;
        self.journal.record(JournalEntry::Close { connection: self.id });
    }
}
