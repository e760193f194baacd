//! Bean 注册表
//!
//! 以字符串键保存单例实例：
//! - 注册即覆盖（后写者胜出），不报错
//! - 解析时按目标类型向下转型，失败返回错误而不是默认值
//! - 查找路径只访问 DashMap 分片锁

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::{type_name, Any};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::ContextError;

/// 类型擦除后的 Bean 实例
pub type Bean = Arc<dyn Any + Send + Sync>;

struct BeanEntry {
    instance: Bean,
    type_name: &'static str,
    order: u64,
}

/// 内部统计信息（原子计数器）
#[derive(Default)]
struct InnerStats {
    total_resolutions: AtomicUsize,
    misses: AtomicUsize,
    registrations: AtomicUsize,
}

/// Bean 注册表
pub struct BeanRegistry {
    beans: DashMap<String, BeanEntry>,
    sequence: AtomicU64,
    stats: InnerStats,
}

impl BeanRegistry {
    pub fn new() -> Self {
        Self {
            beans: DashMap::new(),
            sequence: AtomicU64::new(0),
            stats: InnerStats::default(),
        }
    }

    /// 以显式键注册实例；同名键直接替换，保留首次注册的位置
    pub fn register<T>(&self, key: impl Into<String>, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let type_name = type_name::<T>();
        let instance: Bean = instance;
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);

        match self.beans.entry(key) {
            Entry::Occupied(mut occupied) => {
                tracing::debug!(key = %occupied.key(), bean_type = type_name, "替换已注册的 Bean");
                let entry = occupied.get_mut();
                entry.instance = instance;
                entry.type_name = type_name;
            }
            Entry::Vacant(vacant) => {
                let order = self.sequence.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %vacant.key(), bean_type = type_name, "注册 Bean");
                vacant.insert(BeanEntry {
                    instance,
                    type_name,
                    order,
                });
            }
        }
    }

    /// 以类型全名作为键注册
    pub fn register_type<T>(&self, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.register(type_name::<T>(), instance);
    }

    /// 解析 Bean
    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        self.stats.total_resolutions.fetch_add(1, Ordering::Relaxed);

        let instance = match self.beans.get(key) {
            Some(entry) => entry.instance.clone(),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Err(ContextError::BeanNotFound(key.to_string()));
            }
        };

        instance
            .downcast::<T>()
            .map_err(|_| ContextError::BeanTypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// 按类型全名解析
    pub fn resolve_type<T>(&self) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        self.resolve(type_name::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.beans.contains_key(key)
    }

    /// 所有键，按首次注册顺序
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<(u64, String)> = self
            .beans
            .iter()
            .map(|entry| (entry.value().order, entry.key().clone()))
            .collect();
        keys.sort_by_key(|(order, _)| *order);
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// 指定类型的全部 Bean，按注册顺序
    ///
    /// 同一实例注册在多个键下时会出现多次。
    pub fn beans_of_type<T>(&self) -> Vec<(String, Arc<T>)>
    where
        T: Send + Sync + 'static,
    {
        let mut found: Vec<(u64, String, Arc<T>)> = self
            .beans
            .iter()
            .filter_map(|entry| {
                let bean = entry.value();
                bean.instance
                    .clone()
                    .downcast::<T>()
                    .ok()
                    .map(|instance| (bean.order, entry.key().clone(), instance))
            })
            .collect();
        found.sort_by_key(|(order, _, _)| *order);
        found
            .into_iter()
            .map(|(_, key, instance)| (key, instance))
            .collect()
    }

    /// 注册时记录的类型名
    pub fn type_name_of(&self, key: &str) -> Option<&'static str> {
        self.beans.get(key).map(|entry| entry.type_name)
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }

    /// 获取注册表统计信息
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_resolutions: self.stats.total_resolutions.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            beans: self.beans.len(),
        }
    }
}

impl Default for BeanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

/// 注册表统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_resolutions: usize,
    pub misses: usize,
    pub registrations: usize,
    pub beans: usize,
}

impl RegistryStats {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        if self.total_resolutions == 0 {
            0.0
        } else {
            (self.total_resolutions - self.misses) as f64 / self.total_resolutions as f64
        }
    }
}
