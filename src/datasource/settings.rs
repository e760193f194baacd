use std::time::Duration;

use crate::config::ConfigSection;
use crate::errors::DataSourceError;

/// 连接池参数
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// 常驻连接数
    pub pool_size: usize,
    /// 超出常驻数后允许临时创建的连接数
    pub max_overflow: usize,
    /// 获取连接的等待上限
    pub timeout: Duration,
    /// 连接最长存活时间，超过后在下次取出时重建
    pub recycle: Duration,
    /// 取出连接前先探活
    pub pre_ping: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 20,
            max_overflow: 10,
            timeout: Duration::from_secs(30),
            recycle: Duration::from_secs(3600),
            pre_ping: true,
        }
    }
}

impl PoolSettings {
    pub fn from_section(section: &ConfigSection) -> Self {
        let defaults = Self::default();
        Self {
            pool_size: non_negative(section.get_int("pool_size", defaults.pool_size as i64)),
            max_overflow: non_negative(section.get_int("max_overflow", defaults.max_overflow as i64)),
            timeout: seconds(section.get_float("pool_timeout", defaults.timeout.as_secs_f64())),
            recycle: seconds(section.get_float("pool_recycle", defaults.recycle.as_secs_f64())),
            pre_ping: section.get_bool("pool_pre_ping", defaults.pre_ping),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}

fn non_negative(value: i64) -> usize {
    value.max(0) as usize
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// 单个数据源的配置
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceSettings {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 建池后执行一次的探测语句
    pub test: Option<String>,
    pub pool: PoolSettings,
}

impl DataSourceSettings {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
            test: None,
            pool: PoolSettings::default(),
        }
    }

    pub fn from_section(name: &str, section: &ConfigSection) -> Result<Self, DataSourceError> {
        let url = section
            .get_opt_str("url")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| DataSourceError::InvalidConfig {
                name: name.to_string(),
                reason: "missing 'url'".to_string(),
            })?;

        Ok(Self {
            name: name.to_string(),
            url,
            username: section.get_opt_str("username").filter(|s| !s.is_empty()),
            password: section.get_opt_str("password").filter(|s| !s.is_empty()),
            test: section.get_opt_str("test").filter(|s| !s.trim().is_empty()),
            pool: PoolSettings::from_section(section),
        })
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// 应用 username/password 覆盖后的连接 URL
    pub fn connect_url(&self) -> String {
        with_credentials(&self.url, self.username.as_deref(), self.password.as_deref())
    }
}

/// 替换 URL 中的账号信息；只给出密码时沿用原有用户名
pub fn with_credentials(url: &str, username: Option<&str>, password: Option<&str>) -> String {
    if username.is_none() && password.is_none() {
        return url.to_string();
    }
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };

    let (userinfo, host) = split_userinfo(rest);
    let (current_user, current_password) = match userinfo {
        Some(info) => match info.split_once(':') {
            Some((user, password)) => (Some(user), Some(password)),
            None => (Some(info), None),
        },
        None => (None, None),
    };

    let user = username.or(current_user).unwrap_or_default();
    match password.or(current_password) {
        Some(password) => format!("{}://{}:{}@{}", scheme, user, password, host),
        None => format!("{}://{}@{}", scheme, user, host),
    }
}

/// 日志用：隐藏 URL 中的密码
pub fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match split_userinfo(rest) {
        (Some(info), host) => match info.split_once(':') {
            Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
            None => url.to_string(),
        },
        (None, _) => url.to_string(),
    }
}

fn split_userinfo(rest: &str) -> (Option<&str>, &str) {
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
        None => (None, rest),
    }
}
