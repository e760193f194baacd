use std::fmt;

/// SQL 方言，决定分页与计数语句的写法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    PostgreSql,
    MySql,
    Sqlite,
    Oracle,
    MsSql,
    Hive,
    ClickHouse,
    Generic,
}

impl Dialect {
    /// 根据 URL scheme 判断方言
    pub fn from_url(url: &str) -> Self {
        match super::url_scheme(url).as_deref() {
            Some("postgresql") | Some("postgres") | Some("opengauss") => Dialect::PostgreSql,
            Some("mysql") | Some("mariadb") => Dialect::MySql,
            Some("sqlite") => Dialect::Sqlite,
            Some("oracle") => Dialect::Oracle,
            Some("mssql") | Some("sqlserver") => Dialect::MsSql,
            Some("hive") => Dialect::Hive,
            Some("clickhouse") => Dialect::ClickHouse,
            _ => Dialect::Generic,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::PostgreSql => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
            Dialect::Oracle => "oracle",
            Dialect::MsSql => "mssql",
            Dialect::Hive => "hive",
            Dialect::ClickHouse => "clickhouse",
            Dialect::Generic => "generic",
        }
    }

    /// 包装分页语句
    pub fn paginate(&self, sql: &str, offset: u64, limit: u64) -> String {
        let sql = sql.trim().trim_end_matches(';');
        match self {
            Dialect::MySql => format!("{} LIMIT {}, {}", sql, offset, limit),
            Dialect::Oracle => format!(
                "SELECT * FROM (SELECT t.*, ROWNUM rn__ FROM ({}) t WHERE ROWNUM <= {}) WHERE rn__ > {}",
                sql,
                offset.saturating_add(limit),
                offset
            ),
            Dialect::MsSql => format!(
                "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                sql, offset, limit
            ),
            Dialect::Hive => format!(
                "SELECT * FROM (SELECT t.*, ROW_NUMBER() OVER () AS rn__ FROM ({}) t) a WHERE a.rn__ > {} AND a.rn__ <= {}",
                sql,
                offset,
                offset.saturating_add(limit)
            ),
            Dialect::PostgreSql | Dialect::Sqlite | Dialect::ClickHouse | Dialect::Generic => {
                format!("{} LIMIT {} OFFSET {}", sql, limit, offset)
            }
        }
    }

    /// 计数语句
    pub fn count(&self, sql: &str) -> String {
        format!(
            "SELECT COUNT(1) AS cnt FROM ({}) cnt__",
            sql.trim().trim_end_matches(';')
        )
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 分页参数，页码从 1 开始
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u64,
    pub page_size: u64,
}

impl Pagination {
    /// 页码小于 1 时按第 1 页处理，页大小至少为 1
    pub fn new(page: u64, page_size: u64) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.page_size)
    }

    pub fn apply(&self, dialect: Dialect, sql: &str) -> String {
        dialect.paginate(sql, self.offset(), self.page_size)
    }
}
