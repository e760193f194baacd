use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use dataflow::config::{ConfigurationCache, Environment};
use dataflow::context::bootstrap::{DEFAULT_CONFIG_PATH, DEFAULT_SCAN_PATH};
use dataflow::context::{Application, StartOptions};
use dataflow::datasource::MemoryDriver;
use dataflow::logging::{init_logging, parse_level, LoggingConfig};

/// dataflow - 配置驱动的应用上下文
#[derive(Parser, Debug)]
#[command(name = "dataflow")]
#[command(about = "加载配置、注册模块与数据源，并驱动应用生命周期")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// 应用模块扫描路径（`pkg`、`pkg.*` 或 `pkg.**`）
    #[arg(short, long, default_value = DEFAULT_SCAN_PATH)]
    scan: String,

    /// 覆盖日志级别
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cache = ConfigurationCache::global();
    let document = cache.load(&args.config).ok();

    let mut logging = LoggingConfig::for_environment(Environment::current())
        .with_section(document.as_ref().and_then(|doc| doc.get_config("logging")).as_ref());
    if let Some(level) = args.log_level.as_deref().and_then(parse_level) {
        logging.level = level;
    }
    if let Err(e) = init_logging(logging) {
        eprintln!("日志初始化失败: {}", e);
    }

    let mut app = Application::with_cache(cache).driver(Arc::new(MemoryDriver::new()));
    let context = app.start(StartOptions::new(&args.config, &args.scan))?;
    app.started()?;
    tracing::info!(
        state = %context.state(),
        modules = ?context.modules().registered_modules(),
        "应用已启动，按 Ctrl+C 退出"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号");
    app.shutdown()?;
    Ok(())
}
