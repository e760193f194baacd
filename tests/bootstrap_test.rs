//! 端到端启动测试：配置文件 → 模块 → 数据源 → 事务 → 关闭

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use dataflow::config::ConfigurationCache;
use dataflow::context::{Application, ApplicationContext, LifecycleState, StartOptions};
use dataflow::datasource::{DataSourceContext, MemoryDriver, MemoryJournal};
use dataflow::errors::{ContextError, TransactionError};
use dataflow::infrastructure::{Module, Phase, WebPhase};
use dataflow::transaction::{tx, Propagation, TransactionDefinition};

const CONFIG: &str = r#"
app:
  name: orders
  greeting: env:DATAFLOW_TEST_UNSET_GREETING:hello
context:
  database:
    main:
      url: db://x
      pool_size: 2
    replica:
      url: db://y
"#;

#[derive(Debug, Error)]
enum OrderError {
    #[error("out of stock")]
    OutOfStock,
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

struct OrderService {
    app_name: Arc<Mutex<Option<String>>>,
}

struct OrderModule {
    events: Arc<Mutex<Vec<String>>>,
}

impl Module for OrderModule {
    fn name(&self) -> &str {
        "dataflow.application.orders"
    }

    fn register(&self, context: &ApplicationContext) -> anyhow::Result<()> {
        assert!(context.contains_bean("transactionManager"));
        context.register_bean(
            "orderService",
            Arc::new(OrderService {
                app_name: Arc::new(Mutex::new(Some(context.value("${app.name:unknown}")))),
            }),
        );
        self.events.lock().push("register:orders".to_string());
        Ok(())
    }
}

struct ReportModule;

impl Module for ReportModule {
    fn name(&self) -> &str {
        "dataflow.application.reports.daily"
    }

    fn register(&self, _context: &ApplicationContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn write_config(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("application.yaml");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

fn application(journal: &mut Option<Arc<MemoryJournal>>, events: &Arc<Mutex<Vec<String>>>) -> Application {
    let driver = MemoryDriver::with_schemes(&["db"]);
    *journal = Some(driver.journal());

    let log = events.clone();
    let web_log = events.clone();
    Application::with_cache(Arc::new(ConfigurationCache::new()))
        .driver(Arc::new(driver))
        .module(OrderModule {
            events: events.clone(),
        })
        .module(ReportModule)
        .listener(Phase::Loaded, move |event| -> anyhow::Result<()> {
            log.lock().push(format!("loaded:{}", event.modules.join(",")));
            Ok(())
        })
        .web_listener(WebPhase::Loaded, move |event| -> anyhow::Result<()> {
            web_log.lock().push(format!("web-loaded:{}", event.root.is_some()));
            Ok(())
        })
}

#[test]
fn test_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut journal = None;
    let mut app = application(&mut journal, &events);
    let journal = journal.unwrap();

    let ctx = app
        .start(StartOptions::new(&config, "dataflow.application.*"))
        .unwrap();
    assert_eq!(ctx.state(), LifecycleState::Loading);
    assert_eq!(
        *events.lock(),
        vec![
            "register:orders".to_string(),
            "loaded:dataflow.application.orders".to_string(),
            "web-loaded:false".to_string(),
        ]
    );
    assert_eq!(
        ctx.modules().registered_modules(),
        vec!["dataflow.module.context.datasource", "dataflow.application.orders"]
    );

    let service = ctx.resolve::<OrderService>("orderService").unwrap();
    assert_eq!(service.app_name.lock().as_deref(), Some("orders"));
    assert_eq!(ctx.value("${app.greeting}"), "hello");

    let main = DataSourceContext::get_ds(&ctx, Some("main")).unwrap();
    let default = DataSourceContext::get_ds(&ctx, None).unwrap();
    assert!(Arc::ptr_eq(&main, &default));
    assert!(ctx.contains_bean("replica"));

    app.started().unwrap();
    assert_eq!(ctx.state(), LifecycleState::Running);

    let definition = TransactionDefinition::new(Propagation::Required);
    tx(&ctx, &definition, |scope| -> Result<(), OrderError> {
        scope.execute("insert into orders values (1)")?;
        Ok(())
    })
    .unwrap();
    let failed = tx(&ctx, &definition, |scope| -> Result<(), OrderError> {
        scope.execute("insert into orders values (2)")?;
        Err(OrderError::OutOfStock)
    });
    assert!(matches!(failed, Err(OrderError::OutOfStock)));
    assert_eq!(journal.committed(), vec!["insert into orders values (1)".to_string()]);

    app.shutdown().unwrap();
    assert_eq!(ctx.state(), LifecycleState::Stopped);
    assert!(main.is_closed());
    assert!(DataSourceContext::get_ds(&ctx, Some("replica")).unwrap().is_closed());
}

#[test]
fn test_recursive_scan_and_repeated_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut journal = None;
    let mut app = application(&mut journal, &events);

    let first = app
        .start(StartOptions::new(&config, "dataflow.application.**"))
        .unwrap();
    assert_eq!(
        first.modules().registered_modules(),
        vec![
            "dataflow.module.context.datasource",
            "dataflow.application.orders",
            "dataflow.application.reports.daily",
        ]
    );

    let second = app
        .start(StartOptions::new(&config, "dataflow.application.**"))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(events.lock().iter().filter(|e| e.starts_with("register:")).count(), 1);
    assert_eq!(events.lock().iter().filter(|e| e.starts_with("web-loaded")).count(), 2);

    app.shutdown().unwrap();
}

#[test]
fn test_web_root_is_passed_to_listeners() {
    struct Router;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut journal = None;
    let mut app = application(&mut journal, &events);

    app.start(StartOptions::new(&config, "nothing.here").with_web_root(Arc::new(Router)))
        .unwrap();

    assert!(events.lock().contains(&"web-loaded:true".to_string()));
    assert!(app.web_context().unwrap().root_as::<Router>().is_some());
    app.shutdown().unwrap();
}

#[test]
fn test_startup_failure_leaves_no_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "context:\n  database:\n    main:\n      url: nope://x\n").unwrap();

    let mut app = Application::with_cache(Arc::new(ConfigurationCache::new()))
        .driver(Arc::new(MemoryDriver::with_schemes(&["db"])));

    let err = app.start(StartOptions::new(&path, "dataflow.application")).unwrap_err();
    assert!(matches!(err, ContextError::Startup { .. }));
    assert!(app.context().is_none());
    assert!(app.started().is_err());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = Application::with_cache(Arc::new(ConfigurationCache::new()));

    let err = app
        .start(StartOptions::new(dir.path().join("absent.yaml"), "dataflow.application"))
        .unwrap_err();
    assert!(matches!(err, ContextError::Config(_)));
}

#[test]
fn test_web_started_fires_before_application_started() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut journal = None;

    let app_log = events.clone();
    let web_log = events.clone();
    let mut app = application(&mut journal, &events)
        .listener(Phase::Started, move |event| -> anyhow::Result<()> {
            app_log.lock().push(format!("started:{}", event.context.state()));
            Ok(())
        })
        .web_listener(WebPhase::Started, move |_| -> anyhow::Result<()> {
            web_log.lock().push("web-started".to_string());
            Ok(())
        });

    app.start(StartOptions::new(&config, "nothing.here")).unwrap();
    app.started().unwrap();

    let log = events.lock().clone();
    let web = log.iter().position(|e| e == "web-started").unwrap();
    let started = log.iter().position(|e| e.starts_with("started:")).unwrap();
    assert!(web < started);
    assert_eq!(log[started], "started:Running");
    app.shutdown().unwrap();
}
