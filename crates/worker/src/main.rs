//! 自动化 worker 入口
//!
//! 装配顺序：配置 -> 日志 -> 数据库/Redis 连接（带启动重试）->
//! 规则引擎 -> 事件总线（注册全部业务事件的触发处理器）-> 定时调度。
//! 收到退出信号后协作式停机：总线完成当前批次，调度任务全部取消。

use std::sync::Arc;

use automation_bus::EventBus;
use automation_shared::config::AppConfig;
use automation_shared::database::Database;
use automation_shared::events::ALL_EVENT_TYPES;
use automation_shared::observability;
use automation_shared::redis::RedisConn;
use automation_shared::retry::{RetryPolicy, retry_with_policy};
use automation_worker::trigger::RuleTriggerHandler;
use rule_engine::store::RuleStore;
use rule_engine::{ActionRegistry, CronManager, PgRuleStore, RuleEngine};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("automation-worker")?;
    observability::init(&config.observability)?;

    info!(
        environment = %config.environment,
        bus_mode = %config.bus.mode,
        "automation-worker 启动中"
    );

    // 依赖服务可能晚于本进程就绪，带退避重试
    let retry = RetryPolicy::default();
    let db = retry_with_policy(&retry, "数据库连接", || {
        let database = config.database.clone();
        async move { Database::connect(&database).await }
    })
    .await?;

    let redis = RedisConn::new(&config.redis)?;
    retry_with_policy(&retry, "Redis 连接检查", || {
        let redis = redis.clone();
        async move { redis.health_check().await }
    })
    .await?;

    // 规则引擎：存储 + 动作注册表
    let store: Arc<dyn RuleStore> = Arc::new(PgRuleStore::new(db.clone()));
    let actions = Arc::new(ActionRegistry::new(db.clone()));
    let engine = Arc::new(RuleEngine::new(store.clone(), actions));

    // 事件总线：每个业务事件类型挂接规则引擎触发处理器
    let bus = EventBus::from_config(&config.bus, redis.clone())?;
    for event_type in ALL_EVENT_TYPES {
        bus.on(event_type, Arc::new(RuleTriggerHandler::new(engine.clone())))
            .await;
    }
    bus.initialize().await?;

    // 定时规则调度（假定单实例，见部署文档）
    let cron = CronManager::new(engine.clone(), store.clone());
    cron.initialize().await?;

    info!("automation-worker 已就绪");

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅停机");

    bus.stop().await;
    cron.stop_all();
    db.close().await;

    info!("automation-worker 已退出");
    Ok(())
}
