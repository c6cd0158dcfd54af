//! 自动化规则引擎
//!
//! 根据触发事件加载候选规则、逐条判定执行资格（条件谓词、不可重复、
//! 次数上限、冷却间隔）、按序执行配置的动作（积分调整、徽章授予/
//! 撤销、用户组变更），并为每次评估写入一条只追加的执行日志。
//!
//! 定时（CRON）规则由 [`cron::CronManager`] 维护，每条规则一个调度
//! 任务，到点直接调用引擎，不经过事件总线。

pub mod actions;
pub mod cron;
pub mod engine;
pub mod models;
pub mod store;

pub use actions::{ActionContext, ActionExecutor, ActionRegistry};
pub use cron::CronManager;
pub use engine::RuleEngine;
pub use models::{
    Action, ActionOutcome, ExecutionStatus, NewExecutionLog, Rule, TriggerCondition, TriggerType,
};
pub use store::{PgRuleStore, RuleStore};
