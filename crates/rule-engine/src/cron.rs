//! 定时规则调度
//!
//! 每条启用的 CRON 规则对应一个调度任务：解析其触发条件中的 cron
//! 表达式，循环计算下一次触发时刻并休眠到点，然后构造合成触发上下文
//! 直接调用规则引擎（时钟驱动，不经过事件总线）。
//!
//! 管理面（创建/编辑/删除规则）通过 add_task/remove_task/update_task
//! 将变更同步到在线调度，无需重启进程。非法表达式在配置时点被拒绝，
//! 规则保持未调度状态，不影响进程与其他规则。
//!
//! 部署约束：调度器假定单实例运行，多实例会导致定时规则重复触发
//! （无分布式选主，见部署文档）。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use automation_shared::error::{AutomationError, Result};
use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::engine::RuleEngine;
use crate::models::{Rule, TriggerType};
use crate::store::RuleStore;

/// 一条已调度的定时任务
struct CronJob {
    expression: String,
    handle: tokio::task::JoinHandle<()>,
}

/// 定时规则调度器
pub struct CronManager {
    engine: Arc<RuleEngine>,
    store: Arc<dyn RuleStore>,
    jobs: DashMap<i64, CronJob>,
}

impl CronManager {
    pub fn new(engine: Arc<RuleEngine>, store: Arc<dyn RuleStore>) -> Self {
        Self {
            engine,
            store,
            jobs: DashMap::new(),
        }
    }

    /// 进程启动时加载全部启用的 CRON 规则并逐条调度
    ///
    /// 单条规则的表达式非法只记日志并跳过，不影响其他规则的调度，
    /// 也不让初始化失败。
    pub async fn initialize(&self) -> Result<()> {
        let rules = self
            .store
            .load_rules_for_trigger(TriggerType::Cron, Utc::now())
            .await?;

        for rule in &rules {
            if let Err(e) = self.add_task(rule) {
                warn!(rule_id = rule.id, error = %e, "定时规则调度失败，保持未调度状态");
            }
        }

        info!(
            total = rules.len(),
            scheduled = self.jobs.len(),
            "定时规则调度完成"
        );
        Ok(())
    }

    /// 调度一条定时规则；已调度的同名规则被替换
    ///
    /// 表达式在此处解析校验，非法表达式直接拒绝，不产生调度任务。
    pub fn add_task(&self, rule: &Rule) -> Result<()> {
        let expression = rule
            .trigger_conditions
            .as_ref()
            .and_then(|c| c.cron_expression())
            .ok_or_else(|| AutomationError::InvalidRule {
                rule_id: rule.id,
                reason: "定时规则缺少 cron 表达式".to_string(),
            })?;

        let schedule = Schedule::from_str(expression).map_err(|e| {
            AutomationError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        // 编辑场景：先撤掉旧任务再按新表达式调度
        self.remove_task(rule.id);

        let rule_id = rule.id;
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    // 例如指定某个已过去的年份，表达式合法但不再有触发点
                    info!(rule_id, "cron 表达式无后续触发时刻，调度任务结束");
                    break;
                };

                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(rule_id, next = %next, "等待下一次定时触发");
                tokio::time::sleep(wait).await;

                let payload = json!({
                    "triggerType": "CRON",
                    "ruleId": rule_id,
                    "firedAt": Utc::now().to_rfc3339(),
                });

                if let Err(e) = engine.execute_single(rule_id, &payload).await {
                    error!(rule_id, error = %e, "定时规则执行失败");
                }
            }
        });

        self.jobs.insert(
            rule.id,
            CronJob {
                expression: expression.to_string(),
                handle,
            },
        );

        info!(rule_id = rule.id, expression, "定时规则已调度");
        Ok(())
    }

    /// 取消一条定时规则的调度；返回是否存在过
    pub fn remove_task(&self, rule_id: i64) -> bool {
        if let Some((_, job)) = self.jobs.remove(&rule_id) {
            job.handle.abort();
            info!(rule_id, "定时规则已取消调度");
            true
        } else {
            false
        }
    }

    /// 将管理面的规则变更同步到在线调度
    ///
    /// 禁用或软删除的规则仅移除；其余情况按新配置重新调度。
    pub fn update_task(&self, rule: &Rule) -> Result<()> {
        if !rule.is_enabled || rule.is_deleted {
            self.remove_task(rule.id);
            return Ok(());
        }
        self.add_task(rule)
    }

    /// 取消全部调度任务（优雅停机）
    pub fn stop_all(&self) {
        let count = self.jobs.len();
        for entry in self.jobs.iter() {
            entry.handle.abort();
        }
        self.jobs.clear();
        info!(count, "全部定时任务已停止");
    }

    /// 规则当前是否在调度中
    pub fn is_scheduled(&self, rule_id: i64) -> bool {
        self.jobs.contains_key(&rule_id)
    }

    /// 当前调度中的任务数
    pub fn scheduled_count(&self) -> usize {
        self.jobs.len()
    }

    /// 规则当前调度使用的表达式
    pub fn expression_of(&self, rule_id: i64) -> Option<String> {
        self.jobs.get(&rule_id).map(|job| job.expression.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MockActionExecutor;
    use crate::models::{Action, ActionOutcome, ExecutionStatus, TriggerCondition};
    use crate::store::MockRuleStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cron_rule(id: i64, expression: &str) -> Rule {
        Rule {
            id,
            name: format!("定时规则-{id}"),
            description: None,
            trigger_type: TriggerType::Cron,
            trigger_conditions: Some(TriggerCondition::Cron {
                expression: expression.to_string(),
            }),
            actions: vec![Action::CreditChange {
                delta: 1,
                reason: "daily_bonus".to_string(),
            }],
            priority: 0,
            is_enabled: true,
            is_repeatable: true,
            max_executions: None,
            cooldown_seconds: None,
            start_time: None,
            end_time: None,
            is_deleted: false,
        }
    }

    fn manager_with(store: MockRuleStore, actions: MockActionExecutor) -> CronManager {
        let store: Arc<dyn RuleStore> = Arc::new(store);
        let engine = Arc::new(RuleEngine::new(store.clone(), Arc::new(actions)));
        CronManager::new(engine, store)
    }

    #[tokio::test]
    async fn test_add_task_rejects_invalid_expression() {
        let manager = manager_with(MockRuleStore::new(), MockActionExecutor::new());

        let rule = cron_rule(1, "这不是表达式");
        let err = manager.add_task(&rule).unwrap_err();

        assert_eq!(err.code(), "INVALID_CRON_EXPRESSION");
        assert!(!manager.is_scheduled(1));
    }

    #[tokio::test]
    async fn test_add_task_requires_cron_condition() {
        let manager = manager_with(MockRuleStore::new(), MockActionExecutor::new());

        let mut rule = cron_rule(1, "0 0 9 * * *");
        rule.trigger_conditions = None;
        let err = manager.add_task(&rule).unwrap_err();

        assert_eq!(err.code(), "INVALID_RULE");
    }

    /// 初始化遇到非法表达式只跳过该规则，其余规则照常调度
    #[tokio::test]
    async fn test_initialize_survives_invalid_rule() {
        let mut store = MockRuleStore::new();
        store.expect_load_rules_for_trigger().returning(|_, _| {
            Ok(vec![cron_rule(1, "0 0 9 * * *"), cron_rule(2, "无效表达式")])
        });

        let manager = manager_with(store, MockActionExecutor::new());
        manager.initialize().await.unwrap();

        assert!(manager.is_scheduled(1));
        assert!(!manager.is_scheduled(2));
        assert_eq!(manager.scheduled_count(), 1);

        manager.stop_all();
    }

    #[tokio::test]
    async fn test_remove_and_update_lifecycle() {
        let manager = manager_with(MockRuleStore::new(), MockActionExecutor::new());

        let rule = cron_rule(1, "0 0 9 * * *");
        manager.add_task(&rule).unwrap();
        assert!(manager.is_scheduled(1));
        assert_eq!(manager.expression_of(1).as_deref(), Some("0 0 9 * * *"));

        // 编辑表达式：重新调度
        let updated = cron_rule(1, "0 30 8 * * *");
        manager.update_task(&updated).unwrap();
        assert_eq!(manager.expression_of(1).as_deref(), Some("0 30 8 * * *"));
        assert_eq!(manager.scheduled_count(), 1);

        // 禁用：仅移除
        let mut disabled = cron_rule(1, "0 30 8 * * *");
        disabled.is_enabled = false;
        manager.update_task(&disabled).unwrap();
        assert!(!manager.is_scheduled(1));

        // 幂等移除
        assert!(!manager.remove_task(1));
    }

    #[tokio::test]
    async fn test_stop_all_clears_jobs() {
        let manager = manager_with(MockRuleStore::new(), MockActionExecutor::new());

        manager.add_task(&cron_rule(1, "0 0 9 * * *")).unwrap();
        manager.add_task(&cron_rule(2, "0 0 10 * * *")).unwrap();
        assert_eq!(manager.scheduled_count(), 2);

        manager.stop_all();
        assert_eq!(manager.scheduled_count(), 0);
    }

    /// 每秒触发的表达式在等待窗口内至少驱动引擎一次
    #[tokio::test]
    async fn test_tick_invokes_engine_for_single_rule() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        let fired = Arc::new(AtomicU32::new(0));

        let rule = cron_rule(1, "* * * * * *");
        let get_rule = rule.clone();
        store
            .expect_get_rule()
            .returning(move |_| Ok(Some(get_rule.clone())));

        let counter = fired.clone();
        actions.expect_execute().returning(move |_, ctx| {
            // 合成触发没有主体
            assert_eq!(ctx.subject_id, None);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutcome::ok("CREDIT_CHANGE"))
        });
        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Success
                    && log.triggered_by.is_none()
                    && log.trigger_context["triggerType"] == "CRON"
            })
            .returning(|_| Ok(1));

        let manager = manager_with(store, actions);
        manager.add_task(&rule).unwrap();

        tokio::time::sleep(Duration::from_millis(3000)).await;
        manager.stop_all();

        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
