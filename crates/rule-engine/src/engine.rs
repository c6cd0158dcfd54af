//! 规则引擎
//!
//! 对一次触发（业务事件或 CRON 合成触发）执行完整的评估流程：
//! 加载候选规则 -> 逐条判定资格 -> 按序执行动作 -> 写入执行日志。
//!
//! 评估资格的四道闸门按序生效：条件谓词、不可重复、次数上限、冷却
//! 间隔。条件谓词不匹配静默跳过（不写日志），后三道闸门拦截时写
//! SKIPPED 日志——这一策略全局一致。
//!
//! 单条规则的任何异常（条件求值、日志落库）都被捕获并记为 FAILED，
//! 绝不阻断同一触发下其他规则的评估。

use std::sync::Arc;

use automation_shared::error::{AutomationError, Result};
use automation_shared::events::subject_id;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionContext, ActionExecutor};
use crate::models::{ActionOutcome, ExecutionStatus, NewExecutionLog, Rule, TriggerType};
use crate::store::RuleStore;

/// 规则引擎
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    actions: Arc<dyn ActionExecutor>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, actions: Arc<dyn ActionExecutor>) -> Self {
        Self { store, actions }
    }

    /// 对一次触发评估全部候选规则
    ///
    /// 候选集由存储层按优先级降序（同优先级按 ID 升序）给出；
    /// 一次触发可能产生零到多条执行日志，规则之间彼此独立。
    pub async fn execute_for_trigger(&self, trigger: TriggerType, payload: &Value) -> Result<()> {
        let now = Utc::now();
        let rules = self.store.load_rules_for_trigger(trigger, now).await?;

        if rules.is_empty() {
            debug!(trigger = %trigger, "无候选规则");
            return Ok(());
        }

        debug!(trigger = %trigger, candidates = rules.len(), "开始评估候选规则");

        for rule in &rules {
            self.evaluate_guarded(rule, payload, now).await;
        }

        Ok(())
    }

    /// 评估单条规则（定时调度路径）
    ///
    /// 调度任务到点后直接作用于自己那一条规则，不加载完整候选集，
    /// 一条规则的调度漂移不会影响其他规则的计时。触发时刻重新校验
    /// 规则的启用与活动窗口状态。
    pub async fn execute_single(&self, rule_id: i64, payload: &Value) -> Result<()> {
        let now = Utc::now();

        let Some(rule) = self.store.get_rule(rule_id).await? else {
            warn!(rule_id, "规则不存在，跳过定时执行");
            return Ok(());
        };

        if !rule.is_active_at(now) {
            debug!(rule_id, "规则当前不可用，跳过定时执行");
            return Ok(());
        }

        self.evaluate_guarded(&rule, payload, now).await;
        Ok(())
    }

    /// 评估单条规则并隔离其异常
    ///
    /// 任何错误都被捕获并尽力记为 FAILED 日志，不向调用方传播，
    /// 一条规则的配置缺陷不得阻断其他规则的触发。
    async fn evaluate_guarded(&self, rule: &Rule, payload: &Value, now: DateTime<Utc>) {
        if let Err(e) = self.evaluate_rule(rule, payload, now).await {
            error!(rule_id = rule.id, error = %e, "规则评估异常");

            let log = NewExecutionLog {
                rule_id: rule.id,
                triggered_by: subject_id(payload),
                trigger_context: payload.clone(),
                execution_status: ExecutionStatus::Failed,
                execution_result: vec![],
                error_message: Some(e.to_string()),
                executed_at: now,
            };
            if let Err(le) = self.store.insert_execution_log(&log).await {
                error!(rule_id = rule.id, error = %le, "FAILED 执行日志写入失败");
            }
        }
    }

    async fn evaluate_rule(&self, rule: &Rule, payload: &Value, now: DateTime<Utc>) -> Result<()> {
        let subject = subject_id(payload);

        // 闸门 (a)：条件谓词，不匹配静默跳过
        if let Some(cond) = &rule.trigger_conditions {
            if !cond.matches_trigger_type(rule.trigger_type) {
                return Err(AutomationError::InvalidRule {
                    rule_id: rule.id,
                    reason: format!("触发条件与触发类型 {} 不一致", rule.trigger_type),
                });
            }
            if !cond.matches(payload) {
                debug!(rule_id = rule.id, "触发条件不匹配，跳过");
                return Ok(());
            }
        }

        // 闸门 (b)(c)：不可重复 / 成功次数上限，共用一次计数查询
        if !rule.is_repeatable || rule.max_executions.is_some() {
            let succeeded = self.store.count_success(rule.id).await?;

            if !rule.is_repeatable && succeeded > 0 {
                return self
                    .write_skip(rule, subject, payload, now, "不可重复的规则已有成功执行记录")
                    .await;
            }

            if let Some(max) = rule.max_executions
                && succeeded >= max as i64
            {
                return self
                    .write_skip(rule, subject, payload, now, format!("已达成功执行次数上限 {max}"))
                    .await;
            }
        }

        // 闸门 (d)：冷却间隔。带主体的事件按规则 + 主体计，
        // 无主体（CRON）按规则全局计
        if let Some(cooldown) = rule.cooldown_seconds
            && let Some(last) = self.store.last_success_at(rule.id, subject).await?
        {
            let elapsed = (now - last).num_seconds();
            if elapsed < cooldown {
                return self
                    .write_skip(
                        rule,
                        subject,
                        payload,
                        now,
                        format!("冷却期内（距上次成功 {elapsed} 秒，需 {cooldown} 秒）"),
                    )
                    .await;
            }
        }

        // 按序执行动作；动作彼此独立，单个失败不阻断后续动作
        let ctx = ActionContext {
            rule_id: rule.id,
            subject_id: subject,
            payload: payload.clone(),
        };

        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            match self.actions.execute(action, &ctx).await {
                Ok(outcome) => {
                    if !outcome.success {
                        warn!(
                            rule_id = rule.id,
                            action = %outcome.action,
                            message = ?outcome.message,
                            "动作执行失败，继续后续动作"
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(
                        rule_id = rule.id,
                        action = action.kind(),
                        error = %e,
                        "动作执行异常，继续后续动作"
                    );
                    outcomes.push(ActionOutcome::failed(action.kind(), e.to_string()));
                }
            }
        }

        let failures: Vec<&ActionOutcome> = outcomes.iter().filter(|o| !o.success).collect();
        let (status, error_message) = if failures.is_empty() {
            (ExecutionStatus::Success, None)
        } else {
            let msg = failures
                .iter()
                .map(|o| {
                    format!("{}: {}", o.action, o.message.as_deref().unwrap_or("未知错误"))
                })
                .collect::<Vec<_>>()
                .join("; ");
            (ExecutionStatus::Failed, Some(msg))
        };

        let log = NewExecutionLog {
            rule_id: rule.id,
            triggered_by: subject,
            trigger_context: payload.clone(),
            execution_status: status,
            execution_result: outcomes,
            error_message,
            executed_at: now,
        };
        self.store.insert_execution_log(&log).await?;

        info!(
            rule_id = rule.id,
            rule_name = %rule.name,
            status = %status,
            "规则评估完成"
        );
        Ok(())
    }

    /// 写入一条 SKIPPED 日志（资格闸门拦截时）
    async fn write_skip(
        &self,
        rule: &Rule,
        subject: Option<i64>,
        payload: &Value,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let reason = reason.into();
        debug!(rule_id = rule.id, reason = %reason, "规则被资格闸门拦截");

        let log = NewExecutionLog {
            rule_id: rule.id,
            triggered_by: subject,
            trigger_context: payload.clone(),
            execution_status: ExecutionStatus::Skipped,
            execution_result: vec![],
            error_message: Some(reason),
            executed_at: now,
        };
        self.store.insert_execution_log(&log).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MockActionExecutor;
    use crate::models::{Action, TriggerCondition};
    use crate::store::MockRuleStore;
    use chrono::Duration;
    use mockall::predicate::eq;
    use parking_lot::Mutex;
    use serde_json::json;

    fn make_rule(id: i64, priority: i32) -> Rule {
        Rule {
            id,
            name: format!("规则-{id}"),
            description: None,
            trigger_type: TriggerType::Checkin,
            trigger_conditions: None,
            actions: vec![Action::CreditChange {
                delta: 10,
                reason: "checkin_reward".to_string(),
            }],
            priority,
            is_enabled: true,
            is_repeatable: true,
            max_executions: None,
            cooldown_seconds: None,
            start_time: None,
            end_time: None,
            is_deleted: false,
        }
    }

    fn engine(store: MockRuleStore, actions: MockActionExecutor) -> RuleEngine {
        RuleEngine::new(Arc::new(store), Arc::new(actions))
    }

    /// 高优先级规则的动作先被执行
    #[tokio::test]
    async fn test_rules_executed_in_priority_order() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        // 存储层按约定以优先级降序返回
        store
            .expect_load_rules_for_trigger()
            .returning(|_, _| Ok(vec![make_rule(1, 10), make_rule(2, 5)]));

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = order.clone();
        actions.expect_execute().returning(move |_, ctx| {
            record.lock().push(ctx.rule_id);
            Ok(ActionOutcome::ok("CREDIT_CHANGE"))
        });

        store
            .expect_insert_execution_log()
            .times(2)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    /// 不可重复规则已有成功记录时写 SKIPPED，不执行动作
    #[tokio::test]
    async fn test_non_repeatable_rule_skipped_after_success() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new(); // 不设期望：被调用即失败

        let mut rule = make_rule(1, 0);
        rule.is_repeatable = false;
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        store
            .expect_count_success()
            .with(eq(1))
            .returning(|_| Ok(1));
        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Skipped
                    && log.execution_result.is_empty()
                    && log.triggered_by == Some(42)
            })
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 达到成功次数上限后写 SKIPPED
    #[tokio::test]
    async fn test_max_executions_gate() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.max_executions = Some(2);
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        store.expect_count_success().returning(|_| Ok(2));
        store
            .expect_insert_execution_log()
            .withf(|log| log.execution_status == ExecutionStatus::Skipped)
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 冷却期内写 SKIPPED；冷却范围按规则 + 主体查询
    #[tokio::test]
    async fn test_cooldown_gate_inside_window() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.cooldown_seconds = Some(86_400);
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        store
            .expect_last_success_at()
            .with(eq(1), eq(Some(42)))
            .returning(|_, _| Ok(Some(Utc::now() - Duration::hours(1))));
        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Skipped
                    && log.error_message.as_deref().unwrap().contains("冷却期内")
            })
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 冷却期已过则正常执行
    #[tokio::test]
    async fn test_cooldown_gate_expired_allows_execution() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.cooldown_seconds = Some(3600);
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        store
            .expect_last_success_at()
            .returning(|_, _| Ok(Some(Utc::now() - Duration::hours(2))));
        actions
            .expect_execute()
            .times(1)
            .returning(|_, _| Ok(ActionOutcome::ok("CREDIT_CHANGE")));
        store
            .expect_insert_execution_log()
            .withf(|log| log.execution_status == ExecutionStatus::Success)
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 条件谓词不匹配：静默跳过，不写日志、不执行动作
    #[tokio::test]
    async fn test_condition_mismatch_writes_no_log() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.trigger_type = TriggerType::Donation;
        rule.trigger_conditions = Some(TriggerCondition::Donation {
            min_amount: Some(1000),
        });
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        // 不对 insert_execution_log 设置期望：被调用即 panic

        engine(store, actions)
            .execute_for_trigger(TriggerType::Donation, &json!({ "userId": 42, "amount": 500 }))
            .await
            .unwrap();
    }

    /// 条件变体与触发类型不一致是配置缺陷：记 FAILED 日志
    #[tokio::test]
    async fn test_condition_trigger_mismatch_logged_as_failed() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.trigger_conditions = Some(TriggerCondition::Donation {
            min_amount: Some(1000),
        });
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));
        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Failed
                    && log.error_message.as_deref().unwrap().contains("不一致")
            })
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 前一个动作失败不阻断后续动作，整体状态为 FAILED
    #[tokio::test]
    async fn test_action_failure_continues_and_marks_failed() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        let mut rule = make_rule(1, 0);
        rule.actions = vec![
            Action::CreditChange {
                delta: 10,
                reason: "reward".to_string(),
            },
            Action::BadgeGrant { badge_id: 7 },
        ];
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![rule.clone()]));

        let executed = Arc::new(Mutex::new(Vec::new()));
        let record = executed.clone();
        actions.expect_execute().returning(move |action, _| {
            record.lock().push(action.kind().to_string());
            match action {
                Action::CreditChange { .. } => Err(AutomationError::Internal("存储故障".to_string())),
                _ => Ok(ActionOutcome::ok("BADGE_GRANT")),
            }
        });

        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Failed
                    && log.execution_result.len() == 2
                    && !log.execution_result[0].success
                    && log.execution_result[1].success
            })
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();

        // 第一个动作失败后第二个仍被执行
        assert_eq!(
            *executed.lock(),
            vec!["CREDIT_CHANGE".to_string(), "BADGE_GRANT".to_string()]
        );
    }

    /// 一条规则评估异常不阻断下一条规则
    #[tokio::test]
    async fn test_rule_error_isolation() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        let mut broken = make_rule(1, 10);
        broken.is_repeatable = false; // 触发 count_success 查询
        let healthy = make_rule(2, 5);
        store
            .expect_load_rules_for_trigger()
            .returning(move |_, _| Ok(vec![broken.clone(), healthy.clone()]));

        // 规则 1 的计数查询抛异常
        store
            .expect_count_success()
            .with(eq(1))
            .returning(|_| Err(AutomationError::Internal("存储故障".to_string())));

        // 规则 2 照常执行
        actions
            .expect_execute()
            .times(1)
            .returning(|_, ctx| {
                assert_eq!(ctx.rule_id, 2);
                Ok(ActionOutcome::ok("CREDIT_CHANGE"))
            });

        // 规则 1 记 FAILED，规则 2 记 SUCCESS
        store
            .expect_insert_execution_log()
            .withf(|log| log.rule_id == 1 && log.execution_status == ExecutionStatus::Failed)
            .times(1)
            .returning(|_| Ok(1));
        store
            .expect_insert_execution_log()
            .withf(|log| log.rule_id == 2 && log.execution_status == ExecutionStatus::Success)
            .times(1)
            .returning(|_| Ok(2));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42 }))
            .await
            .unwrap();
    }

    /// 定时路径：触发时刻重新校验规则可用性
    #[tokio::test]
    async fn test_execute_single_rechecks_active_state() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        let mut disabled = make_rule(1, 0);
        disabled.trigger_type = TriggerType::Cron;
        disabled.is_enabled = false;
        store
            .expect_get_rule()
            .with(eq(1))
            .returning(move |_| Ok(Some(disabled.clone())));

        // 规则已禁用：不执行动作、不写日志
        engine(store, actions)
            .execute_single(1, &json!({ "triggerType": "CRON", "ruleId": 1 }))
            .await
            .unwrap();
    }

    /// 定时路径：规则不存在时静默返回
    #[tokio::test]
    async fn test_execute_single_missing_rule() {
        let mut store = MockRuleStore::new();
        let actions = MockActionExecutor::new();

        store.expect_get_rule().returning(|_| Ok(None));

        engine(store, actions)
            .execute_single(99, &json!({ "triggerType": "CRON", "ruleId": 99 }))
            .await
            .unwrap();
    }

    /// 签到场景：匹配的规则产生一条 SUCCESS 日志，主体正确
    #[tokio::test]
    async fn test_checkin_success_scenario() {
        let mut store = MockRuleStore::new();
        let mut actions = MockActionExecutor::new();

        store
            .expect_load_rules_for_trigger()
            .with(eq(TriggerType::Checkin), mockall::predicate::always())
            .returning(|_, _| Ok(vec![make_rule(1, 0)]));
        actions
            .expect_execute()
            .times(1)
            .returning(|_, _| Ok(ActionOutcome::ok_with("CREDIT_CHANGE", "积分调整 +10")));
        store
            .expect_insert_execution_log()
            .withf(|log| {
                log.execution_status == ExecutionStatus::Success
                    && log.triggered_by == Some(42)
                    && log.execution_result.len() == 1
                    && log.error_message.is_none()
            })
            .times(1)
            .returning(|_| Ok(1));

        engine(store, actions)
            .execute_for_trigger(TriggerType::Checkin, &json!({ "userId": 42, "streak": 3 }))
            .await
            .unwrap();
    }
}
