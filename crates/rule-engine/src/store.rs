//! 规则与执行日志的存储层
//!
//! 以 trait 定义存储接口，便于引擎依赖抽象而非具体实现，支持 mock
//! 测试；生产实现基于 PostgreSQL，规则的条件与动作以 JSONB 存储。

use async_trait::async_trait;
use automation_shared::database::Database;
use automation_shared::error::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::warn;

use crate::models::{NewExecutionLog, Rule, TriggerCondition, TriggerType};

/// 规则存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// 加载某触发类型的候选规则
    ///
    /// 只返回启用、未软删除、且 `now` 落在活动窗口内的规则，
    /// 按 priority 降序排列，同优先级按 id 升序保证确定性。
    async fn load_rules_for_trigger(
        &self,
        trigger: TriggerType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rule>>;

    /// 按 ID 读取单条规则（含已禁用的，便于调度路径自行判定）
    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>>;

    /// 追加一条执行日志，返回日志 ID；日志写入后不再修改
    async fn insert_execution_log(&self, log: &NewExecutionLog) -> Result<i64>;

    /// 该规则的成功执行总次数
    async fn count_success(&self, rule_id: i64) -> Result<i64>;

    /// 最近一次成功执行的时间
    ///
    /// `subject` 为 Some 时按规则 + 主体范围查询（冷却按人计算），
    /// 为 None 时按规则全局查询（无主体的 CRON 触发）。
    async fn last_success_at(
        &self,
        rule_id: i64,
        subject: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>>;
}

// ---------------------------------------------------------------------------
// PgRuleStore — PostgreSQL 实现
// ---------------------------------------------------------------------------

/// 数据库中的规则行，JSONB 字段在转换为领域模型时解析
#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    name: String,
    description: Option<String>,
    trigger_type: String,
    trigger_conditions: Option<serde_json::Value>,
    actions: serde_json::Value,
    priority: i32,
    is_enabled: bool,
    is_repeatable: bool,
    max_executions: Option<i32>,
    cooldown_seconds: Option<i64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    is_deleted: bool,
}

impl RuleRow {
    /// 解析为领域模型；触发类型或 JSONB 字段非法时返回原因
    fn into_rule(self) -> std::result::Result<Rule, String> {
        let trigger_type: TriggerType = self
            .trigger_type
            .parse()
            .map_err(|e| format!("触发类型非法: {e}"))?;

        let trigger_conditions: Option<TriggerCondition> = self
            .trigger_conditions
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("触发条件解析失败: {e}"))?;

        let actions = serde_json::from_value(self.actions)
            .map_err(|e| format!("动作列表解析失败: {e}"))?;

        Ok(Rule {
            id: self.id,
            name: self.name,
            description: self.description,
            trigger_type,
            trigger_conditions,
            actions,
            priority: self.priority,
            is_enabled: self.is_enabled,
            is_repeatable: self.is_repeatable,
            max_executions: self.max_executions,
            cooldown_seconds: self.cooldown_seconds,
            start_time: self.start_time,
            end_time: self.end_time,
            is_deleted: self.is_deleted,
        })
    }
}

const RULE_COLUMNS: &str = r#"
    id, name, description, trigger_type, trigger_conditions, actions,
    priority, is_enabled, is_repeatable, max_executions, cooldown_seconds,
    start_time, end_time, is_deleted
"#;

/// 规则存储的 PostgreSQL 实现
#[derive(Clone)]
pub struct PgRuleStore {
    db: Database,
}

impl PgRuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn load_rules_for_trigger(
        &self,
        trigger: TriggerType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM rules
            WHERE trigger_type = $1
              AND is_enabled = TRUE
              AND is_deleted = FALSE
              AND (start_time IS NULL OR start_time <= $2)
              AND (end_time IS NULL OR end_time >= $2)
            ORDER BY priority DESC, id ASC
            "#
        ))
        .bind(trigger.as_str())
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;

        // 单条规则的配置损坏不应让整个触发类型失效：跳过并告警
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id = row.id;
            match row.into_rule() {
                Ok(rule) => rules.push(rule),
                Err(reason) => {
                    warn!(rule_id, reason, "规则行解析失败，已跳过");
                }
            }
        }

        Ok(rules)
    }

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM rules
            WHERE id = $1
            "#
        ))
        .bind(rule_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            None => Ok(None),
            Some(row) => match row.into_rule() {
                Ok(rule) => Ok(Some(rule)),
                Err(reason) => {
                    warn!(rule_id, reason, "规则行解析失败");
                    Ok(None)
                }
            },
        }
    }

    async fn insert_execution_log(&self, log: &NewExecutionLog) -> Result<i64> {
        let execution_result = serde_json::to_value(&log.execution_result)
            .unwrap_or(serde_json::Value::Null);

        let row = sqlx::query(
            r#"
            INSERT INTO rule_execution_logs (
                rule_id, triggered_by, trigger_context, execution_status,
                execution_result, error_message, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(log.rule_id)
        .bind(log.triggered_by)
        .bind(&log.trigger_context)
        .bind(log.execution_status.as_str())
        .bind(execution_result)
        .bind(&log.error_message)
        .bind(log.executed_at)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get::<i64, _>("id"))
    }

    async fn count_success(&self, rule_id: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt
            FROM rule_execution_logs
            WHERE rule_id = $1 AND execution_status = 'SUCCESS'
            "#,
        )
        .bind(rule_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get::<i64, _>("cnt"))
    }

    async fn last_success_at(
        &self,
        rule_id: i64,
        subject: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT executed_at
            FROM rule_execution_logs
            WHERE rule_id = $1
              AND execution_status = 'SUCCESS'
              AND ($2::BIGINT IS NULL OR triggered_by = $2)
            ORDER BY executed_at DESC
            LIMIT 1
            "#,
        )
        .bind(rule_id)
        .bind(subject)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| r.get::<DateTime<Utc>, _>("executed_at")))
    }
}
