//! 积分调整执行器
//!
//! 在单个事务内完成余额更新与流水记账：两者要么同时可见要么都不
//! 发生，并发读取方不会看到只改了余额没有流水的中间状态。
//! 本执行器不具备天然幂等性，同一触发事件的重复投递由规则引擎的
//! 不可重复/次数上限/冷却闸门拦截。

use automation_shared::database::Database;
use automation_shared::error::Result;
use tracing::{debug, warn};

use super::{ActionContext, missing_subject};
use crate::models::ActionOutcome;

const ACTION: &str = "CREDIT_CHANGE";

/// 积分调整执行器
pub struct CreditChangeHandler {
    db: Database,
}

impl CreditChangeHandler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 对主体余额应用带符号增量并写入一条流水
    pub async fn apply(
        &self,
        delta: i64,
        reason: &str,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome> {
        let Some(user_id) = ctx.subject_id else {
            return Ok(missing_subject(ACTION));
        };

        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE users
            SET credits = credits + $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(delta)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            warn!(rule_id = ctx.rule_id, user_id, "积分调整目标用户不存在");
            return Ok(ActionOutcome::failed(
                ACTION,
                format!("用户 {user_id} 不存在"),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO credit_ledger (user_id, delta, reason, rule_id, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .bind(reason)
        .bind(ctx.rule_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(rule_id = ctx.rule_id, user_id, delta, reason, "积分已调整");
        Ok(ActionOutcome::ok_with(
            ACTION,
            format!("积分调整 {delta:+}（{reason}）"),
        ))
    }
}
