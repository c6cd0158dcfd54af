//! 徽章授予/撤销执行器
//!
//! 两个方向都是幂等的：授予时已持有、撤销时未持有，返回带说明的
//! 成功结果而非报错。幂等性由存储约束保证（用户 + 徽章唯一，撤销
//! 为软删除），并发重复投递下也不会产生重复持有记录。

use automation_shared::database::Database;
use automation_shared::error::Result;
use tracing::debug;

use super::{ActionContext, missing_subject};
use crate::models::ActionOutcome;

const GRANT: &str = "BADGE_GRANT";
const REVOKE: &str = "BADGE_REVOKE";

/// 徽章动作执行器
pub struct BadgeActionHandler {
    db: Database,
}

impl BadgeActionHandler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 授予徽章；已持有时跳过
    ///
    /// upsert 的更新分支仅在持有记录已被软撤销时生效（重新授予），
    /// 正常持有时不影响任何行，以 rows_affected 区分两种情况。
    pub async fn grant(&self, badge_id: i64, ctx: &ActionContext) -> Result<ActionOutcome> {
        let Some(user_id) = ctx.subject_id else {
            return Ok(missing_subject(GRANT));
        };

        let result = sqlx::query(
            r#"
            INSERT INTO user_badges (user_id, badge_id, awarded_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id, badge_id) DO UPDATE
                SET awarded_at = NOW(), revoked_at = NULL
                WHERE user_badges.revoked_at IS NOT NULL
            "#,
        )
        .bind(user_id)
        .bind(badge_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(user_id, badge_id, "徽章已持有，跳过授予");
            return Ok(ActionOutcome::ok_with(GRANT, "已持有，跳过"));
        }

        debug!(rule_id = ctx.rule_id, user_id, badge_id, "徽章已授予");
        Ok(ActionOutcome::ok_with(GRANT, format!("已授予徽章 {badge_id}")))
    }

    /// 撤销徽章；未持有时跳过
    pub async fn revoke(&self, badge_id: i64, ctx: &ActionContext) -> Result<ActionOutcome> {
        let Some(user_id) = ctx.subject_id else {
            return Ok(missing_subject(REVOKE));
        };

        let result = sqlx::query(
            r#"
            UPDATE user_badges
            SET revoked_at = NOW()
            WHERE user_id = $1 AND badge_id = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(badge_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(user_id, badge_id, "徽章未持有，跳过撤销");
            return Ok(ActionOutcome::ok_with(REVOKE, "未持有，跳过"));
        }

        debug!(rule_id = ctx.rule_id, user_id, badge_id, "徽章已撤销");
        Ok(ActionOutcome::ok_with(REVOKE, format!("已撤销徽章 {badge_id}")))
    }
}
