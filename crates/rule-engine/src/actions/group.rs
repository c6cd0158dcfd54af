//! 用户组变更执行器
//!
//! 将主体的用户组属性改为目标值；已在目标组时幂等跳过。

use automation_shared::database::Database;
use automation_shared::error::Result;
use sqlx::Row;
use tracing::debug;

use super::{ActionContext, missing_subject};
use crate::models::ActionOutcome;

const ACTION: &str = "USER_GROUP_CHANGE";

/// 用户组变更执行器
pub struct GroupChangeHandler {
    db: Database,
}

impl GroupChangeHandler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 将主体重新指派到目标用户组
    pub async fn reassign(&self, group_id: i64, ctx: &ActionContext) -> Result<ActionOutcome> {
        let Some(user_id) = ctx.subject_id else {
            return Ok(missing_subject(ACTION));
        };

        let result = sqlx::query(
            r#"
            UPDATE users
            SET group_id = $1, updated_at = NOW()
            WHERE id = $2 AND group_id IS DISTINCT FROM $1
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() > 0 {
            debug!(rule_id = ctx.rule_id, user_id, group_id, "用户组已变更");
            return Ok(ActionOutcome::ok_with(
                ACTION,
                format!("已变更到用户组 {group_id}"),
            ));
        }

        // 没有行受影响：要么已在目标组（幂等跳过），要么用户不存在
        let exists = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1) AS ok")
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?
            .get::<bool, _>("ok");

        if exists {
            debug!(user_id, group_id, "已在目标用户组，跳过");
            Ok(ActionOutcome::ok_with(ACTION, "已在目标用户组，跳过"))
        } else {
            Ok(ActionOutcome::failed(
                ACTION,
                format!("用户 {user_id} 不存在"),
            ))
        }
    }
}
