//! 动作执行策略
//!
//! 每种动作类型一个执行器，统一返回结构化的 [`ActionOutcome`]：
//! 预期内的"无事可做"（徽章已持有、已在目标用户组）是带说明的成功，
//! 只有数据层故障才作为错误向上传播。投递是至少一次的，不具备天然
//! 幂等性的动作（积分调整）由规则引擎的资格闸门兜底。

mod badge;
mod credit;
mod group;

use async_trait::async_trait;
use automation_shared::database::Database;
use automation_shared::error::Result;
use serde_json::Value;

use crate::models::{Action, ActionOutcome};

pub use badge::BadgeActionHandler;
pub use credit::CreditChangeHandler;
pub use group::GroupChangeHandler;

/// 动作执行上下文
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub rule_id: i64,
    /// 触发主体（用户 ID）；CRON 合成触发可能没有
    pub subject_id: Option<i64>,
    /// 触发事件负载，供需要额外字段的执行器取用
    pub payload: Value,
}

/// 动作执行器接口
///
/// 引擎只依赖此抽象；测试中以 mock 替换，验证引擎逻辑无需数据库。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 执行单个动作并返回结构化结果
    async fn execute(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome>;
}

// ---------------------------------------------------------------------------
// ActionRegistry — 按动作类型分发的注册表
// ---------------------------------------------------------------------------

/// 动作注册表：持有各类型的执行器，按动作变体分发
pub struct ActionRegistry {
    credit: CreditChangeHandler,
    badge: BadgeActionHandler,
    group: GroupChangeHandler,
}

impl ActionRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            credit: CreditChangeHandler::new(db.clone()),
            badge: BadgeActionHandler::new(db.clone()),
            group: GroupChangeHandler::new(db),
        }
    }
}

#[async_trait]
impl ActionExecutor for ActionRegistry {
    async fn execute(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
        match action {
            Action::CreditChange { delta, reason } => {
                self.credit.apply(*delta, reason, ctx).await
            }
            Action::BadgeGrant { badge_id } => self.badge.grant(*badge_id, ctx).await,
            Action::BadgeRevoke { badge_id } => self.badge.revoke(*badge_id, ctx).await,
            Action::UserGroupChange { group_id } => self.group.reassign(*group_id, ctx).await,
        }
    }
}

/// 需要主体的动作在缺少主体时的统一失败结果
pub(crate) fn missing_subject(action: &str) -> ActionOutcome {
    ActionOutcome::failed(action, "事件缺少触发主体，无法执行")
}
