//! 规则引擎领域模型

use automation_shared::events::EventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// TriggerType — 触发类型
// ---------------------------------------------------------------------------

/// 规则的触发类型：八种业务事件，外加时钟驱动的 CRON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Cron,
    PostCreate,
    PostReply,
    Checkin,
    Donation,
    PostLikeGiven,
    PostLikeReceived,
    UserRegister,
    UserLogin,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "CRON",
            Self::PostCreate => "POST_CREATE",
            Self::PostReply => "POST_REPLY",
            Self::Checkin => "CHECKIN",
            Self::Donation => "DONATION",
            Self::PostLikeGiven => "POST_LIKE_GIVEN",
            Self::PostLikeReceived => "POST_LIKE_RECEIVED",
            Self::UserRegister => "USER_REGISTER",
            Self::UserLogin => "USER_LOGIN",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRON" => Ok(Self::Cron),
            "POST_CREATE" => Ok(Self::PostCreate),
            "POST_REPLY" => Ok(Self::PostReply),
            "CHECKIN" => Ok(Self::Checkin),
            "DONATION" => Ok(Self::Donation),
            "POST_LIKE_GIVEN" => Ok(Self::PostLikeGiven),
            "POST_LIKE_RECEIVED" => Ok(Self::PostLikeReceived),
            "USER_REGISTER" => Ok(Self::UserRegister),
            "USER_LOGIN" => Ok(Self::UserLogin),
            other => Err(format!("未知的触发类型: {other}")),
        }
    }
}

impl From<EventType> for TriggerType {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::PostCreate => Self::PostCreate,
            EventType::PostReply => Self::PostReply,
            EventType::Checkin => Self::Checkin,
            EventType::Donation => Self::Donation,
            EventType::PostLikeGiven => Self::PostLikeGiven,
            EventType::PostLikeReceived => Self::PostLikeReceived,
            EventType::UserRegister => Self::UserRegister,
            EventType::UserLogin => Self::UserLogin,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerCondition — 按触发类型区分的强类型条件
// ---------------------------------------------------------------------------

/// 触发条件
///
/// 以触发类型为标签的强类型联合，取代在引擎内部按类型临时解释的
/// 无结构 JSON。变体必须与规则的触发类型一致，不一致视为配置缺陷。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum TriggerCondition {
    /// 定时规则：cron 表达式（秒 分 时 日 月 周）
    Cron { expression: String },
    /// 发帖：可限定版块
    PostCreate {
        #[serde(default)]
        category_ids: Option<Vec<i64>>,
    },
    /// 回帖：可限定版块与最低楼层
    PostReply {
        #[serde(default)]
        category_ids: Option<Vec<i64>>,
        #[serde(default)]
        min_floor: Option<i64>,
    },
    /// 签到：可要求最低连续天数
    Checkin {
        #[serde(default)]
        min_streak: Option<i32>,
    },
    /// 打赏：可要求最低金额（分）
    Donation {
        #[serde(default)]
        min_amount: Option<i64>,
    },
    PostLikeGiven {},
    PostLikeReceived {},
    UserRegister {},
    UserLogin {},
}

impl TriggerCondition {
    /// 条件变体是否与触发类型一致
    pub fn matches_trigger_type(&self, trigger: TriggerType) -> bool {
        matches!(
            (self, trigger),
            (Self::Cron { .. }, TriggerType::Cron)
                | (Self::PostCreate { .. }, TriggerType::PostCreate)
                | (Self::PostReply { .. }, TriggerType::PostReply)
                | (Self::Checkin { .. }, TriggerType::Checkin)
                | (Self::Donation { .. }, TriggerType::Donation)
                | (Self::PostLikeGiven {}, TriggerType::PostLikeGiven)
                | (Self::PostLikeReceived {}, TriggerType::PostLikeReceived)
                | (Self::UserRegister {}, TriggerType::UserRegister)
                | (Self::UserLogin {}, TriggerType::UserLogin)
        )
    }

    /// 对事件负载求值条件谓词
    ///
    /// 未设置的过滤项视为不限制；CRON 与无参数事件恒为真
    /// （定时规则由调度器决定何时触发，谓词不再筛选）。
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            Self::Cron { .. } => true,
            Self::PostCreate { category_ids } => in_categories(payload, category_ids),
            Self::PostReply {
                category_ids,
                min_floor,
            } => {
                in_categories(payload, category_ids)
                    && min_floor
                        .map(|min| get_i64(payload, &["floor"]).is_some_and(|f| f >= min))
                        .unwrap_or(true)
            }
            Self::Checkin { min_streak } => min_streak
                .map(|min| {
                    get_i64(payload, &["streak"]).is_some_and(|s| s >= min as i64)
                })
                .unwrap_or(true),
            Self::Donation { min_amount } => min_amount
                .map(|min| get_i64(payload, &["amount"]).is_some_and(|a| a >= min))
                .unwrap_or(true),
            Self::PostLikeGiven {}
            | Self::PostLikeReceived {}
            | Self::UserRegister {}
            | Self::UserLogin {} => true,
        }
    }

    /// 定时条件携带的 cron 表达式
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Cron { expression } => Some(expression),
            _ => None,
        }
    }
}

/// 负载的版块是否落在限定集合内；未限定则恒为真
fn in_categories(payload: &Value, category_ids: &Option<Vec<i64>>) -> bool {
    match category_ids {
        None => true,
        Some(ids) => get_i64(payload, &["categoryId", "category_id"])
            .is_some_and(|c| ids.contains(&c)),
    }
}

/// 按候选键名从负载提取整数字段（容忍字符串形式的数值）
fn get_i64(payload: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match payload.get(key) {
            Some(Value::Number(n)) => return n.as_i64(),
            Some(Value::String(s)) => return s.parse().ok(),
            _ => continue,
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Action — 规则动作
// ---------------------------------------------------------------------------

/// 规则动作（线上格式 `{ "type": ..., "params": {...} }`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "params",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Action {
    /// 积分调整：带符号的增量与原因码
    CreditChange { delta: i64, reason: String },
    /// 授予徽章
    BadgeGrant { badge_id: i64 },
    /// 撤销徽章
    BadgeRevoke { badge_id: i64 },
    /// 用户组变更
    UserGroupChange { group_id: i64 },
}

impl Action {
    /// 动作类型名，用于执行结果与日志
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreditChange { .. } => "CREDIT_CHANGE",
            Self::BadgeGrant { .. } => "BADGE_GRANT",
            Self::BadgeRevoke { .. } => "BADGE_REVOKE",
            Self::UserGroupChange { .. } => "USER_GROUP_CHANGE",
        }
    }
}

/// 单个动作的执行结果
///
/// 预期内的"无事可做"（徽章已持有等）是带说明的成功，
/// 而非错误；只有数据层故障才算失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn ok(action: &str) -> Self {
        Self {
            action: action.to_string(),
            success: true,
            message: None,
        }
    }

    pub fn ok_with(action: &str, message: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn failed(action: &str, message: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            success: false,
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule — 规则定义
// ---------------------------------------------------------------------------

/// 规则定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub trigger_conditions: Option<TriggerCondition>,
    /// 按序执行的动作列表
    pub actions: Vec<Action>,
    /// 同一触发类型下数值大者先执行
    pub priority: i32,
    pub is_enabled: bool,
    pub is_repeatable: bool,
    /// 成功执行总次数上限
    pub max_executions: Option<i32>,
    /// 两次成功执行之间的最小间隔（秒）
    pub cooldown_seconds: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl Rule {
    /// 规则在指定时刻是否可被匹配
    ///
    /// 禁用、软删除、或在活动窗口之外的规则永不匹配。
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_enabled || self.is_deleted {
            return false;
        }
        if let Some(start) = self.start_time
            && now < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && now > end
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// 执行日志
// ---------------------------------------------------------------------------

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 待写入的执行日志（每次评估恰好一条，写入后不再修改）
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub rule_id: i64,
    /// 触发主体（用户 ID）；CRON 合成触发无主体
    pub triggered_by: Option<i64>,
    /// 事件负载快照
    pub trigger_context: Value,
    pub execution_status: ExecutionStatus,
    /// 逐动作的执行结果
    pub execution_result: Vec<ActionOutcome>,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}
