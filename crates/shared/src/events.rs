//! 事件模型
//!
//! 定义论坛业务事件的类型枚举与类型化负载。业务功能（发帖、签到、
//! 打赏等）作为生产者向事件总线 emit 这些事件，规则引擎作为消费者
//! 对其求值。
//!
//! 负载带有 `schemaVersion` 字段并将 64 位标识字段显式序列化为字符串
//! （见 [`crate::codec::string_id`]），是跨传输精度问题的首选方案；
//! 未类型化的 JSON 负载仍可通过编解码器的启发式兜底。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{string_id, string_id_opt};

/// 当前负载 schema 版本
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ---------------------------------------------------------------------------
// EventType — 业务事件类型
// ---------------------------------------------------------------------------

/// 业务事件类型枚举
///
/// 枚举值即线上的事件名（冒号分隔的命名空间形式），
/// 同时用作事件流的路由键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "post:create")]
    PostCreate,
    #[serde(rename = "post:reply")]
    PostReply,
    #[serde(rename = "user:checkin")]
    Checkin,
    #[serde(rename = "donation:confirmed")]
    Donation,
    #[serde(rename = "post:like:given")]
    PostLikeGiven,
    #[serde(rename = "post:like:received")]
    PostLikeReceived,
    #[serde(rename = "user:register")]
    UserRegister,
    #[serde(rename = "user:login")]
    UserLogin,
}

/// 全部业务事件类型，worker 启动时据此逐一注册触发处理器
pub const ALL_EVENT_TYPES: [EventType; 8] = [
    EventType::PostCreate,
    EventType::PostReply,
    EventType::Checkin,
    EventType::Donation,
    EventType::PostLikeGiven,
    EventType::PostLikeReceived,
    EventType::UserRegister,
    EventType::UserLogin,
];

impl EventType {
    /// 线上事件名
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostCreate => "post:create",
            Self::PostReply => "post:reply",
            Self::Checkin => "user:checkin",
            Self::Donation => "donation:confirmed",
            Self::PostLikeGiven => "post:like:given",
            Self::PostLikeReceived => "post:like:received",
            Self::UserRegister => "user:register",
            Self::UserLogin => "user:login",
        }
    }

    /// 内容类事件（发帖、回帖）
    pub fn is_post(&self) -> bool {
        matches!(self, Self::PostCreate | Self::PostReply)
    }

    /// 互动类事件（签到、打赏、点赞）
    pub fn is_engagement(&self) -> bool {
        matches!(
            self,
            Self::Checkin | Self::Donation | Self::PostLikeGiven | Self::PostLikeReceived
        )
    }

    /// 账号类事件（注册、登录）
    pub fn is_account(&self) -> bool {
        matches!(self, Self::UserRegister | Self::UserLogin)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post:create" => Ok(Self::PostCreate),
            "post:reply" => Ok(Self::PostReply),
            "user:checkin" => Ok(Self::Checkin),
            "donation:confirmed" => Ok(Self::Donation),
            "post:like:given" => Ok(Self::PostLikeGiven),
            "post:like:received" => Ok(Self::PostLikeReceived),
            "user:register" => Ok(Self::UserRegister),
            "user:login" => Ok(Self::UserLogin),
            other => Err(format!("未知的事件类型: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// 类型化事件负载
// ---------------------------------------------------------------------------

/// 发帖事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreatePayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    #[serde(with = "string_id")]
    pub post_id: i64,
    #[serde(with = "string_id")]
    pub topic_id: i64,
    #[serde(with = "string_id_opt", default)]
    pub category_id: Option<i64>,
}

/// 回帖事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostReplyPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    #[serde(with = "string_id")]
    pub post_id: i64,
    #[serde(with = "string_id")]
    pub topic_id: i64,
    #[serde(with = "string_id_opt", default)]
    pub category_id: Option<i64>,
    /// 楼层号
    pub floor: i64,
}

/// 签到事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    /// 连续签到天数
    pub streak: i32,
}

/// 打赏确认事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    pub order_no: String,
    /// 金额（分）
    pub amount: i64,
}

/// 点赞事件负载（给出与收到共用，主体字段含义不同：
/// 给出时 user_id 是点赞者，收到时 user_id 是被赞作者）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostLikePayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    #[serde(with = "string_id")]
    pub post_id: i64,
    #[serde(with = "string_id")]
    pub peer_user_id: i64,
}

/// 注册事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisterPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
    pub username: String,
}

/// 登录事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoginPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(with = "string_id")]
    pub user_id: i64,
}

// ---------------------------------------------------------------------------
// 主体提取
// ---------------------------------------------------------------------------

/// 从（已解码的）事件负载中提取触发主体的用户 ID
///
/// 所有业务事件负载都携带行为主体的标识，键名为 `userId`（camelCase
/// 负载）或 `user_id`（snake_case 旧负载）。CRON 合成负载没有主体，
/// 返回 None。
pub fn subject_id(payload: &Value) -> Option<i64> {
    let v = payload.get("userId").or_else(|| payload.get("user_id"))?;
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_event_type_round_trip() {
        for et in ALL_EVENT_TYPES {
            let parsed = EventType::from_str(et.as_str()).unwrap();
            assert_eq!(parsed, et);
        }
        assert!(EventType::from_str("post:delete").is_err());
    }

    #[test]
    fn test_event_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&EventType::PostLikeReceived).unwrap();
        assert_eq!(json, "\"post:like:received\"");

        let parsed: EventType = serde_json::from_str("\"user:checkin\"").unwrap();
        assert_eq!(parsed, EventType::Checkin);
    }

    #[test]
    fn test_event_type_classification() {
        assert!(EventType::PostCreate.is_post());
        assert!(EventType::PostReply.is_post());
        assert!(!EventType::Checkin.is_post());

        assert!(EventType::Checkin.is_engagement());
        assert!(EventType::Donation.is_engagement());
        assert!(EventType::PostLikeGiven.is_engagement());
        assert!(EventType::PostLikeReceived.is_engagement());

        assert!(EventType::UserRegister.is_account());
        assert!(EventType::UserLogin.is_account());
        assert!(!EventType::Donation.is_account());
    }

    #[test]
    fn test_typed_payload_serializes_ids_as_strings() {
        let payload = PostCreatePayload {
            schema_version: SCHEMA_VERSION,
            user_id: 1_700_000_000_000_123,
            post_id: 1_700_000_000_000_456,
            topic_id: 42,
            category_id: Some(7),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["userId"], json!("1700000000000123"));
        assert_eq!(json["postId"], json!("1700000000000456"));
        assert_eq!(json["categoryId"], json!("7"));

        let parsed: PostCreatePayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.user_id, 1_700_000_000_000_123);
        assert_eq!(parsed.category_id, Some(7));
    }

    #[test]
    fn test_schema_version_defaults_on_legacy_payload() {
        // 旧负载没有 schemaVersion 字段，反序列化时按当前版本补齐
        let parsed: CheckinPayload =
            serde_json::from_value(json!({ "userId": "5", "streak": 3 })).unwrap();
        assert_eq!(parsed.schema_version, SCHEMA_VERSION);
        assert_eq!(parsed.user_id, 5);
    }

    #[test]
    fn test_subject_id_extraction() {
        assert_eq!(subject_id(&json!({ "userId": 42 })), Some(42));
        assert_eq!(
            subject_id(&json!({ "userId": "1700000000000123" })),
            Some(1_700_000_000_000_123)
        );
        assert_eq!(subject_id(&json!({ "user_id": 7 })), Some(7));
        // CRON 合成负载没有主体
        assert_eq!(subject_id(&json!({ "triggerType": "CRON" })), None);
        assert_eq!(subject_id(&json!({ "userId": true })), None);
    }
}
