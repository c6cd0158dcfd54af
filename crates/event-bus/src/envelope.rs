//! 事件信封与流上条目解析
//!
//! 线上格式：每条流条目两个字段，`data` 为编解码器处理后的 JSON 文本，
//! `timestamp` 为十进制字符串形式的毫秒时间戳。条目不在 broker 保留
//! 期之外持久化，每条流按近似上限裁剪。

use std::collections::HashMap;

use automation_shared::codec;
use automation_shared::error::{AutomationError, Result};
use automation_shared::events::EventType;
use serde_json::Value;

/// 事件流键前缀，拼接事件名得到完整的流键
const STREAM_KEY_PREFIX: &str = "automation:events:";

/// 事件类型对应的流键
pub fn stream_key(event_type: EventType) -> String {
    format!("{STREAM_KEY_PREFIX}{event_type}")
}

/// 从流键反推事件类型
pub fn event_type_of_key(key: &str) -> Option<EventType> {
    key.strip_prefix(STREAM_KEY_PREFIX)?.parse().ok()
}

/// 构造一条待追加的流条目字段列表
///
/// 负载先经编解码器处理（大整数转字符串），再序列化为 JSON 文本。
pub fn envelope_fields(payload: &Value, timestamp_ms: i64) -> Result<Vec<(String, String)>> {
    let data = serde_json::to_string(&codec::encode(payload))
        .map_err(|e| AutomationError::Internal(format!("负载序列化失败: {e}")))?;

    Ok(vec![
        ("data".to_string(), data),
        ("timestamp".to_string(), timestamp_ms.to_string()),
    ])
}

// ---------------------------------------------------------------------------
// BusEvent — 投递给处理器的已解码事件
// ---------------------------------------------------------------------------

/// 投递给处理器的事件
///
/// 将 broker 条目（带生命周期约束的字段映射）转换为拥有所有权的结构体，
/// 负载已经过编解码器还原，可安全地跨 await 点传给异步处理器。
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub event_type: EventType,
    /// broker 分配的条目 ID（进程内传输为合成值）
    pub entry_id: String,
    /// 已解码的事件负载
    pub payload: Value,
    /// 信封时间戳（毫秒）
    pub timestamp_ms: i64,
}

impl BusEvent {
    /// 从流条目的字段映射解析事件
    ///
    /// `data` 字段缺失或非合法 JSON 视为解码错误；`timestamp` 缺失时
    /// 容忍为 0（旧生产者可能未写入），不阻塞消费。
    pub fn from_entry(
        event_type: EventType,
        entry_id: &str,
        map: &HashMap<String, redis::Value>,
    ) -> Result<Self> {
        let raw_data: String = map
            .get("data")
            .and_then(|v| redis::from_redis_value_ref(v).ok())
            .ok_or_else(|| {
                AutomationError::Decode(format!("条目 {entry_id} 缺少 data 字段"))
            })?;

        let wire: Value = serde_json::from_str(&raw_data)
            .map_err(|e| AutomationError::Decode(format!("条目 {entry_id} 负载非法: {e}")))?;

        let timestamp_ms = map
            .get("timestamp")
            .and_then(|v| redis::from_redis_value_ref::<String>(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            event_type,
            entry_id: entry_id.to_string(),
            payload: codec::decode(&wire),
            timestamp_ms,
        })
    }
}
