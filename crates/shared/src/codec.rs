//! 事件负载编解码器
//!
//! 事件负载经由 JSON 文本在 Redis Stream 上传输，而 64 位整数标识
//! （雪花 ID 等）超出 JSON 数值的双精度安全范围（2^53 - 1），直接按
//! 数值传输会丢失精度。编码时将超出安全范围的整数转为十进制字符串，
//! 解码时再按启发式规则还原。
//!
//! 还原启发式：字符串值由 13 位及以上连续数字组成，且字段名以 `Id`
//! 或 `_id` 结尾时，提升回 i64。该规则是基于形状的，没有显式 schema：
//! 一个恰好是 13 位以上纯数字、但并非标识符的字符串，若挂在 `Id` 结尾
//! 的键下会被误提升。生产者无法选择退出该启发式；需要精确语义的事件
//! 应使用 `events` 模块中带版本号的类型化负载（标识字段以字符串序列化），
//! 启发式仅作为未类型化负载的兜底。

use serde_json::Value;

/// JSON 数值的双精度安全上限（Number.MAX_SAFE_INTEGER）
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// 识别为标识符字符串所需的最少连续数字位数
const MIN_ID_DIGITS: usize = 13;

/// 编码：递归遍历，将超出安全范围的 64 位整数转为十进制字符串
///
/// 嵌套的对象与数组都会被递归处理，其余值原样保留。
pub fn encode(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.abs() > MAX_SAFE_INTEGER {
                    return Value::String(i.to_string());
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INTEGER as u64 {
                    return Value::String(u.to_string());
                }
            }
            value.clone()
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode(v)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(encode).collect()),
        _ => value.clone(),
    }
}

/// 解码：编码的逆操作
///
/// 对象字段的值为 13 位以上纯数字字符串、且键名以标识符后缀结尾时，
/// 提升回 i64；其余字段原样通过，递归进入嵌套对象（含数组内的对象）。
/// 数组元素本身没有键名，不会被直接提升。
pub fn decode(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), decode_field(k, v)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(decode).collect()),
        _ => value.clone(),
    }
}

/// 解码单个对象字段，键名提供提升判断所需的上下文
fn decode_field(key: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if is_identifier_key(key) && looks_like_big_id(s) => {
            // 超出 i64 范围的数字串解析会失败，保留原字符串
            match s.parse::<i64>() {
                Ok(n) => Value::Number(n.into()),
                Err(_) => value.clone(),
            }
        }
        Value::Object(_) | Value::Array(_) => decode(value),
        _ => value.clone(),
    }
}

/// 键名是否为标识符字段（以 `Id` 或 `_id` 结尾）
fn is_identifier_key(key: &str) -> bool {
    key.ends_with("Id") || key.ends_with("_id")
}

/// 字符串是否形如大整数标识（13 位及以上连续数字）
fn looks_like_big_id(s: &str) -> bool {
    s.len() >= MIN_ID_DIGITS && s.bytes().all(|b| b.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// string_id — 类型化负载的标识字段序列化辅助
// ---------------------------------------------------------------------------

/// i64 标识字段的字符串序列化辅助
///
/// 类型化事件负载用 `#[serde(with = "codec::string_id")]` 标注标识字段，
/// 序列化为十进制字符串以跨越 JSON 数值精度限制，反序列化同时接受
/// 字符串与数值两种形式（兼容未编码的旧负载）。
pub mod string_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }

        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// `Option<i64>` 标识字段的字符串序列化辅助
pub mod string_id_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(n) => s.collect_str(n),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }

        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}
