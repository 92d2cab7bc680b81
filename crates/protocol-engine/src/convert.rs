//! 值转换
//!
//! 赋值操作把表达式结果转换为目标属性声明的类型。

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::TypeRef;
use crate::value::Value;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConversionError(pub String);

/// 通用值转换能力
pub trait ValueConverter: Send + Sync {
    fn convert(&self, value: Value, target: &TypeRef) -> Result<Value, ConversionError>;
}

/// 默认转换规则：数值、字符串、布尔、日期、uuid 之间的常见转换
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValueConverter;

impl ValueConverter for DefaultValueConverter {
    fn convert(&self, value: Value, target: &TypeRef) -> Result<Value, ConversionError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match target {
            TypeRef::Any | TypeRef::Function(..) => Ok(value),
            TypeRef::Bool => to_bool(value),
            TypeRef::Int => to_int(value),
            TypeRef::Float => to_float(value),
            TypeRef::String => Ok(Value::String(value.to_string())),
            TypeRef::DateTime => to_datetime(value),
            TypeRef::Uuid => to_uuid(value),
            TypeRef::Record(name) => match value {
                Value::Record(r) if r.class_name.is_empty() || r.class_name == *name => {
                    Ok(Value::Record(r))
                }
                other => Err(mismatch(&other, target)),
            },
            TypeRef::List(element) => match value {
                Value::List(items) => items
                    .into_iter()
                    .map(|item| self.convert(item, element))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                other => Err(mismatch(&other, target)),
            },
        }
    }
}

fn to_bool(value: Value) -> Result<Value, ConversionError> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(b)),
        Value::Int(i) => Ok(Value::Bool(i != 0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(ConversionError(format!("'{}' 不是布尔值", s))),
        },
        other => Err(mismatch(&other, &TypeRef::Bool)),
    }
}

fn to_int(value: Value) -> Result<Value, ConversionError> {
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(f) if f.is_finite() && f.abs() < i64::MAX as f64 => {
            Ok(Value::Int(f.round() as i64))
        }
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| ConversionError(format!("'{}' 不是整数: {}", s, e))),
        other => Err(mismatch(&other, &TypeRef::Int)),
    }
}

fn to_float(value: Value) -> Result<Value, ConversionError> {
    match value {
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Float(f) => Ok(Value::Float(f)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| ConversionError(format!("'{}' 不是数值: {}", s, e))),
        other => Err(mismatch(&other, &TypeRef::Float)),
    }
}

fn to_datetime(value: Value) -> Result<Value, ConversionError> {
    match value {
        Value::DateTime(d) => Ok(Value::DateTime(d)),
        Value::String(s) => parse_datetime(&s)
            .map(Value::DateTime)
            .ok_or_else(|| ConversionError(format!("'{}' 不是有效的日期时间", s))),
        other => Err(mismatch(&other, &TypeRef::DateTime)),
    }
}

fn to_uuid(value: Value) -> Result<Value, ConversionError> {
    match value {
        Value::Uuid(u) => Ok(Value::Uuid(u)),
        Value::String(s) => Uuid::parse_str(s.trim())
            .map(Value::Uuid)
            .map_err(|e| ConversionError(format!("'{}' 不是有效的 uuid: {}", s, e))),
        Value::Record(r) => r
            .key
            .map(Value::Uuid)
            .ok_or_else(|| ConversionError("记录没有标识".to_string())),
        other => Err(mismatch(&other, &TypeRef::Uuid)),
    }
}

/// 解析 RFC 3339 时间或 `YYYY-MM-DD` 日期
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn mismatch(value: &Value, target: &TypeRef) -> ConversionError {
    ConversionError(format!("无法把 {} 转换为 {}", value.type_name(), target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        let c = DefaultValueConverter;
        assert_eq!(c.convert(Value::Float(2.6), &TypeRef::Int).unwrap(), Value::Int(3));
        assert_eq!(c.convert(Value::from(" 7 "), &TypeRef::Int).unwrap(), Value::Int(7));
        assert_eq!(c.convert(Value::Int(2), &TypeRef::Float).unwrap(), Value::Float(2.0));
        assert!(c.convert(Value::from("abc"), &TypeRef::Float).is_err());
    }

    #[test]
    fn test_null_passes_through() {
        let c = DefaultValueConverter;
        assert_eq!(c.convert(Value::Null, &TypeRef::Int).unwrap(), Value::Null);
    }

    #[test]
    fn test_date_conversions() {
        let c = DefaultValueConverter;
        let v = c.convert(Value::from("2024-03-01"), &TypeRef::DateTime).unwrap();
        assert_eq!(v.to_string(), "2024-03-01T00:00:00+00:00");
        assert!(c.convert(Value::Int(1), &TypeRef::DateTime).is_err());
    }

    #[test]
    fn test_list_conversion_converts_elements() {
        let c = DefaultValueConverter;
        let v = c
            .convert(
                Value::List(vec![Value::from("1"), Value::Int(2)]),
                &TypeRef::list(TypeRef::Int),
            )
            .unwrap();
        assert_eq!(v, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }
}
