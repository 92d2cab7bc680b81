//! 过滤条件评估器
//!
//! 比较记录中的字段值与查询字符串中的期望值。期望值以原始文本给出，
//! 按字段值的实际类型解析后再比较。

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::convert::parse_datetime;
use crate::error::{Result, RuleError};
use crate::operators::Operator;
use crate::value::Value;

/// 过滤条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `field_value` - 从记录中解析到的字段值
    /// * `operator` - 操作符
    /// * `expected` - 查询中的期望值文本
    pub fn evaluate(field_value: Option<&Value>, operator: Operator, expected: &str) -> Result<bool> {
        match operator {
            Operator::IsEmpty => return Ok(Self::is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!Self::is_empty(field_value)),
            _ => {}
        }

        // 字段不存在时，除 != 外的操作均不匹配
        let field_value = match field_value {
            Some(Value::Null) | None => return Ok(operator == Operator::Neq),
            Some(v) => v,
        };

        match operator {
            Operator::Eq => Self::eq(field_value, expected),
            Operator::Neq => Self::eq(field_value, expected).map(|r| !r),
            Operator::Gt => Self::compare(field_value, expected, |o| o.is_gt()),
            Operator::Gte => Self::compare(field_value, expected, |o| o.is_ge()),
            Operator::Lt => Self::compare(field_value, expected, |o| o.is_lt()),
            Operator::Lte => Self::compare(field_value, expected, |o| o.is_le()),
            Operator::Contains => Self::text(field_value, |s| {
                s.to_lowercase().contains(&expected.to_lowercase())
            }),
            Operator::StartsWith => Self::text(field_value, |s| {
                s.to_lowercase().starts_with(&expected.to_lowercase())
            }),
            Operator::EndsWith => Self::text(field_value, |s| {
                s.to_lowercase().ends_with(&expected.to_lowercase())
            }),
            Operator::IsEmpty | Operator::IsNotEmpty => {
                Ok((operator == Operator::IsEmpty) == Self::is_empty(Some(field_value)))
            }
        }
    }

    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::List(items)) => items.is_empty(),
            _ => false,
        }
    }

    /// 相等比较；字符串不区分大小写
    fn eq(field: &Value, expected: &str) -> Result<bool> {
        let result = match field {
            Value::Int(_) | Value::Float(_) => match Self::number(expected) {
                Some(n) => field.as_f64().is_some_and(|f| (f - n).abs() < f64::EPSILON),
                None => false,
            },
            Value::Bool(b) => expected.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
            Value::DateTime(d) => Self::datetime(expected)? == *d,
            Value::Uuid(u) => Uuid::parse_str(expected).map(|e| e == *u).unwrap_or(false),
            Value::String(s) => s.eq_ignore_ascii_case(expected),
            Value::Record(r) => r
                .key
                .zip(Uuid::parse_str(expected).ok())
                .is_some_and(|(k, e)| k == e),
            other => {
                return Err(RuleError::evaluation(format!(
                    "无法对 {} 做相等过滤",
                    other.type_name()
                )));
            }
        };
        Ok(result)
    }

    /// 有序比较
    fn compare<F>(field: &Value, expected: &str, cmp: F) -> Result<bool>
    where
        F: Fn(std::cmp::Ordering) -> bool,
    {
        let ordering = match field {
            Value::Int(_) | Value::Float(_) => {
                let n = Self::number(expected).ok_or_else(|| {
                    RuleError::evaluation(format!("期望数值, 实际 '{}'", expected))
                })?;
                field.as_f64().and_then(|f| f.partial_cmp(&n))
            }
            Value::DateTime(d) => Some(d.cmp(&Self::datetime(expected)?)),
            Value::String(s) => Some(s.as_str().cmp(expected)),
            other => {
                return Err(RuleError::evaluation(format!(
                    "无法对 {} 做大小比较",
                    other.type_name()
                )));
            }
        };
        Ok(ordering.is_some_and(cmp))
    }

    fn text<F>(field: &Value, f: F) -> Result<bool>
    where
        F: Fn(&str) -> bool,
    {
        match field {
            Value::String(s) => Ok(f(s)),
            other => Err(RuleError::evaluation(format!(
                "字符串匹配需要 string, 实际 {}",
                other.type_name()
            ))),
        }
    }

    fn number(text: &str) -> Option<f64> {
        text.trim().parse().ok()
    }

    fn datetime(text: &str) -> Result<DateTime<Utc>> {
        parse_datetime(text)
            .ok_or_else(|| RuleError::evaluation(format!("无法解析日期时间: '{}'", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_numbers() {
        assert!(ConditionEvaluator::evaluate(Some(&Value::Int(100)), Operator::Eq, "100").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&Value::Float(100.0)), Operator::Eq, "100").unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&Value::Int(100)), Operator::Eq, "abc").unwrap());
    }

    #[test]
    fn test_eq_strings_ignore_case() {
        assert!(ConditionEvaluator::evaluate(Some(&Value::from("Home")), Operator::Eq, "home").unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&Value::from("work")), Operator::Eq, "home").unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let v = Value::Int(100);
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::Gt, "50").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::Gte, "100").unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&v), Operator::Lt, "100").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::Lte, "100").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::Gt, "abc").is_err());
    }

    #[test]
    fn test_date_comparison() {
        let d = Value::DateTime(parse_datetime("2024-05-01").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&d), Operator::Gt, "2024-01-01").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&d), Operator::Lt, "2024-06-01T00:00:00Z").unwrap());
    }

    #[test]
    fn test_missing_field() {
        assert!(!ConditionEvaluator::evaluate(None, Operator::Eq, "x").unwrap());
        assert!(ConditionEvaluator::evaluate(None, Operator::Neq, "x").unwrap());
        assert!(ConditionEvaluator::evaluate(None, Operator::IsEmpty, "null").unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&Value::Int(1)), Operator::IsEmpty, "null").unwrap());
    }

    #[test]
    fn test_string_operators() {
        let v = Value::from("Smithson");
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::Contains, "THS").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::StartsWith, "smi").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&v), Operator::EndsWith, "son").unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&Value::Int(3)), Operator::Contains, "3").is_err());
    }
}
