//! 运行时值
//!
//! 表达式求值、过滤查询和属性赋值共用的值类型。记录以 `Arc` 共享，
//! 因此复制集合只复制容器本身，元素仍指向同一份记录。

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, RuleError};
use crate::record::Record;
use crate::types::TypeRef;

/// 可调用值（作为方法参数传递的 lambda）
pub type FunctionBody = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub struct FunctionValue {
    pub arity: usize,
    body: FunctionBody,
}

impl FunctionValue {
    pub fn new(arity: usize, body: FunctionBody) -> Self {
        Self { arity, body }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.arity {
            return Err(RuleError::evaluation(format!(
                "委托参数个数不匹配: 期望 {}, 实际 {}",
                self.arity,
                args.len()
            )));
        }
        (self.body)(args)
    }
}

impl fmt::Debug for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn/{}>", self.arity)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    Record(Arc<Record>),
    List(Vec<Value>),
    Function(FunctionValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// 数值统一按浮点数处理（整数与浮点数比较时使用）
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// 要求布尔值，否则报执行错误
    pub fn expect_bool(&self, what: &str) -> Result<bool> {
        self.as_bool().ok_or_else(|| {
            RuleError::evaluation(format!("{} 需要布尔值, 实际 {}", what, self.type_name()))
        })
    }

    /// 运行时类型
    pub fn type_ref(&self) -> TypeRef {
        match self {
            Self::Null => TypeRef::Any,
            Self::Bool(_) => TypeRef::Bool,
            Self::Int(_) => TypeRef::Int,
            Self::Float(_) => TypeRef::Float,
            Self::String(_) => TypeRef::String,
            Self::DateTime(_) => TypeRef::DateTime,
            Self::Uuid(_) => TypeRef::Uuid,
            Self::Record(r) if r.class_name.is_empty() => TypeRef::Any,
            Self::Record(r) => TypeRef::record(r.class_name.clone()),
            Self::List(items) => TypeRef::list(
                items
                    .iter()
                    .find(|v| !v.is_null())
                    .map(Value::type_ref)
                    .unwrap_or(TypeRef::Any),
            ),
            Self::Function(f) => TypeRef::function(vec![TypeRef::Any; f.arity], TypeRef::Any),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::DateTime(_) => "datetime",
            Self::Uuid(_) => "uuid",
            Self::Record(_) => "record",
            Self::List(_) => "list",
            Self::Function(_) => "function",
        }
    }

    /// 从 JSON 构造；对象按记录解析（`$type` 为类名）
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let value = match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            obj @ serde_json::Value::Object(_) => {
                let record: Record = serde_json::from_value(obj)?;
                Self::Record(Arc::new(record))
            }
        };
        Ok(value)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Uuid(a), Self::Uuid(b)) => a == b,
            (Self::Record(a), Self::Record(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::List(a), Self::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
            Self::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Record(r) => write!(f, "{}#{}", r.class_name, r.key.map(|k| k.to_string()).unwrap_or_default()),
            Self::List(items) => write!(f, "[{} items]", items.len()),
            Self::Function(func) => write!(f, "{:?}", func),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null | Self::Function(_) => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::String(s) => serializer.serialize_str(s),
            Self::DateTime(d) => d.serialize(serializer),
            Self::Uuid(u) => u.serialize(serializer),
            Self::Record(r) => r.serialize(serializer),
            Self::List(items) => items.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(D::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Record(Arc::new(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}
