//! 静态类型描述
//!
//! 表达式节点在转换为可执行形式前需要推断类型，`TypeRef` 即节点报告的类型。
//! 文档中以字符串表示：`bool`、`int`、`float`、`string`、`datetime`、`uuid`、
//! `any`、`list<T>`，其余标识符视为记录类型名（如 `Patient`）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RuleError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    Any,
    Bool,
    Int,
    Float,
    String,
    DateTime,
    Uuid,
    /// 命名记录类型（行为/实体/组件）
    Record(std::string::String),
    List(Box<TypeRef>),
    /// 委托类型：参数类型列表与返回类型
    Function(Vec<TypeRef>, Box<TypeRef>),
}

impl TypeRef {
    pub fn record(name: impl Into<std::string::String>) -> Self {
        Self::Record(name.into())
    }

    pub fn list(element: TypeRef) -> Self {
        Self::List(Box::new(element))
    }

    pub fn function(parameters: Vec<TypeRef>, returns: TypeRef) -> Self {
        Self::Function(parameters, Box::new(returns))
    }

    /// 集合类型的元素类型
    pub fn element_type(&self) -> Option<&TypeRef> {
        match self {
            Self::List(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }

    /// 标量类型，或元素为标量的集合
    pub fn is_scalar(&self) -> bool {
        match self {
            Self::Bool | Self::Int | Self::Float | Self::String | Self::DateTime | Self::Uuid => true,
            Self::List(element) => element.is_scalar(),
            _ => false,
        }
    }

    /// 判断 `other` 类型的值能否直接当作本类型使用
    pub fn accepts(&self, other: &TypeRef) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Float, Self::Int) => true,
            (Self::List(a), Self::List(b)) => a.accepts(b),
            (a, b) => a == b,
        }
    }

    pub fn name(&self) -> std::string::String {
        self.to_string()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
            Self::DateTime => write!(f, "datetime"),
            Self::Uuid => write!(f, "uuid"),
            Self::Record(name) => write!(f, "{}", name),
            Self::List(inner) => write!(f, "list<{}>", inner),
            Self::Function(params, ret) => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")->{}", ret)
            }
        }
    }
}

impl FromStr for TypeRef {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("list<").and_then(|r| r.strip_suffix('>')) {
            return Ok(Self::list(inner.parse()?));
        }

        let ty = match s.to_ascii_lowercase().as_str() {
            "any" | "object" => Self::Any,
            "bool" | "boolean" => Self::Bool,
            "int" | "integer" | "int32" | "int64" | "long" => Self::Int,
            "float" | "double" | "decimal" => Self::Float,
            "string" => Self::String,
            "datetime" | "datetimeoffset" | "date" => Self::DateTime,
            "uuid" | "guid" => Self::Uuid,
            _ => {
                let valid = !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
                if !valid {
                    return Err(RuleError::symbol(s, "无效的类型名称"));
                }
                Self::Record(s.to_string())
            }
        };
        Ok(ty)
    }
}

impl TryFrom<std::string::String> for TypeRef {
    type Error = RuleError;

    fn try_from(value: std::string::String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeRef> for std::string::String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primitive_aliases() {
        assert_eq!("Int32".parse::<TypeRef>().unwrap(), TypeRef::Int);
        assert_eq!("Guid".parse::<TypeRef>().unwrap(), TypeRef::Uuid);
        assert_eq!("DateTimeOffset".parse::<TypeRef>().unwrap(), TypeRef::DateTime);
    }

    #[test]
    fn test_parse_list_and_record() {
        let ty: TypeRef = "list<EntityAddress>".parse().unwrap();
        assert_eq!(ty, TypeRef::list(TypeRef::record("EntityAddress")));
        assert_eq!(ty.to_string(), "list<EntityAddress>");
        assert_eq!(ty.element_type(), Some(&TypeRef::record("EntityAddress")));
    }

    #[test]
    fn test_invalid_type_name() {
        assert!("not a type".parse::<TypeRef>().is_err());
    }

    #[test]
    fn test_is_scalar() {
        assert!(TypeRef::Uuid.is_scalar());
        assert!(TypeRef::list(TypeRef::DateTime).is_scalar());
        assert!(!TypeRef::record("Patient").is_scalar());
        assert!(!TypeRef::list(TypeRef::record("EntityAddress")).is_scalar());
        assert!(!TypeRef::Any.is_scalar());
    }

    #[test]
    fn test_accepts() {
        assert!(TypeRef::Float.accepts(&TypeRef::Int));
        assert!(!TypeRef::Int.accepts(&TypeRef::String));
        assert!(TypeRef::Any.accepts(&TypeRef::record("Patient")));
    }
}
