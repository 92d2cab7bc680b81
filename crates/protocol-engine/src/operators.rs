//! 过滤操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 过滤条件操作符
///
/// 查询字符串中以值前缀表示，如 `age=>=18`、`name=~smi`、`status=!obsolete`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    /// 拆出值前缀中的操作符，返回操作符和剩余的值文本
    pub fn split_prefix(raw: &str) -> (Self, &str) {
        // 两字符前缀优先匹配
        const PREFIXES: [(&str, Operator); 8] = [
            (">=", Operator::Gte),
            ("<=", Operator::Lte),
            (">", Operator::Gt),
            ("<", Operator::Lt),
            ("!", Operator::Neq),
            ("~", Operator::Contains),
            ("^", Operator::StartsWith),
            ("$", Operator::EndsWith),
        ];

        for (prefix, op) in PREFIXES {
            if let Some(rest) = raw.strip_prefix(prefix) {
                return match (op, rest) {
                    (Operator::Neq, "null") => (Operator::IsNotEmpty, rest),
                    _ => (op, rest),
                };
            }
        }

        if raw == "null" {
            (Operator::IsEmpty, raw)
        } else {
            (Operator::Eq, raw)
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Eq | Self::IsEmpty => "",
            Self::Neq | Self::IsNotEmpty => "!",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Contains => "~",
            Self::StartsWith => "^",
            Self::EndsWith => "$",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        };
        write!(f, "{}", s)
    }
}

/// 条件集合的组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(alias = "and", alias = "AND")]
    And,
    #[serde(alias = "or", alias = "OR")]
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "And"),
            Self::Or => write!(f, "Or"),
        }
    }
}
