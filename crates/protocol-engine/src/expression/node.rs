//! 表达式节点
//!
//! 节点存放在 `ExpressionTree` 的 arena 中，子节点以 `NodeId` 引用。

use std::fmt;

use crate::types::TypeRef;
use crate::value::Value;

/// arena 中的节点下标
pub type NodeId = usize;

/// 二元操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    AndAlso,
    OrElse,
    Add,
    Subtract,
    TypeIs,
}

impl BinaryOperator {
    /// 文档中的操作符代码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::LessThan => "lt",
            Self::LessThanOrEqual => "lte",
            Self::GreaterThan => "gt",
            Self::GreaterThanOrEqual => "gte",
            Self::AndAlso => "and",
            Self::OrElse => "or",
            Self::Add => "add",
            Self::Subtract => "sub",
            Self::TypeIs => "is",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let op = match code {
            "eq" => Self::Equal,
            "ne" => Self::NotEqual,
            "lt" => Self::LessThan,
            "lte" => Self::LessThanOrEqual,
            "gt" => Self::GreaterThan,
            "gte" => Self::GreaterThanOrEqual,
            "and" => Self::AndAlso,
            "or" => Self::OrElse,
            "add" => Self::Add,
            "sub" => Self::Subtract,
            "is" => Self::TypeIs,
            _ => return None,
        };
        Some(op)
    }

    /// 结果类型是否取左操作数类型（其余为 bool）
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, Self::Add | Self::Subtract)
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// 一元操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Convert,
    Negate,
    TypeAs,
}

impl UnaryOperator {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Convert => "convert",
            Self::Negate => "neg",
            Self::TypeAs => "as",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let op = match code {
            "not" => Self::Not,
            "convert" => Self::Convert,
            "neg" => Self::Negate,
            "as" => Self::TypeAs,
            _ => return None,
        };
        Some(op)
    }

    /// Convert / TypeAs 需要显式目标类型
    pub fn requires_type(&self) -> bool {
        matches!(self, Self::Convert | Self::TypeAs)
    }
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// lambda 声明的参数
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterNode {
    pub name: String,
    pub ty: TypeRef,
}

impl ParameterNode {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// 表达式节点
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Constant {
        value: Value,
        value_type: TypeRef,
    },
    Parameter(ParameterNode),
    Member {
        object: Option<NodeId>,
        static_type: Option<String>,
        member_name: String,
    },
    Unary {
        op: UnaryOperator,
        operand: NodeId,
        explicit_type: Option<TypeRef>,
    },
    Binary {
        op: BinaryOperator,
        left: NodeId,
        right: NodeId,
    },
    MethodCall {
        object: Option<NodeId>,
        static_type: Option<String>,
        method_name: String,
        type_arguments: Vec<TypeRef>,
        arguments: Vec<NodeId>,
    },
    TypeTest {
        object: NodeId,
        query_type: TypeRef,
    },
    Lambda {
        parameters: Vec<ParameterNode>,
        body: NodeId,
    },
}

impl ExpressionNode {
    /// 文档中的节点名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "constantExpression",
            Self::Parameter(_) => "parameterExpression",
            Self::Member { .. } => "memberExpression",
            Self::Unary { .. } => "unaryExpression",
            Self::Binary { .. } => "binaryExpression",
            Self::MethodCall { .. } => "methodCallExpression",
            Self::TypeTest { .. } => "typeBinaryExpression",
            Self::Lambda { .. } => "lambdaExpression",
        }
    }

    /// 直接子节点，按文档顺序
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Constant { .. } | Self::Parameter(_) => Vec::new(),
            Self::Member { object, .. } => object.iter().copied().collect(),
            Self::Unary { operand, .. } => vec![*operand],
            Self::Binary { left, right, .. } => vec![*left, *right],
            Self::MethodCall {
                object, arguments, ..
            } => object.iter().chain(arguments.iter()).copied().collect(),
            Self::TypeTest { object, .. } => vec![*object],
            Self::Lambda { body, .. } => vec![*body],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_codes() {
        for code in ["eq", "ne", "lt", "lte", "gt", "gte", "and", "or", "add", "sub", "is"] {
            let op = BinaryOperator::from_code(code).unwrap();
            assert_eq!(op.code(), code);
        }
        assert!(BinaryOperator::from_code("xor").is_none());
        assert!(UnaryOperator::from_code("bitnot").is_none());
    }

    #[test]
    fn test_children_order() {
        let call = ExpressionNode::MethodCall {
            object: Some(1),
            static_type: None,
            method_name: "Any".into(),
            type_arguments: vec![],
            arguments: vec![2, 3],
        };
        assert_eq!(call.children(), vec![1, 2, 3]);
    }
}
