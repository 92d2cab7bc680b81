//! 宿主可执行表达式
//!
//! `NativeExpr` 是符号已解析、类型已确定的表达式树，可以由文档节点转换得到，
//! 也可以在代码中用构造函数直接搭建（再经 `from_native` 保存为文档）。

use crate::error::{Result, RuleError};
use crate::expression::node::{BinaryOperator, ParameterNode, UnaryOperator};
use crate::symbols::{Accessor, Invoker, SymbolTable};
use crate::types::TypeRef;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum NativeExpr {
    Constant {
        value: Value,
        ty: TypeRef,
    },
    Parameter(ParameterNode),
    Property {
        target: Option<Box<NativeExpr>>,
        accessor: Accessor,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<NativeExpr>,
        ty: TypeRef,
    },
    Binary {
        op: BinaryOperator,
        left: Box<NativeExpr>,
        right: Box<NativeExpr>,
    },
    Call {
        target: Option<Box<NativeExpr>>,
        invoker: Invoker,
        arguments: Vec<NativeExpr>,
    },
    TypeTest {
        operand: Box<NativeExpr>,
        ty: TypeRef,
    },
    Lambda {
        parameters: Vec<ParameterNode>,
        body: Box<NativeExpr>,
    },
}

impl NativeExpr {
    /// 表达式类型
    ///
    /// 二元表达式为 bool，Add/Subtract 取左操作数类型；lambda 取函数体类型；
    /// Convert/TypeAs 取声明类型，其余一元表达式取操作数类型。
    pub fn ty(&self) -> TypeRef {
        match self {
            Self::Constant { ty, .. } => ty.clone(),
            Self::Parameter(p) => p.ty.clone(),
            Self::Property { accessor, .. } => accessor.value_type.clone(),
            Self::Unary { ty, .. } => ty.clone(),
            Self::Binary { op, left, .. } if op.is_arithmetic() => left.ty(),
            Self::Binary { .. } | Self::TypeTest { .. } => TypeRef::Bool,
            Self::Call { invoker, .. } => invoker.return_type.clone(),
            Self::Lambda { body, .. } => body.ty(),
        }
    }

    /// 作为方法实参时的类型，lambda 报告为委托类型
    pub fn argument_type(&self) -> TypeRef {
        match self {
            Self::Lambda { parameters, body } => TypeRef::function(
                parameters.iter().map(|p| p.ty.clone()).collect(),
                body.ty(),
            ),
            other => other.ty(),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Lambda { parameters, .. } => parameters.len(),
            _ => 0,
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        let ty = value.type_ref();
        Self::Constant { value, ty }
    }

    pub fn typed_constant(value: Value, ty: TypeRef) -> Self {
        Self::Constant { value, ty }
    }

    pub fn parameter(name: impl Into<String>, ty: TypeRef) -> Self {
        Self::Parameter(ParameterNode::new(name, ty))
    }

    /// 实例成员访问，按目标类型解析
    pub fn member(target: NativeExpr, name: &str, symbols: &dyn SymbolTable) -> Result<Self> {
        let accessor = symbols.resolve_property(&target.ty(), name)?;
        Ok(Self::Property {
            target: Some(Box::new(target)),
            accessor,
        })
    }

    /// 静态成员访问，如 `DateTime.Now`
    pub fn static_member(type_name: &str, name: &str, symbols: &dyn SymbolTable) -> Result<Self> {
        let ty = symbols.resolve_type(type_name)?;
        let accessor = symbols.resolve_property(&ty, name)?;
        if !accessor.is_static {
            return Err(RuleError::symbol(
                format!("{}.{}", type_name, name),
                "不是静态成员",
            ));
        }
        Ok(Self::Property {
            target: None,
            accessor,
        })
    }

    /// 实例方法调用
    pub fn call(
        target: NativeExpr,
        name: &str,
        type_arguments: &[TypeRef],
        arguments: Vec<NativeExpr>,
        symbols: &dyn SymbolTable,
    ) -> Result<Self> {
        let arg_types: Vec<TypeRef> = arguments.iter().map(Self::argument_type).collect();
        let invoker = symbols
            .resolve_method(&target.ty(), name, &arg_types, type_arguments)?
            .with_type_arguments(type_arguments.to_vec());
        Ok(Self::Call {
            target: Some(Box::new(target)),
            invoker,
            arguments,
        })
    }

    /// 静态方法调用，如 `Math.Max(a, b)`
    pub fn static_call(
        type_name: &str,
        name: &str,
        type_arguments: &[TypeRef],
        arguments: Vec<NativeExpr>,
        symbols: &dyn SymbolTable,
    ) -> Result<Self> {
        let ty = symbols.resolve_type(type_name)?;
        let arg_types: Vec<TypeRef> = arguments.iter().map(Self::argument_type).collect();
        let invoker = symbols
            .resolve_method(&ty, name, &arg_types, type_arguments)?
            .with_type_arguments(type_arguments.to_vec());
        if !invoker.is_static {
            return Err(RuleError::symbol(
                format!("{}.{}", type_name, name),
                "不是静态方法",
            ));
        }
        Ok(Self::Call {
            target: None,
            invoker,
            arguments,
        })
    }

    pub fn binary(op: BinaryOperator, left: NativeExpr, right: NativeExpr) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOperator, operand: NativeExpr) -> Self {
        let ty = match op {
            UnaryOperator::Not => TypeRef::Bool,
            _ => operand.ty(),
        };
        Self::Unary {
            op,
            operand: Box::new(operand),
            ty,
        }
    }

    /// 带目标类型的一元表达式（Convert / TypeAs）
    pub fn convert(op: UnaryOperator, operand: NativeExpr, ty: TypeRef) -> Self {
        Self::Unary {
            op,
            operand: Box::new(operand),
            ty,
        }
    }

    pub fn type_test(operand: NativeExpr, ty: TypeRef) -> Self {
        Self::TypeTest {
            operand: Box::new(operand),
            ty,
        }
    }

    pub fn lambda(parameters: Vec<ParameterNode>, body: NativeExpr) -> Self {
        Self::Lambda {
            parameters,
            body: Box::new(body),
        }
    }

    pub fn equal(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::Equal, self, other)
    }

    pub fn ge(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::GreaterThanOrEqual, self, other)
    }

    pub fn le(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::LessThanOrEqual, self, other)
    }

    pub fn and_also(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::AndAlso, self, other)
    }

    pub fn or_else(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::OrElse, self, other)
    }

    pub fn plus(self, other: NativeExpr) -> Self {
        Self::binary(BinaryOperator::Add, self, other)
    }
}
