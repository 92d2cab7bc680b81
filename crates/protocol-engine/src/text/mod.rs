//! 文本表达式编译
//!
//! 把类 C# 的短表达式（如 `age >= 18 && DateTime.Now.Year > 2000`、`index + 1`）
//! 编译为可调用的 lambda。参数与常量由调用方通过 `TextSymbols` 注册；
//! 未注册的裸标识符按第一个参数的成员解析。

mod parser;

use std::collections::HashMap;
use std::sync::Arc;

use crate::convert::ValueConverter;
use crate::error::{Result, RuleError};
use crate::expression::{compile_lambda, CompiledLambda, NativeExpr, ParameterNode, UnaryOperator};
use crate::symbols::SymbolTable;
use crate::types::TypeRef;
use crate::value::Value;

pub use parser::{parse_expression, Syntax};

/// 主体参数名
pub const SUBJECT: &str = "_";
/// 当前时间参数名
pub const NOW: &str = "now";
/// 重复序号参数名
pub const INDEX: &str = "index";

/// 文本表达式可见的符号
#[derive(Debug, Clone, Default)]
pub struct TextSymbols {
    parameters: Vec<ParameterNode>,
    constants: HashMap<String, Value>,
    types: HashMap<String, TypeRef>,
}

impl TextSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// 条件表达式的符号：`(_, now)`
    pub fn for_condition(subject_type: TypeRef) -> Self {
        Self::new()
            .parameter(SUBJECT, subject_type)
            .parameter(NOW, TypeRef::DateTime)
    }

    /// 赋值表达式的符号：`(_, now, index)`
    pub fn for_assignment(scope_type: TypeRef) -> Self {
        Self::for_condition(scope_type).parameter(INDEX, TypeRef::Int)
    }

    /// 注册参数，按注册顺序成为 lambda 的参数
    pub fn parameter(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.parameters.push(ParameterNode::new(name, ty));
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    /// 注册类型别名（用于 `is` / `as` / 泛型参数 / 静态成员）
    pub fn register_type(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.types.insert(name.into(), ty);
        self
    }

    pub fn parameters(&self) -> &[ParameterNode] {
        &self.parameters
    }
}

/// 文本表达式编译能力
pub trait TextExpressionCompiler: Send + Sync {
    fn compile(&self, text: &str, symbols: &TextSymbols) -> Result<CompiledLambda>;
}

/// 参考实现
#[derive(Clone)]
pub struct TextCompiler {
    symbols: Arc<dyn SymbolTable>,
    converter: Arc<dyn ValueConverter>,
}

impl TextCompiler {
    pub fn new(symbols: Arc<dyn SymbolTable>, converter: Arc<dyn ValueConverter>) -> Self {
        Self { symbols, converter }
    }

    /// 解析并绑定为 lambda 表达式（不降级）
    pub fn bind(&self, text: &str, symbols: &TextSymbols) -> Result<NativeExpr> {
        let syntax = parse_expression(text).map_err(|e| RuleError::compilation(text, e))?;
        let mut binder = Binder {
            table: self.symbols.as_ref(),
            text: symbols,
            scopes: Vec::new(),
        };
        let body = binder.bind(&syntax)?;
        Ok(NativeExpr::lambda(symbols.parameters.clone(), body))
    }
}

impl TextExpressionCompiler for TextCompiler {
    fn compile(&self, text: &str, symbols: &TextSymbols) -> Result<CompiledLambda> {
        let lambda = self.bind(text, symbols)?;
        compile_lambda(&lambda, &self.symbols, &self.converter)
    }
}

struct Binder<'a> {
    table: &'a dyn SymbolTable,
    text: &'a TextSymbols,
    /// 嵌套 lambda 的参数，内层在后
    scopes: Vec<Vec<ParameterNode>>,
}

impl Binder<'_> {
    fn bind(&mut self, syntax: &Syntax) -> Result<NativeExpr> {
        match syntax {
            Syntax::Literal(value) => Ok(NativeExpr::constant(value.clone())),

            Syntax::Ident(name) => self.bind_ident(name),

            Syntax::Member { target, name } => {
                if let Some(ty) = self.static_type(target) {
                    return NativeExpr::static_member(&ty.name(), name, self.table);
                }
                let target = self.bind(target)?;
                NativeExpr::member(target, name, self.table)
            }

            Syntax::Call {
                target: None,
                name,
                type_arguments,
                arguments,
            } => {
                let receiver = self.implicit_receiver(name)?;
                self.bind_call(receiver, name, type_arguments, arguments)
            }

            Syntax::Call {
                target: Some(target),
                name,
                type_arguments,
                arguments,
            } => {
                if let Some(ty) = self.static_type(target) {
                    let type_args = self.resolve_types(type_arguments)?;
                    let args = arguments
                        .iter()
                        .map(|a| self.bind_argument(a, &TypeRef::Any))
                        .collect::<Result<Vec<_>>>()?;
                    return NativeExpr::static_call(&ty.name(), name, &type_args, args, self.table);
                }
                let receiver = self.bind(target)?;
                self.bind_call(receiver, name, type_arguments, arguments)
            }

            Syntax::Unary(op, operand) => Ok(NativeExpr::unary(*op, self.bind(operand)?)),

            Syntax::Binary(op, left, right) => {
                let left = self.bind(left)?;
                let right = self.bind(right)?;
                Ok(NativeExpr::binary(*op, left, right))
            }

            Syntax::TypeIs(operand, ty) => {
                let ty = self.resolve_type(ty)?;
                Ok(NativeExpr::type_test(self.bind(operand)?, ty))
            }

            Syntax::TypeAs(operand, ty) => {
                let ty = self.resolve_type(ty)?;
                Ok(NativeExpr::convert(UnaryOperator::TypeAs, self.bind(operand)?, ty))
            }

            Syntax::Lambda(params, body) => self.bind_lambda(params, body, &TypeRef::Any),
        }
    }

    fn bind_ident(&mut self, name: &str) -> Result<NativeExpr> {
        for scope in self.scopes.iter().rev() {
            if let Some(p) = scope.iter().find(|p| p.name == name) {
                return Ok(NativeExpr::Parameter(p.clone()));
            }
        }
        if let Some(p) = self.text.parameters.iter().find(|p| p.name == name) {
            return Ok(NativeExpr::Parameter(p.clone()));
        }
        if let Some(value) = self.text.constants.get(name) {
            return Ok(NativeExpr::constant(value.clone()));
        }
        let receiver = self.implicit_receiver(name)?;
        NativeExpr::member(receiver, name, self.table)
    }

    /// 裸标识符的隐式接收者：第一个注册参数
    fn implicit_receiver(&self, name: &str) -> Result<NativeExpr> {
        self.text
            .parameters
            .first()
            .map(|p| NativeExpr::Parameter(p.clone()))
            .ok_or_else(|| RuleError::symbol(name, "未定义的标识符"))
    }

    /// 目标是否为静态类名（未被参数或常量占用）
    fn static_type(&self, target: &Syntax) -> Option<TypeRef> {
        let Syntax::Ident(name) = target else {
            return None;
        };
        let shadowed = self.scopes.iter().flatten().any(|p| p.name == *name)
            || self.text.parameters.iter().any(|p| p.name == *name)
            || self.text.constants.contains_key(name);
        if shadowed {
            return None;
        }
        if let Some(ty) = self.text.types.get(name) {
            return Some(ty.clone());
        }
        // 只有首字母大写的已注册类型名视为静态类，避免吞掉同名属性
        if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
            return None;
        }
        self.table.resolve_type(name).ok()
    }

    fn bind_call(
        &mut self,
        receiver: NativeExpr,
        name: &str,
        type_arguments: &[String],
        arguments: &[Syntax],
    ) -> Result<NativeExpr> {
        let element = receiver
            .ty()
            .element_type()
            .cloned()
            .unwrap_or(TypeRef::Any);
        let type_args = self.resolve_types(type_arguments)?;
        let args = arguments
            .iter()
            .map(|a| self.bind_argument(a, &element))
            .collect::<Result<Vec<_>>>()?;
        NativeExpr::call(receiver, name, &type_args, args, self.table)
    }

    /// lambda 实参的参数类型取接收者集合的元素类型
    fn bind_argument(&mut self, argument: &Syntax, element: &TypeRef) -> Result<NativeExpr> {
        match argument {
            Syntax::Lambda(params, body) => self.bind_lambda(params, body, element),
            other => self.bind(other),
        }
    }

    fn bind_lambda(&mut self, params: &[String], body: &Syntax, ty: &TypeRef) -> Result<NativeExpr> {
        let parameters: Vec<ParameterNode> = params
            .iter()
            .map(|p| ParameterNode::new(p.clone(), ty.clone()))
            .collect();
        self.scopes.push(parameters.clone());
        let body = self.bind(body);
        self.scopes.pop();
        Ok(NativeExpr::lambda(parameters, body?))
    }

    fn resolve_type(&self, name: &str) -> Result<TypeRef> {
        match self.text.types.get(name) {
            Some(ty) => Ok(ty.clone()),
            None => self.table.resolve_type(name),
        }
    }

    fn resolve_types(&self, names: &[String]) -> Result<Vec<TypeRef>> {
        names.iter().map(|n| self.resolve_type(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DefaultValueConverter;
    use crate::record::Record;
    use crate::symbols::{SymbolRegistry, TypeDescriptor};
    use chrono::Utc;
    use serde_json::json;

    fn compiler() -> TextCompiler {
        let mut registry = SymbolRegistry::with_builtins();
        registry.register(
            TypeDescriptor::new("Patient")
                .property("age", TypeRef::Int)
                .property("addresses", TypeRef::list(TypeRef::record("EntityAddress"))),
        );
        registry.register(
            TypeDescriptor::new("EntityAddress")
                .property("use", TypeRef::String)
                .property("city", TypeRef::String),
        );
        TextCompiler::new(Arc::new(registry), Arc::new(DefaultValueConverter))
    }

    fn patient() -> Value {
        Value::from_json(json!({
            "$type": "Patient",
            "age": 30,
            "addresses": [
                {"$type": "EntityAddress", "use": "home", "city": "Hamilton"},
                {"$type": "EntityAddress", "use": "work", "city": "Toronto"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_implicit_members() {
        let symbols = TextSymbols::for_condition(TypeRef::record("Patient"));
        let lambda = compiler().compile("age >= 18 && age <= 65", &symbols).unwrap();
        assert_eq!(lambda.arity(), 2);
        let now = Value::DateTime(Utc::now());
        assert!(lambda.test(&[patient(), now]).unwrap());
    }

    #[test]
    fn test_explicit_subject_and_lambda_argument() {
        let symbols = TextSymbols::for_condition(TypeRef::record("Patient"));
        let lambda = compiler()
            .compile("_.addresses.Any(a => a.city == \"Toronto\")", &symbols)
            .unwrap();
        assert!(lambda.test(&[patient(), Value::DateTime(Utc::now())]).unwrap());
    }

    #[test]
    fn test_index_parameter() {
        let symbols = TextSymbols::for_assignment(TypeRef::record("Patient"));
        let lambda = compiler().compile("index + 1", &symbols).unwrap();
        assert_eq!(lambda.return_type(), &TypeRef::Int);
        let result = lambda
            .invoke(&[patient(), Value::DateTime(Utc::now()), Value::Int(2)])
            .unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[test]
    fn test_static_member_and_constant() {
        let symbols = TextSymbols::for_condition(TypeRef::record("Patient")).constant("minAge", 18);
        let lambda = compiler()
            .compile("DateTime.Now.Year > 2000 && age > minAge", &symbols)
            .unwrap();
        assert!(lambda.test(&[patient(), Value::DateTime(Utc::now())]).unwrap());
    }

    #[test]
    fn test_unknown_member_is_symbol_error() {
        let symbols = TextSymbols::for_condition(TypeRef::record("Patient"));
        let err = compiler().compile("shoeSize > 3", &symbols).unwrap_err();
        assert_eq!(err.code(), "SYMBOL_RESOLUTION_ERROR");
    }

    #[test]
    fn test_syntax_error_is_compilation_error() {
        let symbols = TextSymbols::for_condition(TypeRef::Any);
        let err = compiler().compile("age >=", &symbols).unwrap_err();
        assert_eq!(err.code(), "COMPILATION_ERROR");
    }

    #[test]
    fn test_dynamic_subject() {
        let symbols = TextSymbols::for_condition(TypeRef::Any);
        let lambda = compiler().compile("dose == 2", &symbols).unwrap();
        let act = Value::from(Record::new("SubstanceAdministration").with_property("dose", 2));
        assert!(lambda.test(&[act, Value::DateTime(Utc::now())]).unwrap());
    }
}
