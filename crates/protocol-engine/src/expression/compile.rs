//! 闭包降级
//!
//! 把 `NativeExpr` 一次性降级为嵌套闭包。参数在编译期按名称解析为
//! (层级, 下标)，运行时沿 `Env` 链取值；嵌套 lambda 捕获当前环境生成函数值。

use std::cmp::Ordering;
use std::sync::Arc;

use crate::convert::ValueConverter;
use crate::error::{Result, RuleError};
use crate::expression::native::NativeExpr;
use crate::expression::node::{BinaryOperator, ParameterNode, UnaryOperator};
use crate::symbols::SymbolTable;
use crate::types::TypeRef;
use crate::value::{FunctionValue, Value};

/// 运行时参数帧
pub struct Env {
    frame: Vec<Value>,
    parent: Option<Arc<Env>>,
}

impl Env {
    fn lookup(&self, depth: usize, index: usize) -> Result<Value> {
        let mut env = self;
        for _ in 0..depth {
            env = env
                .parent
                .as_deref()
                .ok_or_else(|| RuleError::evaluation("参数作用域链断裂"))?;
        }
        env.frame
            .get(index)
            .cloned()
            .ok_or_else(|| RuleError::evaluation("参数下标越界"))
    }
}

type Eval = Arc<dyn Fn(&Arc<Env>) -> Result<Value> + Send + Sync>;

/// 编译后的 lambda
#[derive(Clone)]
pub struct CompiledLambda {
    parameters: Vec<ParameterNode>,
    return_type: TypeRef,
    body: Eval,
}

impl CompiledLambda {
    pub fn arity(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &[ParameterNode] {
        &self.parameters
    }

    pub fn return_type(&self) -> &TypeRef {
        &self.return_type
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.parameters.len() {
            return Err(RuleError::evaluation(format!(
                "参数个数不匹配: 期望 {}, 实际 {}",
                self.parameters.len(),
                args.len()
            )));
        }
        let env = Arc::new(Env {
            frame: args.to_vec(),
            parent: None,
        });
        (self.body)(&env)
    }

    /// 调用并要求布尔结果
    pub fn test(&self, args: &[Value]) -> Result<bool> {
        self.invoke(args)?.expect_bool("谓词结果")
    }
}

impl std::fmt::Debug for CompiledLambda {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect();
        write!(f, "({}) -> {}", params.join(", "), self.return_type)
    }
}

/// 把顶层 lambda 编译为可调用对象
pub fn compile_lambda(
    expr: &NativeExpr,
    symbols: &Arc<dyn SymbolTable>,
    converter: &Arc<dyn ValueConverter>,
) -> Result<CompiledLambda> {
    let NativeExpr::Lambda { parameters, body } = expr else {
        return Err(RuleError::compilation("root", "只能编译 lambda 表达式"));
    };
    let lowering = Lowering {
        symbols: symbols.clone(),
        converter: converter.clone(),
    };
    let mut scopes = vec![names(parameters)];
    let compiled = lowering.lower(body, &mut scopes)?;
    Ok(CompiledLambda {
        parameters: parameters.clone(),
        return_type: body.ty(),
        body: compiled,
    })
}

fn names(parameters: &[ParameterNode]) -> Vec<String> {
    parameters.iter().map(|p| p.name.clone()).collect()
}

struct Lowering {
    symbols: Arc<dyn SymbolTable>,
    converter: Arc<dyn ValueConverter>,
}

impl Lowering {
    fn lower(&self, expr: &NativeExpr, scopes: &mut Vec<Vec<String>>) -> Result<Eval> {
        let eval: Eval = match expr {
            NativeExpr::Constant { value, .. } => {
                let value = value.clone();
                Arc::new(move |_: &Arc<Env>| Ok(value.clone()))
            }

            NativeExpr::Parameter(param) => {
                let (depth, index) = resolve(scopes, &param.name)?;
                Arc::new(move |env: &Arc<Env>| env.lookup(depth, index))
            }

            NativeExpr::Property { target, accessor } => {
                let accessor = accessor.clone();
                match target {
                    Some(target) => {
                        let target = self.lower(target, scopes)?;
                        Arc::new(move |env: &Arc<Env>| {
                            let value = target(env)?;
                            accessor.get(Some(&value))
                        })
                    }
                    None => Arc::new(move |_: &Arc<Env>| accessor.get(None)),
                }
            }

            NativeExpr::Call {
                target,
                invoker,
                arguments,
            } => {
                let invoker = invoker.clone();
                let target = target
                    .as_ref()
                    .map(|t| self.lower(t, scopes))
                    .transpose()?;
                let arguments = arguments
                    .iter()
                    .map(|a| self.lower(a, scopes))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(move |env: &Arc<Env>| {
                    let receiver = target.as_ref().map(|t| t(env)).transpose()?;
                    let args = arguments
                        .iter()
                        .map(|a| a(env))
                        .collect::<Result<Vec<_>>>()?;
                    invoker.invoke(receiver.as_ref(), &args)
                })
            }

            NativeExpr::Unary { op, operand, ty } => {
                let operand = self.lower(operand, scopes)?;
                self.lower_unary(*op, operand, ty.clone())
            }

            NativeExpr::Binary { op, left, right } => self.lower_binary(*op, left, right, scopes)?,

            NativeExpr::TypeTest { operand, ty } => {
                let operand = self.lower(operand, scopes)?;
                let symbols = self.symbols.clone();
                let ty = ty.clone();
                Arc::new(move |env: &Arc<Env>| Ok(Value::Bool(symbols.is_instance_of(&operand(env)?, &ty))))
            }

            NativeExpr::Lambda { parameters, body } => {
                scopes.push(names(parameters));
                let body = self.lower(body, scopes);
                scopes.pop();
                let body = body?;
                let arity = parameters.len();
                Arc::new(move |env: &Arc<Env>| {
                    let captured = env.clone();
                    let body = body.clone();
                    Ok(Value::Function(FunctionValue::new(
                        arity,
                        Arc::new(move |args: &[Value]| {
                            let frame = Arc::new(Env {
                                frame: args.to_vec(),
                                parent: Some(captured.clone()),
                            });
                            body(&frame)
                        }),
                    )))
                })
            }
        };
        Ok(eval)
    }

    fn lower_unary(&self, op: UnaryOperator, operand: Eval, ty: TypeRef) -> Eval {
        match op {
            UnaryOperator::Not => Arc::new(move |env: &Arc<Env>| match operand(env)? {
                Value::Null => Ok(Value::Null),
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(RuleError::evaluation(format!(
                    "not 需要布尔值, 实际 {}",
                    other.type_name()
                ))),
            }),
            UnaryOperator::Negate => Arc::new(move |env: &Arc<Env>| match operand(env)? {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| RuleError::evaluation("整数溢出")),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(RuleError::evaluation(format!(
                    "neg 需要数值, 实际 {}",
                    other.type_name()
                ))),
            }),
            UnaryOperator::Convert => {
                let converter = self.converter.clone();
                Arc::new(move |env: &Arc<Env>| {
                    let value = operand(env)?;
                    converter
                        .convert(value, &ty)
                        .map_err(|e| RuleError::TypeConversion {
                            property: "convert".to_string(),
                            target: ty.name(),
                            message: e.to_string(),
                        })
                })
            }
            UnaryOperator::TypeAs => {
                let symbols = self.symbols.clone();
                Arc::new(move |env: &Arc<Env>| {
                    let value = operand(env)?;
                    Ok(if symbols.is_instance_of(&value, &ty) {
                        value
                    } else {
                        Value::Null
                    })
                })
            }
        }
    }

    fn lower_binary(
        &self,
        op: BinaryOperator,
        left: &NativeExpr,
        right: &NativeExpr,
        scopes: &mut Vec<Vec<String>>,
    ) -> Result<Eval> {
        if op == BinaryOperator::TypeIs {
            let ty = match right {
                NativeExpr::Constant {
                    value: Value::String(name),
                    ..
                } => self.symbols.resolve_type(name)?,
                _ => return Err(RuleError::compilation("is", "右操作数必须是类型名常量")),
            };
            let operand = self.lower(left, scopes)?;
            let symbols = self.symbols.clone();
            return Ok(Arc::new(move |env: &Arc<Env>| {
                Ok(Value::Bool(symbols.is_instance_of(&operand(env)?, &ty)))
            }));
        }

        let left = self.lower(left, scopes)?;
        let right = self.lower(right, scopes)?;

        let eval: Eval = match op {
            BinaryOperator::AndAlso => Arc::new(move |env: &Arc<Env>| {
                if !left(env)?.expect_bool("&& 左操作数")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(right(env)?.expect_bool("&& 右操作数")?))
            }),
            BinaryOperator::OrElse => Arc::new(move |env: &Arc<Env>| {
                if left(env)?.expect_bool("|| 左操作数")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(right(env)?.expect_bool("|| 右操作数")?))
            }),
            BinaryOperator::Equal => Arc::new(move |env: &Arc<Env>| Ok(Value::Bool(left(env)? == right(env)?))),
            BinaryOperator::NotEqual => {
                Arc::new(move |env: &Arc<Env>| Ok(Value::Bool(left(env)? != right(env)?)))
            }
            BinaryOperator::LessThan
            | BinaryOperator::LessThanOrEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanOrEqual => Arc::new(move |env: &Arc<Env>| {
                let (a, b) = (left(env)?, right(env)?);
                if a.is_null() || b.is_null() {
                    return Ok(Value::Bool(false));
                }
                let ordering = compare(&a, &b)?;
                let result = match op {
                    BinaryOperator::LessThan => ordering == Ordering::Less,
                    BinaryOperator::LessThanOrEqual => ordering != Ordering::Greater,
                    BinaryOperator::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                Ok(Value::Bool(result))
            }),
            BinaryOperator::Add => Arc::new(move |env: &Arc<Env>| add(left(env)?, right(env)?)),
            BinaryOperator::Subtract => Arc::new(move |env: &Arc<Env>| subtract(left(env)?, right(env)?)),
            BinaryOperator::TypeIs => return Err(RuleError::compilation("is", "类型判断必须单独处理")),
        };
        Ok(eval)
    }
}

fn resolve(scopes: &[Vec<String>], name: &str) -> Result<(usize, usize)> {
    for (depth, scope) in scopes.iter().rev().enumerate() {
        if let Some(index) = scope.iter().position(|n| n == name) {
            return Ok((depth, index));
        }
    }
    Err(RuleError::symbol(name, "参数不在任何 lambda 作用域内"))
}

/// 比较两个值，数值统一按浮点数比较
pub(crate) fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    ordering.ok_or_else(|| {
        RuleError::evaluation(format!(
            "无法比较 {} 与 {}",
            a.type_name(),
            b.type_name()
        ))
    })
}

fn add(a: Value, b: Value) -> Result<Value> {
    match (a, b) {
        (Value::String(x), y) => Ok(Value::String(format!("{}{}", x, display_or_empty(&y)))),
        (x, Value::String(y)) => Ok(Value::String(format!("{}{}", display_or_empty(&x), y))),
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(y)
            .map(Value::Int)
            .ok_or_else(|| RuleError::evaluation("整数溢出")),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(p), Some(q)) => Ok(Value::Float(p + q)),
            _ => Err(RuleError::evaluation(format!(
                "无法相加 {} 与 {}",
                x.type_name(),
                y.type_name()
            ))),
        },
    }
}

fn subtract(a: Value, b: Value) -> Result<Value> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(x), Value::Int(y)) => x
            .checked_sub(y)
            .map(Value::Int)
            .ok_or_else(|| RuleError::evaluation("整数溢出")),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(p), Some(q)) => Ok(Value::Float(p - q)),
            _ => Err(RuleError::evaluation(format!(
                "无法相减 {} 与 {}",
                x.type_name(),
                y.type_name()
            ))),
        },
    }
}

fn display_or_empty(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DefaultValueConverter;
    use crate::record::Record;
    use crate::symbols::{SymbolRegistry, TypeDescriptor};

    fn services() -> (Arc<dyn SymbolTable>, Arc<dyn ValueConverter>) {
        let mut registry = SymbolRegistry::with_builtins();
        registry.register(
            TypeDescriptor::new("Patient")
                .property("age", TypeRef::Int)
                .property("names", TypeRef::list(TypeRef::String)),
        );
        (Arc::new(registry), Arc::new(DefaultValueConverter))
    }

    fn patient(age: i64) -> Value {
        Value::from(Record::new("Patient").with_property("age", age))
    }

    #[test]
    fn test_age_range_predicate() {
        let (symbols, converter) = services();
        let s = NativeExpr::parameter("s", TypeRef::record("Patient"));
        let age = NativeExpr::member(s.clone(), "age", symbols.as_ref()).unwrap();
        let body = age
            .clone()
            .ge(NativeExpr::constant(18))
            .and_also(age.le(NativeExpr::constant(65)));
        let lambda = NativeExpr::lambda(
            vec![ParameterNode::new("s", TypeRef::record("Patient"))],
            body,
        );

        let compiled = compile_lambda(&lambda, &symbols, &converter).unwrap();
        assert_eq!(compiled.arity(), 1);
        assert!(compiled.test(&[patient(30)]).unwrap());
        assert!(!compiled.test(&[patient(70)]).unwrap());
    }

    #[test]
    fn test_nested_lambda_captures_outer_parameter() {
        let (symbols, converter) = services();
        // (s, prefix) => s.names.Any(n => n.StartsWith(prefix))
        let s = NativeExpr::parameter("s", TypeRef::record("Patient"));
        let names = NativeExpr::member(s, "names", symbols.as_ref()).unwrap();
        let n = NativeExpr::parameter("n", TypeRef::String);
        let prefix = NativeExpr::parameter("prefix", TypeRef::String);
        let starts = NativeExpr::call(n, "StartsWith", &[], vec![prefix], symbols.as_ref()).unwrap();
        let inner = NativeExpr::lambda(vec![ParameterNode::new("n", TypeRef::String)], starts);
        let any = NativeExpr::call(names, "Any", &[], vec![inner], symbols.as_ref()).unwrap();
        let lambda = NativeExpr::lambda(
            vec![
                ParameterNode::new("s", TypeRef::record("Patient")),
                ParameterNode::new("prefix", TypeRef::String),
            ],
            any,
        );

        let compiled = compile_lambda(&lambda, &symbols, &converter).unwrap();
        let subject = Value::from(Record::new("Patient").with_property(
            "names",
            Value::List(vec![Value::from("Smith"), Value::from("Jones")]),
        ));
        assert!(compiled.test(&[subject.clone(), Value::from("Jo")]).unwrap());
        assert!(!compiled.test(&[subject, Value::from("Ka")]).unwrap());
    }

    #[test]
    fn test_add_semantics() {
        assert_eq!(add(Value::Int(1), Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(add(Value::Int(1), Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(add(Value::from("dose "), Value::Int(2)).unwrap(), Value::from("dose 2"));
        assert_eq!(add(Value::Null, Value::Int(2)).unwrap(), Value::Null);
        assert!(add(Value::Bool(true), Value::Int(2)).is_err());
    }

    #[test]
    fn test_null_comparison_is_false() {
        let (symbols, converter) = services();
        let s = NativeExpr::parameter("s", TypeRef::record("Patient"));
        let age = NativeExpr::member(s, "age", symbols.as_ref()).unwrap();
        let lambda = NativeExpr::lambda(
            vec![ParameterNode::new("s", TypeRef::record("Patient"))],
            age.ge(NativeExpr::constant(18)),
        );
        let compiled = compile_lambda(&lambda, &symbols, &converter).unwrap();
        let unknown_age = Value::from(Record::new("Patient"));
        assert!(!compiled.test(&[unknown_age]).unwrap());
    }

    #[test]
    fn test_convert_failure() {
        let (symbols, converter) = services();
        let x = NativeExpr::parameter("x", TypeRef::String);
        let lambda = NativeExpr::lambda(
            vec![ParameterNode::new("x", TypeRef::String)],
            NativeExpr::convert(UnaryOperator::Convert, x, TypeRef::Int),
        );
        let compiled = compile_lambda(&lambda, &symbols, &converter).unwrap();
        assert_eq!(compiled.invoke(&[Value::from("42")]).unwrap(), Value::Int(42));
        let err = compiled.invoke(&[Value::from("forty")]).unwrap_err();
        assert_eq!(err.code(), "TYPE_CONVERSION_ERROR");
    }
}
