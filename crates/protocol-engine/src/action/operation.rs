//! 属性操作
//!
//! - `assign`：计算值并写入生成记录的属性，可通过 `scope` / `where` 改变求值对象
//! - `add`：向集合属性追加静态值

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::condition::{collaborator_error, CompileCache};
use crate::error::{Result, RuleError};
use crate::expression::CompiledLambda;
use crate::query::Predicate;
use crate::record::{Participation, Record, Relationship};
use crate::services::{EngineServices, EvaluationContext};
use crate::text::TextSymbols;
use crate::types::TypeRef;
use crate::value::Value;

#[derive(Clone)]
struct CompiledAssign {
    value: CompiledLambda,
    filter: Option<Predicate>,
}

/// 赋值操作
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignOperation {
    pub property_name: String,
    /// 相对主体的属性路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// 作用域集合上的过滤查询，取第一个匹配元素
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_filter: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expression: String,
    /// 内联值，存在时直接写入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip)]
    compiled: CompileCache<CompiledAssign>,
}

impl AssignOperation {
    pub fn new(property_name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            expression: expression.into(),
            ..Default::default()
        }
    }

    pub fn inline(property_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property_name: property_name.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn filtered(mut self, filter: impl Into<String>) -> Self {
        self.where_filter = Some(filter.into());
        self
    }

    pub fn compile_count(&self) -> usize {
        self.compiled.compilations()
    }

    /// 执行赋值；作用域或过滤无结果时不修改目标属性
    pub fn apply(
        &self,
        target: &mut Record,
        subject: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<()> {
        // 内联值不做类型检查
        if let Some(value) = &self.value {
            return target.set(&self.property_name, value.clone());
        }

        let compiled = self
            .compiled
            .get_or_try_init(|| self.compile(services, subject))?;

        let scope = match &self.scope {
            None => subject.clone(),
            Some(path) => match resolve_scope(subject, path) {
                Some(scope) => scope,
                None => {
                    debug!(property = %self.property_name, scope = %path, "作用域未解析，跳过赋值");
                    return Ok(());
                }
            },
        };

        let scope = match &compiled.filter {
            None => scope,
            Some(filter) => {
                let Value::List(items) = scope else {
                    return Err(RuleError::evaluation(format!(
                        "where 过滤需要集合作用域, 实际 {}",
                        scope.type_name()
                    )));
                };
                let mut selected = None;
                for item in items {
                    if filter(&item)? {
                        selected = Some(item);
                        break;
                    }
                }
                match selected {
                    Some(item) => item,
                    None => {
                        debug!(property = %self.property_name, "where 过滤无匹配，跳过赋值");
                        return Ok(());
                    }
                }
            }
        };

        let raw = compiled
            .value
            .invoke(&[scope, Value::DateTime(ctx.now), Value::Int(ctx.index)])?;

        let value = match declared_type(target, &self.property_name, services) {
            Some(ty) => services.converter.convert(raw, &ty).map_err(|e| {
                RuleError::TypeConversion {
                    property: self.property_name.clone(),
                    target: ty.to_string(),
                    message: e.0,
                }
            })?,
            None => raw,
        };
        target.set(&self.property_name, value)
    }

    fn compile(&self, services: &EngineServices, subject: &Value) -> Result<CompiledAssign> {
        if self.expression.trim().is_empty() {
            return Err(RuleError::compilation(
                format!("assign[{}]", self.property_name),
                "缺少值表达式",
            ));
        }

        let subject_type = services.type_of(subject);
        let (scope_type, element_type) = match &self.scope {
            None => (subject_type, TypeRef::Any),
            Some(path) => {
                let scope_type = path_type(services, &subject_type, path);
                match (&self.where_filter, scope_type.element_type()) {
                    (Some(_), Some(element)) => (element.clone(), element.clone()),
                    (Some(_), None) => (TypeRef::Any, TypeRef::Any),
                    (None, _) => (scope_type, TypeRef::Any),
                }
            }
        };

        let value = services
            .text
            .compile(&self.expression, &TextSymbols::for_assignment(scope_type))
            .map_err(|e| collaborator_error(e, "expression"))?;

        let filter = match (&self.scope, &self.where_filter) {
            (Some(_), Some(filter)) => Some(
                services
                    .query
                    .compile(filter, &element_type)
                    .map_err(|e| collaborator_error(e, "where"))?,
            ),
            _ => None,
        };

        debug!(property = %self.property_name, returns = %value.return_type(), "编译赋值表达式");
        Ok(CompiledAssign { value, filter })
    }
}

/// 按符号表推断作用域路径的静态类型，无法推断时为动态类型
fn path_type(services: &EngineServices, subject_type: &TypeRef, path: &str) -> TypeRef {
    let mut ty = subject_type.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        ty = match &ty {
            TypeRef::Any => return TypeRef::Any,
            TypeRef::List(element) if segment.parse::<usize>().is_ok() => element.as_ref().clone(),
            current => match services.symbols.resolve_property(current, segment) {
                Ok(accessor) => accessor.value_type,
                Err(_) => return TypeRef::Any,
            },
        };
    }
    ty
}

fn resolve_scope(subject: &Value, path: &str) -> Option<Value> {
    match subject {
        Value::Record(record) => record.resolve_path(path).filter(|v| !v.is_null()),
        _ => None,
    }
}

fn declared_type(target: &Record, name: &str, services: &EngineServices) -> Option<TypeRef> {
    let ty = services.symbols.resolve_type(&target.class_name).ok()?;
    let accessor = services.symbols.resolve_property(&ty, name).ok()?;
    match accessor.value_type {
        TypeRef::Any => None,
        ty => Some(ty),
    }
}

/// 追加操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOperation {
    pub property_name: String,
    pub value: Value,
}

impl AddOperation {
    pub fn new(property_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property_name: property_name.into(),
            value: value.into(),
        }
    }

    /// 追加到集合属性；`participation` / `relationship` 按关系条目解析
    pub fn apply(&self, target: &mut Record) -> Result<()> {
        let name = self.property_name.as_str();
        if name.eq_ignore_ascii_case("participation") {
            let link: Participation = serde_json::from_value(self.value.to_json())?;
            target.add_participation(Arc::new(link));
            return Ok(());
        }
        if name.eq_ignore_ascii_case("relationship") {
            let link: Relationship = serde_json::from_value(self.value.to_json())?;
            target.relationships.push(Arc::new(link));
            return Ok(());
        }

        let items = match target.get(name) {
            None | Some(Value::Null) => vec![self.value.clone()],
            Some(Value::List(items)) => {
                let mut items = items.clone();
                items.push(self.value.clone());
                items
            }
            Some(other) => {
                return Err(RuleError::evaluation(format!(
                    "{} 不是集合属性 (实际 {})",
                    name,
                    other.type_name()
                )));
            }
        };
        target.set(name, Value::List(items))
    }
}

/// 属性操作，按声明顺序执行
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyOperation {
    Assign(AssignOperation),
    Add(AddOperation),
}

impl PropertyOperation {
    pub fn property_name(&self) -> &str {
        match self {
            Self::Assign(op) => &op.property_name,
            Self::Add(op) => &op.property_name,
        }
    }

    pub fn apply(
        &self,
        target: &mut Record,
        subject: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<()> {
        match self {
            Self::Assign(op) => op.apply(target, subject, services, ctx),
            Self::Add(op) => op.apply(target),
        }
    }
}

impl From<AssignOperation> for PropertyOperation {
    fn from(op: AssignOperation) -> Self {
        Self::Assign(op)
    }
}

impl From<AddOperation> for PropertyOperation {
    fn from(op: AddOperation) -> Self {
        Self::Add(op)
    }
}
