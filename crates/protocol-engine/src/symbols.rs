//! 符号表
//!
//! 表达式树中的成员访问与方法调用通过 `SymbolTable` 解析为访问器/调用器。
//! `SymbolRegistry` 是预注册实现：记录类型按名称注册属性和方法，
//! 字符串、日期、集合等内置成员由注册表直接提供。

use chrono::{Datelike, Duration, Months, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::convert::{DefaultValueConverter, ValueConverter};
use crate::error::{Result, RuleError};
use crate::types::TypeRef;
use crate::value::Value;

pub type PropertyGetter = Arc<dyn Fn(Option<&Value>) -> Result<Value> + Send + Sync>;
pub type MethodBody = Arc<dyn Fn(Option<&Value>, &[Value]) -> Result<Value> + Send + Sync>;

/// 已解析的属性访问器
#[derive(Clone)]
pub struct Accessor {
    pub declaring_type: TypeRef,
    pub name: String,
    pub value_type: TypeRef,
    pub is_static: bool,
    getter: PropertyGetter,
}

impl Accessor {
    pub fn new(
        declaring_type: TypeRef,
        name: impl Into<String>,
        value_type: TypeRef,
        is_static: bool,
        getter: PropertyGetter,
    ) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            value_type,
            is_static,
            getter,
        }
    }

    pub fn get(&self, target: Option<&Value>) -> Result<Value> {
        (self.getter)(target)
    }
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.declaring_type, self.name, self.value_type)
    }
}

/// 已解析的方法调用器
#[derive(Clone)]
pub struct Invoker {
    pub declaring_type: TypeRef,
    pub name: String,
    pub return_type: TypeRef,
    pub type_arguments: Vec<TypeRef>,
    pub is_static: bool,
    body: MethodBody,
}

impl Invoker {
    pub fn new(
        declaring_type: TypeRef,
        name: impl Into<String>,
        return_type: TypeRef,
        is_static: bool,
        body: MethodBody,
    ) -> Self {
        Self {
            declaring_type,
            name: name.into(),
            return_type,
            type_arguments: Vec::new(),
            is_static,
            body,
        }
    }

    pub fn with_type_arguments(mut self, type_arguments: Vec<TypeRef>) -> Self {
        self.type_arguments = type_arguments;
        self
    }

    pub fn invoke(&self, target: Option<&Value>, args: &[Value]) -> Result<Value> {
        (self.body)(target, args)
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(..): {}", self.declaring_type, self.name, self.return_type)
    }
}

/// 符号解析能力，由宿主提供
pub trait SymbolTable: Send + Sync {
    /// 解析类型名（用于 staticClass、类型转换与类型判断）
    fn resolve_type(&self, name: &str) -> Result<TypeRef>;

    fn resolve_property(&self, ty: &TypeRef, name: &str) -> Result<Accessor>;

    fn resolve_method(
        &self,
        ty: &TypeRef,
        name: &str,
        arg_types: &[TypeRef],
        type_args: &[TypeRef],
    ) -> Result<Invoker>;

    /// 运行时类型判断（TypeIs / TypeAs）
    fn is_instance_of(&self, value: &Value, ty: &TypeRef) -> bool {
        match (value, ty) {
            (Value::Null, _) => false,
            (_, TypeRef::Any) => true,
            (Value::Record(r), TypeRef::Record(name)) => r.class_name == *name,
            (v, t) => v.type_ref() == *t,
        }
    }
}

/// JSON 类型声明
#[derive(Debug, Deserialize)]
struct TypeSchema {
    #[serde(default)]
    extends: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// 注册的属性
#[derive(Clone)]
struct PropertyDef {
    value_type: TypeRef,
    getter: Option<PropertyGetter>,
}

/// 注册的方法
#[derive(Clone)]
struct MethodDef {
    parameters: Vec<TypeRef>,
    return_type: TypeRef,
    body: MethodBody,
}

/// 记录类型或静态类的描述
#[derive(Clone)]
pub struct TypeDescriptor {
    name: String,
    base: Option<String>,
    properties: HashMap<String, PropertyDef>,
    methods: HashMap<String, Vec<MethodDef>>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            properties: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    /// 继承另一个已注册类型的成员
    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// 注册按名称存储在记录上的属性
    pub fn property(mut self, name: impl Into<String>, value_type: TypeRef) -> Self {
        self.properties.insert(
            name.into(),
            PropertyDef {
                value_type,
                getter: None,
            },
        );
        self
    }

    /// 注册带自定义读取逻辑的属性（静态类的属性也走这里）
    pub fn computed_property(
        mut self,
        name: impl Into<String>,
        value_type: TypeRef,
        getter: PropertyGetter,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertyDef {
                value_type,
                getter: Some(getter),
            },
        );
        self
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        parameters: Vec<TypeRef>,
        return_type: TypeRef,
        body: MethodBody,
    ) -> Self {
        self.methods.entry(name.into()).or_default().push(MethodDef {
            parameters,
            return_type,
            body,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 预注册符号表
#[derive(Clone, Default)]
pub struct SymbolRegistry {
    types: HashMap<String, TypeDescriptor>,
    statics: HashMap<String, TypeDescriptor>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带内置静态类（DateTime、Math）的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_static(
            TypeDescriptor::new("DateTime")
                .computed_property("Now", TypeRef::DateTime, Arc::new(|_: Option<&Value>| Ok(Value::DateTime(Utc::now()))))
                .computed_property(
                    "Today",
                    TypeRef::DateTime,
                    Arc::new(|_: Option<&Value>| {
                        let today = Utc::now().date_naive();
                        Ok(today
                            .and_hms_opt(0, 0, 0)
                            .map(|d| Value::DateTime(d.and_utc()))
                            .unwrap_or(Value::Null))
                    }),
                ),
        );
        registry.register_static(
            TypeDescriptor::new("Math")
                .method(
                    "Abs",
                    vec![TypeRef::Float],
                    TypeRef::Float,
                    Arc::new(|_: Option<&Value>, args: &[Value]| match args.first() {
                        Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
                        Some(v) => number(v, "Math.Abs").map(|f| Value::Float(f.abs())),
                        None => Err(RuleError::evaluation("Math.Abs 缺少参数")),
                    }),
                )
                .method(
                    "Max",
                    vec![TypeRef::Float, TypeRef::Float],
                    TypeRef::Float,
                    Arc::new(|_: Option<&Value>, args: &[Value]| min_max(args, true)),
                )
                .method(
                    "Min",
                    vec![TypeRef::Float, TypeRef::Float],
                    TypeRef::Float,
                    Arc::new(|_: Option<&Value>, args: &[Value]| min_max(args, false)),
                ),
        );
        registry
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) -> &mut Self {
        self.types.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn register_static(&mut self, descriptor: TypeDescriptor) -> &mut Self {
        self.statics.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// 从 JSON 类型声明批量注册记录类型，返回注册数
    ///
    /// 格式：`{"Patient": {"extends": "Entity", "properties": {"age": "int"}}}`
    pub fn register_schema_json(&mut self, json: &str) -> Result<usize> {
        let schema: BTreeMap<String, TypeSchema> = serde_json::from_str(json)?;
        let count = schema.len();
        for (name, declared) in schema {
            let mut descriptor = TypeDescriptor::new(name.as_str());
            if let Some(base) = declared.extends {
                descriptor = descriptor.extends(base);
            }
            for (property, type_name) in declared.properties {
                let value_type: TypeRef = type_name.parse()?;
                descriptor = descriptor.property(property, value_type);
            }
            self.register(descriptor);
        }
        Ok(count)
    }

    /// 注册类型声明的属性类型（未注册时返回 None）
    pub fn declared_property_type(&self, ty: &TypeRef, name: &str) -> Option<TypeRef> {
        match ty {
            TypeRef::Record(type_name) => self
                .find_property(type_name, name)
                .map(|(_, def)| def.value_type.clone()),
            _ => None,
        }
    }

    fn find_property(&self, type_name: &str, name: &str) -> Option<(String, &PropertyDef)> {
        let mut current = self.types.get(type_name);
        while let Some(descriptor) = current {
            if let Some((key, def)) = lookup(&descriptor.properties, name) {
                return Some((key.clone(), def));
            }
            current = descriptor.base.as_ref().and_then(|b| self.types.get(b));
        }
        None
    }

    fn find_methods(&self, type_name: &str, name: &str) -> Vec<&MethodDef> {
        let mut found = Vec::new();
        let mut current = self.types.get(type_name);
        while let Some(descriptor) = current {
            if let Some((_, defs)) = lookup(&descriptor.methods, name) {
                found.extend(defs.iter());
            }
            current = descriptor.base.as_ref().and_then(|b| self.types.get(b));
        }
        found
    }

    fn record_property(&self, type_name: &str, name: &str) -> Result<Accessor> {
        let declaring = TypeRef::record(type_name);

        if let Some(value_type) = record_builtin_type(name) {
            return Ok(dynamic_accessor(declaring, name, value_type));
        }

        let (key, def) = self.find_property(type_name, name).ok_or_else(|| {
            RuleError::symbol(format!("{}.{}", type_name, name), "类型未声明该属性")
        })?;

        Ok(match &def.getter {
            Some(getter) => Accessor::new(declaring, key, def.value_type.clone(), false, getter.clone()),
            None => dynamic_accessor(declaring, &key, def.value_type.clone()),
        })
    }

    fn static_descriptor(&self, ty: &TypeRef) -> Option<&TypeDescriptor> {
        lookup(&self.statics, &ty.to_string()).map(|(_, d)| d)
    }

    /// 静态类成员（DateTime.Now、Math.Abs ...）
    fn static_member(&self, ty: &TypeRef, name: &str) -> Option<Accessor> {
        let descriptor = self.static_descriptor(ty)?;
        let (key, def) = lookup(&descriptor.properties, name)?;
        let getter = def.getter.clone()?;
        Some(Accessor::new(
            ty.clone(),
            key.clone(),
            def.value_type.clone(),
            true,
            getter,
        ))
    }

    fn registered_method(
        &self,
        declaring: &TypeRef,
        defs: Vec<&MethodDef>,
        name: &str,
        arg_types: &[TypeRef],
        is_static: bool,
    ) -> Result<Invoker> {
        let def = defs
            .into_iter()
            .find(|d| {
                d.parameters.len() == arg_types.len()
                    && d.parameters.iter().zip(arg_types).all(|(p, a)| p.accepts(a))
            })
            .ok_or_else(|| {
                RuleError::symbol(
                    format!("{}.{}", declaring, name),
                    format!("找不到匹配参数 ({}) 的重载", join_types(arg_types)),
                )
            })?;
        Ok(Invoker::new(
            declaring.clone(),
            name,
            def.return_type.clone(),
            is_static,
            def.body.clone(),
        ))
    }
}

impl SymbolTable for SymbolRegistry {
    fn resolve_type(&self, name: &str) -> Result<TypeRef> {
        let ty: TypeRef = name.parse()?;
        match &ty {
            TypeRef::Record(n) if !self.types.contains_key(n) && !self.statics.contains_key(n) => {
                Err(RuleError::symbol(name, "未注册的类型"))
            }
            _ => Ok(ty),
        }
    }

    fn resolve_property(&self, ty: &TypeRef, name: &str) -> Result<Accessor> {
        if let Some(accessor) = self.static_member(ty, name) {
            return Ok(accessor);
        }

        match ty {
            TypeRef::Any => Ok(dynamic_accessor(TypeRef::Any, name, TypeRef::Any)),
            TypeRef::Record(type_name) if self.statics.contains_key(type_name) => Err(
                RuleError::symbol(format!("{}.{}", type_name, name), "静态类未声明该属性"),
            ),
            TypeRef::Record(type_name) => self.record_property(type_name, name),
            TypeRef::String => match name {
                "Length" | "length" => Ok(builtin_accessor(ty, "Length", TypeRef::Int, |v| {
                    Ok(Value::Int(text(v, "Length")?.chars().count() as i64))
                })),
                _ => Err(unknown_member(ty, name)),
            },
            TypeRef::DateTime => {
                let part: fn(&chrono::DateTime<Utc>) -> i64 = match name {
                    "Year" | "year" => |d| d.year() as i64,
                    "Month" | "month" => |d| d.month() as i64,
                    "Day" | "day" => |d| d.day() as i64,
                    _ => return Err(unknown_member(ty, name)),
                };
                Ok(builtin_accessor(ty, name, TypeRef::Int, move |v| match v {
                    Value::DateTime(d) => Ok(Value::Int(part(d))),
                    other => Err(type_error("datetime", other)),
                }))
            }
            TypeRef::List(_) => match name {
                "Count" | "count" => Ok(builtin_accessor(ty, "Count", TypeRef::Int, |v| {
                    Ok(Value::Int(items(v)?.len() as i64))
                })),
                _ => Err(unknown_member(ty, name)),
            },
            _ => Err(unknown_member(ty, name)),
        }
    }

    fn resolve_method(
        &self,
        ty: &TypeRef,
        name: &str,
        arg_types: &[TypeRef],
        type_args: &[TypeRef],
    ) -> Result<Invoker> {
        let static_defs: Vec<&MethodDef> = self
            .static_descriptor(ty)
            .and_then(|d| lookup(&d.methods, name))
            .map(|(_, defs)| defs.iter().collect())
            .unwrap_or_default();
        if !static_defs.is_empty() {
            return self.registered_method(ty, static_defs, name, arg_types, true);
        }

        match ty {
            TypeRef::Record(type_name) => {
                let defs = self.find_methods(type_name, name);
                self.registered_method(ty, defs, name, arg_types, false)
            }
            TypeRef::String => string_method(name, arg_types),
            TypeRef::DateTime => datetime_method(name, arg_types),
            TypeRef::List(element) => list_method(element, name, arg_types, type_args),
            _ => Err(unknown_member(ty, name)),
        }
    }
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<(&'a String, &'a V)> {
    map.get_key_value(name)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)))
}

fn record_builtin_type(name: &str) -> Option<TypeRef> {
    match name.to_ascii_lowercase().as_str() {
        "id" | "key" => Some(TypeRef::Uuid),
        "creationtime" => Some(TypeRef::DateTime),
        "classname" => Some(TypeRef::String),
        "participation" | "relationship" => Some(TypeRef::list(TypeRef::Any)),
        _ => None,
    }
}

/// 按名称从记录读取属性；空值沿链传播为 null，标量按声明类型转换
fn dynamic_accessor(declaring: TypeRef, name: &str, value_type: TypeRef) -> Accessor {
    let member = name.to_string();
    let declared = value_type.clone();
    Accessor::new(
        declaring,
        name,
        declared,
        false,
        Arc::new(move |target: Option<&Value>| match target {
            Some(Value::Record(record)) => {
                let value = record.property(&member).unwrap_or(Value::Null);
                conform(value, &value_type, &member)
            }
            Some(Value::Null) | None => Ok(Value::Null),
            Some(other) => Err(RuleError::evaluation(format!(
                "无法在 {} 上读取成员 {}",
                other.type_name(),
                member
            ))),
        }),
    )
}

/// JSON 载入的记录只保留原始形态（日期、uuid 为字符串），读取时对齐到声明类型
fn conform(value: Value, value_type: &TypeRef, member: &str) -> Result<Value> {
    if value.is_null() || !value_type.is_scalar() || value.type_ref() == *value_type {
        return Ok(value);
    }
    DefaultValueConverter
        .convert(value, value_type)
        .map_err(|e| RuleError::TypeConversion {
            property: member.to_string(),
            target: value_type.name(),
            message: e.to_string(),
        })
}

fn builtin_accessor<F>(declaring: &TypeRef, name: &str, value_type: TypeRef, f: F) -> Accessor
where
    F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
{
    Accessor::new(
        declaring.clone(),
        name,
        value_type,
        false,
        Arc::new(move |target: Option<&Value>| match target {
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => f(v),
        }),
    )
}

fn instance_method<F>(declaring: TypeRef, name: &str, return_type: TypeRef, f: F) -> Invoker
where
    F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
{
    let member = name.to_string();
    Invoker::new(
        declaring,
        name,
        return_type,
        false,
        Arc::new(move |target: Option<&Value>, args: &[Value]| match target {
            Some(Value::Null) | None => Err(RuleError::evaluation(format!(
                "在空值上调用方法 {}",
                member
            ))),
            Some(v) => f(v, args),
        }),
    )
}

fn string_method(name: &str, arg_types: &[TypeRef]) -> Result<Invoker> {
    let ty = TypeRef::String;
    let invoker = match (name, arg_types) {
        ("Contains", [TypeRef::String]) => instance_method(ty, name, TypeRef::Bool, |v, args| {
            Ok(Value::Bool(text(v, "Contains")?.contains(text(&args[0], "Contains")?)))
        }),
        ("StartsWith", [TypeRef::String]) => instance_method(ty, name, TypeRef::Bool, |v, args| {
            Ok(Value::Bool(text(v, "StartsWith")?.starts_with(text(&args[0], "StartsWith")?)))
        }),
        ("EndsWith", [TypeRef::String]) => instance_method(ty, name, TypeRef::Bool, |v, args| {
            Ok(Value::Bool(text(v, "EndsWith")?.ends_with(text(&args[0], "EndsWith")?)))
        }),
        ("ToLower", []) => instance_method(ty, name, TypeRef::String, |v, _| {
            Ok(Value::String(text(v, "ToLower")?.to_lowercase()))
        }),
        ("ToUpper", []) => instance_method(ty, name, TypeRef::String, |v, _| {
            Ok(Value::String(text(v, "ToUpper")?.to_uppercase()))
        }),
        _ => return Err(no_overload(&TypeRef::String, name, arg_types)),
    };
    Ok(invoker)
}

fn datetime_method(name: &str, arg_types: &[TypeRef]) -> Result<Invoker> {
    let ty = TypeRef::DateTime;
    if arg_types.len() != 1 || !TypeRef::Float.accepts(&arg_types[0]) {
        return Err(no_overload(&ty, name, arg_types));
    }
    let invoker = match name {
        "AddDays" => instance_method(ty, name, TypeRef::DateTime, |v, args| {
            let date = datetime(v)?;
            let days = number(&args[0], "AddDays")?;
            let delta = Duration::milliseconds((days * 86_400_000.0).round() as i64);
            Ok(Value::DateTime(date + delta))
        }),
        "AddMonths" => instance_method(ty, name, TypeRef::DateTime, |v, args| {
            add_months(v, number(&args[0], "AddMonths")? as i64)
        }),
        "AddYears" => instance_method(ty, name, TypeRef::DateTime, |v, args| {
            add_months(v, number(&args[0], "AddYears")? as i64 * 12)
        }),
        _ => return Err(no_overload(&TypeRef::DateTime, name, arg_types)),
    };
    Ok(invoker)
}

fn list_method(
    element: &TypeRef,
    name: &str,
    arg_types: &[TypeRef],
    type_args: &[TypeRef],
) -> Result<Invoker> {
    let ty = TypeRef::list(element.clone());
    let invoker = match (name, arg_types, type_args) {
        ("Count", [], []) => instance_method(ty, name, TypeRef::Int, |v, _| {
            Ok(Value::Int(items(v)?.len() as i64))
        }),
        ("Any", [], []) => instance_method(ty, name, TypeRef::Bool, |v, _| {
            Ok(Value::Bool(!items(v)?.is_empty()))
        }),
        ("Any", [TypeRef::Function(..)], []) => {
            instance_method(ty, name, TypeRef::Bool, |v, args| {
                for item in items(v)? {
                    if predicate(&args[0], item)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            })
        }
        ("Where", [TypeRef::Function(..)], []) => {
            instance_method(ty.clone(), name, ty, |v, args| {
                let mut selected = Vec::new();
                for item in items(v)? {
                    if predicate(&args[0], item)? {
                        selected.push(item.clone());
                    }
                }
                Ok(Value::List(selected))
            })
        }
        ("FirstOrDefault", [], []) => instance_method(ty, name, element.clone(), |v, _| {
            Ok(items(v)?.first().cloned().unwrap_or(Value::Null))
        }),
        ("FirstOrDefault", [TypeRef::Function(..)], []) => {
            instance_method(ty, name, element.clone(), |v, args| {
                for item in items(v)? {
                    if predicate(&args[0], item)? {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Null)
            })
        }
        ("OfType", [], [target]) => {
            let target = target.clone();
            let filter_type = target.clone();
            instance_method(ty, name, TypeRef::list(target), move |v, _| {
                let selected = items(v)?
                    .iter()
                    .filter(|item| match (item, &filter_type) {
                        (Value::Record(r), TypeRef::Record(n)) => r.class_name == *n,
                        (Value::Null, _) => false,
                        (other, t) => t.accepts(&other.type_ref()),
                    })
                    .cloned()
                    .collect();
                Ok(Value::List(selected))
            })
            .with_type_arguments(type_args.to_vec())
        }
        _ => return Err(no_overload(&TypeRef::list(element.clone()), name, arg_types)),
    };
    Ok(invoker)
}

fn predicate(function: &Value, item: &Value) -> Result<bool> {
    match function {
        Value::Function(f) => f.call(std::slice::from_ref(item))?.expect_bool("谓词"),
        other => Err(type_error("function", other)),
    }
}

fn add_months(value: &Value, months: i64) -> Result<Value> {
    let date = datetime(value)?;
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs() as u32))
    };
    shifted
        .map(Value::DateTime)
        .ok_or_else(|| RuleError::evaluation("日期运算溢出"))
}

fn min_max(args: &[Value], max: bool) -> Result<Value> {
    match args {
        [Value::Int(a), Value::Int(b)] => Ok(Value::Int(if max { *a.max(b) } else { *a.min(b) })),
        [a, b] => {
            let (a, b) = (number(a, "Math")?, number(b, "Math")?);
            Ok(Value::Float(if max { a.max(b) } else { a.min(b) }))
        }
        _ => Err(RuleError::evaluation("Math.Max/Min 需要两个参数")),
    }
}

fn text<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| RuleError::evaluation(format!("{} 需要字符串, 实际 {}", what, value.type_name())))
}

fn number(value: &Value, what: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| RuleError::evaluation(format!("{} 需要数值, 实际 {}", what, value.type_name())))
}

fn datetime(value: &Value) -> Result<chrono::DateTime<Utc>> {
    match value {
        Value::DateTime(d) => Ok(*d),
        other => Err(type_error("datetime", other)),
    }
}

fn items(value: &Value) -> Result<&[Value]> {
    value.as_list().ok_or_else(|| type_error("list", value))
}

fn type_error(expected: &str, actual: &Value) -> RuleError {
    RuleError::evaluation(format!("类型不匹配: 期望 {}, 实际 {}", expected, actual.type_name()))
}

fn unknown_member(ty: &TypeRef, name: &str) -> RuleError {
    RuleError::symbol(format!("{}.{}", ty, name), "未知成员")
}

fn no_overload(ty: &TypeRef, name: &str, arg_types: &[TypeRef]) -> RuleError {
    RuleError::symbol(
        format!("{}.{}", ty, name),
        format!("找不到匹配参数 ({}) 的方法", join_types(arg_types)),
    )
}

fn join_types(types: &[TypeRef]) -> String {
    types.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::value::FunctionValue;

    fn registry() -> SymbolRegistry {
        let mut registry = SymbolRegistry::with_builtins();
        registry.register(
            TypeDescriptor::new("Entity").property("statusConcept", TypeRef::String),
        );
        registry.register(
            TypeDescriptor::new("Patient")
                .extends("Entity")
                .property("age", TypeRef::Int)
                .property("addresses", TypeRef::list(TypeRef::record("EntityAddress"))),
        );
        registry
    }

    #[test]
    fn test_declared_datetime_property_is_conformed() {
        let mut registry = SymbolRegistry::with_builtins();
        registry.register(
            TypeDescriptor::new("Patient")
                .property("dateOfBirth", TypeRef::DateTime)
                .property("age", TypeRef::Int),
        );
        let accessor = registry
            .resolve_property(&TypeRef::record("Patient"), "dateOfBirth")
            .unwrap();

        let patient = Record::from_json(r#"{"$type": "Patient", "dateOfBirth": "2021-03-01", "age": 4}"#)
            .unwrap();
        match accessor.get(Some(&Value::from(patient))).unwrap() {
            Value::DateTime(d) => assert_eq!(d.year(), 2021),
            other => panic!("unexpected value: {other:?}"),
        }

        let unknown = Record::new("Patient");
        assert_eq!(accessor.get(Some(&Value::from(unknown))).unwrap(), Value::Null);

        let garbled = Record::new("Patient").with_property("dateOfBirth", "last spring");
        let err = accessor.get(Some(&Value::from(garbled))).unwrap_err();
        assert_eq!(err.code(), "TYPE_CONVERSION_ERROR");
    }

    #[test]
    fn test_register_schema_json() {
        let mut registry = SymbolRegistry::with_builtins();
        let count = registry
            .register_schema_json(
                r#"{
                    "Entity": {"properties": {"statusConcept": "string"}},
                    "Patient": {"extends": "Entity", "properties": {"age": "int", "dateOfBirth": "datetime"}}
                }"#,
            )
            .unwrap();
        assert_eq!(count, 2);
        let accessor = registry
            .resolve_property(&TypeRef::record("Patient"), "statusConcept")
            .unwrap();
        assert_eq!(accessor.value_type, TypeRef::String);
        assert_eq!(
            registry.declared_property_type(&TypeRef::record("Patient"), "dateOfBirth"),
            Some(TypeRef::DateTime)
        );
    }

    #[test]
    fn test_resolve_registered_property() {
        let registry = registry();
        let accessor = registry
            .resolve_property(&TypeRef::record("Patient"), "Age")
            .unwrap();
        assert_eq!(accessor.value_type, TypeRef::Int);

        let patient = Value::from(Record::new("Patient").with_property("age", 42));
        assert_eq!(accessor.get(Some(&patient)).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_inherited_property() {
        let registry = registry();
        let accessor = registry
            .resolve_property(&TypeRef::record("Patient"), "statusConcept")
            .unwrap();
        assert_eq!(accessor.value_type, TypeRef::String);
    }

    #[test]
    fn test_unknown_property_fails() {
        let registry = registry();
        let err = registry
            .resolve_property(&TypeRef::record("Patient"), "shoeSize")
            .unwrap_err();
        assert_eq!(err.code(), "SYMBOL_RESOLUTION_ERROR");
    }

    #[test]
    fn test_static_now() {
        let registry = registry();
        let ty = registry.resolve_type("DateTime").unwrap();
        assert_eq!(ty, TypeRef::DateTime);
        let accessor = registry.resolve_property(&ty, "Now").unwrap();
        assert!(accessor.is_static);
        assert!(matches!(accessor.get(None).unwrap(), Value::DateTime(_)));
    }

    #[test]
    fn test_list_any_with_predicate() {
        let registry = registry();
        let invoker = registry
            .resolve_method(
                &TypeRef::list(TypeRef::Int),
                "Any",
                &[TypeRef::function(vec![TypeRef::Int], TypeRef::Bool)],
                &[],
            )
            .unwrap();
        let gt_two = FunctionValue::new(
            1,
            Arc::new(|args: &[Value]| Ok(Value::Bool(args[0].as_i64().unwrap_or(0) > 2))),
        );
        let list = Value::List(vec![Value::Int(1), Value::Int(3)]);
        let result = invoker
            .invoke(Some(&list), &[Value::Function(gt_two)])
            .unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_of_type_return_type() {
        let registry = registry();
        let invoker = registry
            .resolve_method(
                &TypeRef::list(TypeRef::Any),
                "OfType",
                &[],
                &[TypeRef::record("EntityAddress")],
            )
            .unwrap();
        assert_eq!(invoker.return_type, TypeRef::list(TypeRef::record("EntityAddress")));
    }

    #[test]
    fn test_add_days() {
        let registry = registry();
        let invoker = registry
            .resolve_method(&TypeRef::DateTime, "AddDays", &[TypeRef::Int], &[])
            .unwrap();
        let start = chrono::DateTime::parse_from_rfc3339("2024-01-30T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let result = invoker
            .invoke(Some(&Value::DateTime(start)), &[Value::Int(3)])
            .unwrap();
        assert_eq!(result.to_string(), "2024-02-02T00:00:00+00:00");
    }
}
