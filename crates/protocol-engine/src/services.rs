//! 引擎协作者与评估上下文

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::convert::{DefaultValueConverter, ValueConverter};
use crate::query::{FilterQueryCompiler, QueryCompiler};
use crate::symbols::{SymbolRegistry, SymbolTable};
use crate::text::{TextCompiler, TextExpressionCompiler};
use crate::types::TypeRef;
use crate::value::Value;

/// 规则评估依赖的外部能力
#[derive(Clone)]
pub struct EngineServices {
    pub symbols: Arc<dyn SymbolTable>,
    pub query: Arc<dyn QueryCompiler>,
    pub text: Arc<dyn TextExpressionCompiler>,
    pub converter: Arc<dyn ValueConverter>,
}

impl EngineServices {
    /// 以给定符号表装配参考实现
    pub fn new(symbols: SymbolRegistry) -> Self {
        let symbols: Arc<dyn SymbolTable> = Arc::new(symbols);
        let converter: Arc<dyn ValueConverter> = Arc::new(DefaultValueConverter);
        Self {
            query: Arc::new(FilterQueryCompiler::with_symbols(symbols.clone())),
            text: Arc::new(TextCompiler::new(symbols.clone(), converter.clone())),
            symbols,
            converter,
        }
    }

    pub fn with_query(mut self, query: Arc<dyn QueryCompiler>) -> Self {
        self.query = query;
        self
    }

    pub fn with_text(mut self, text: Arc<dyn TextExpressionCompiler>) -> Self {
        self.text = text;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// 主体的静态类型；类名未注册时按动态类型处理
    pub fn type_of(&self, value: &Value) -> TypeRef {
        match value {
            Value::Record(record) if !record.class_name.is_empty() => self
                .symbols
                .resolve_type(&record.class_name)
                .unwrap_or(TypeRef::Any),
            Value::Record(_) | Value::Null => TypeRef::Any,
            other => other.type_ref(),
        }
    }
}

impl Default for EngineServices {
    fn default() -> Self {
        Self::new(SymbolRegistry::with_builtins())
    }
}

/// 单次评估的上下文，按调用传递
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationContext {
    pub now: DateTime<Utc>,
    /// 动作模板的重复序号
    pub index: i64,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now, index: 0 }
    }

    pub fn with_index(self, index: i64) -> Self {
        Self { index, ..self }
    }
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new()
    }
}
