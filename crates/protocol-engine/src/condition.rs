//! 条件集合（when）
//!
//! 一个条件集合由若干子句组成，子句可以是三种方言之一：
//! - `imsiExpression`：字段过滤查询，可取反
//! - `linqXmlExpression`：文档形式的表达式树
//! - `linqExpression`：文本表达式
//!
//! 首次评估时逐个编译子句，按 `evaluation` 从左到右组合并缓存。
//! 锁只保护缓存槽位，谓词本身在锁外执行。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, RuleError};
use crate::expression::{compile_lambda, ExpressionTree, NodeElement};
use crate::operators::LogicalOperator;
use crate::services::{EngineServices, EvaluationContext};
use crate::text::TextSymbols;
use crate::types::TypeRef;
use crate::value::Value;

/// 编译后的条件谓词
pub type ConditionPredicate = Arc<dyn Fn(&Value, &EvaluationContext) -> Result<bool> + Send + Sync>;

/// 惰性编译缓存：最多编译一次，克隆得到空缓存
pub(crate) struct CompileCache<T> {
    slot: Mutex<Option<T>>,
    compilations: AtomicUsize,
}

impl<T: Clone> CompileCache<T> {
    pub(crate) fn get_or_try_init(&self, init: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut slot = self.slot.lock();
        if let Some(compiled) = slot.as_ref() {
            return Ok(compiled.clone());
        }
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let compiled = init()?;
        *slot = Some(compiled.clone());
        Ok(compiled)
    }

    pub(crate) fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub(crate) fn is_populated(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T> Default for CompileCache<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            compilations: AtomicUsize::new(0),
        }
    }
}

impl<T> Clone for CompileCache<T> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<T: Clone> std::fmt::Debug for CompileCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.is_populated() { "compiled" } else { "pending" };
        f.write_str(state)
    }
}

/// 过滤查询子句
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryClause {
    #[serde(default)]
    pub negation_indicator: bool,
    pub filter: String,
}

/// 表达式树子句
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "NodeElement", into = "NodeElement")]
pub struct AstClause {
    pub element: NodeElement,
    tree: Option<ExpressionTree>,
}

impl AstClause {
    pub fn new(element: NodeElement) -> Self {
        Self { element, tree: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.tree.is_some()
    }
}

impl From<NodeElement> for AstClause {
    fn from(element: NodeElement) -> Self {
        Self::new(element)
    }
}

impl From<AstClause> for NodeElement {
    fn from(clause: AstClause) -> Self {
        clause.element
    }
}

/// 条件子句
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Clause {
    ImsiExpression(QueryClause),
    LinqXmlExpression(AstClause),
    LinqExpression(String),
}

impl Clause {
    pub fn query(filter: impl Into<String>) -> Self {
        Self::ImsiExpression(QueryClause {
            negation_indicator: false,
            filter: filter.into(),
        })
    }

    pub fn negated_query(filter: impl Into<String>) -> Self {
        Self::ImsiExpression(QueryClause {
            negation_indicator: true,
            filter: filter.into(),
        })
    }

    pub fn ast(element: NodeElement) -> Self {
        Self::LinqXmlExpression(AstClause::new(element))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::LinqExpression(text.into())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ImsiExpression(_) => "imsiExpression",
            Self::LinqXmlExpression(_) => "linqXmlExpression",
            Self::LinqExpression(_) => "linqExpression",
        }
    }

    fn compile(&self, services: &EngineServices, subject_type: &TypeRef) -> Result<ConditionPredicate> {
        match self {
            Self::ImsiExpression(clause) => {
                let predicate = services
                    .query
                    .compile(&clause.filter, subject_type)
                    .map_err(|e| collaborator_error(e, self.kind()))?;
                let negated = clause.negation_indicator;
                Ok(Arc::new(move |subject: &Value, _: &EvaluationContext| {
                    Ok(predicate(subject)? != negated)
                }))
            }
            Self::LinqXmlExpression(clause) => {
                let tree = clause.tree.as_ref().ok_or_else(|| {
                    RuleError::ContextNotInitialized("linqXmlExpression 尚未连接上下文".to_string())
                })?;
                let native = tree.to_native_lambda(services.symbols.as_ref(), 1)?;
                let lambda = compile_lambda(&native, &services.symbols, &services.converter)?;
                Ok(Arc::new(move |subject: &Value, _: &EvaluationContext| {
                    lambda.test(std::slice::from_ref(subject))
                }))
            }
            Self::LinqExpression(text) => {
                let symbols = TextSymbols::for_condition(subject_type.clone());
                let lambda = services
                    .text
                    .compile(text, &symbols)
                    .map_err(|e| collaborator_error(e, self.kind()))?;
                Ok(Arc::new(move |subject: &Value, ctx: &EvaluationContext| {
                    lambda.test(&[subject.clone(), Value::DateTime(ctx.now)])
                }))
            }
        }
    }
}

/// 外部编译器的失败统一包装为编译错误，符号错误保持原样
pub(crate) fn collaborator_error(error: RuleError, location: &str) -> RuleError {
    match error {
        RuleError::Compilation { .. } | RuleError::UnsupportedConstruct { .. } => {
            error.within(location)
        }
        RuleError::SymbolResolution { .. } => error,
        other => RuleError::compilation(location, other.to_string()),
    }
}

/// 条件集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSet {
    #[serde(default)]
    pub evaluation: LogicalOperator,
    #[serde(rename = "clause", default, skip_serializing_if = "Vec::is_empty")]
    pub clauses: Vec<Clause>,
    #[serde(skip)]
    compiled: CompileCache<ConditionPredicate>,
}

impl ConditionSet {
    pub fn new(evaluation: LogicalOperator) -> Self {
        Self {
            evaluation,
            ..Default::default()
        }
    }

    pub fn all(clauses: Vec<Clause>) -> Self {
        Self::new(LogicalOperator::And).with_clauses(clauses)
    }

    pub fn any(clauses: Vec<Clause>) -> Self {
        Self::new(LogicalOperator::Or).with_clauses(clauses)
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn with_clauses(mut self, clauses: Vec<Clause>) -> Self {
        self.clauses.extend(clauses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// 为所有表达式树子句建立上下文
    pub fn initialize_context(&mut self) -> Result<()> {
        for (i, clause) in self.clauses.iter_mut().enumerate() {
            if let Clause::LinqXmlExpression(ast) = clause {
                let tree = ast
                    .element
                    .to_tree()
                    .map_err(|e| e.within(&format!("clause[{}].linqXmlExpression", i)))?;
                ast.tree = Some(tree);
            }
        }
        Ok(())
    }

    /// 子句编译次数（每个实例至多一次）
    pub fn compile_count(&self) -> usize {
        self.compiled.compilations()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_populated()
    }

    /// 评估主体；空集合恒为真
    pub fn evaluate(
        &self,
        subject: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<bool> {
        let predicate = self.compiled.get_or_try_init(|| {
            let subject_type = services.type_of(subject);
            debug!(
                clauses = self.clauses.len(),
                evaluation = %self.evaluation,
                subject = %subject_type,
                "编译条件集合"
            );
            cdss_shared::observability::metrics::record_condition_compilation();
            self.compile(services, &subject_type)
        })?;
        predicate(subject, ctx)
    }

    fn compile(&self, services: &EngineServices, subject_type: &TypeRef) -> Result<ConditionPredicate> {
        let predicates = self
            .clauses
            .iter()
            .enumerate()
            .map(|(i, clause)| {
                clause
                    .compile(services, subject_type)
                    .map_err(|e| e.within(&format!("clause[{}]", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        let evaluation = self.evaluation;

        Ok(Arc::new(move |subject: &Value, ctx: &EvaluationContext| {
            if predicates.is_empty() {
                return Ok(true);
            }
            match evaluation {
                LogicalOperator::And => {
                    for predicate in &predicates {
                        if !predicate(subject, ctx)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                LogicalOperator::Or => {
                    for predicate in &predicates {
                        if predicate(subject, ctx)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            }
        }))
    }
}
