//! 字段过滤查询
//!
//! 查询字符串形如 `path=[op]value&path=[op]value`：
//! - 同一路径出现多次时各值之间为 OR，不同路径之间为 AND
//! - 路径按 `.` 逐级解析，遇到列表时展开到每个元素，任一值满足即匹配
//! - `null` 表示字段为空，`!null` 表示非空
//!
//! 例：`addresses.use=home&addresses.city=Hamilton&age=>=18&age=<65`

use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::operators::Operator;
use crate::symbols::SymbolTable;
use crate::types::TypeRef;
use crate::value::Value;

/// 编译后的谓词
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool> + Send + Sync>;

/// 过滤查询编译能力
pub trait QueryCompiler: Send + Sync {
    fn compile(&self, text: &str, subject_type: &TypeRef) -> Result<Predicate>;
}

static PATH_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*$").ok()
});

fn check_path(path: &str) -> Result<()> {
    let pattern = PATH_PATTERN
        .as_ref()
        .ok_or_else(|| RuleError::compilation(path, "属性路径模式构建失败"))?;
    if pattern.is_match(path) {
        Ok(())
    } else {
        Err(RuleError::compilation(path, "无效的属性路径"))
    }
}

/// 单个过滤项
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    pub operator: Operator,
    pub value: String,
}

/// 同一路径的过滤项（值之间为 OR）
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub path: Vec<String>,
    pub terms: Vec<FilterTerm>,
}

impl FilterClause {
    fn matches(&self, subject: &Value) -> Result<bool> {
        let mut values = Vec::new();
        collect_path(subject, &self.path, &mut values);

        for term in &self.terms {
            let matched = if values.is_empty() {
                ConditionEvaluator::evaluate(None, term.operator, &term.value)?
            } else if term.operator == Operator::Neq {
                // 否定条件要求所有值都不相等
                let mut all = true;
                for v in &values {
                    if !ConditionEvaluator::evaluate(Some(v), term.operator, &term.value)? {
                        all = false;
                        break;
                    }
                }
                all
            } else {
                let mut any = false;
                for v in &values {
                    if ConditionEvaluator::evaluate(Some(v), term.operator, &term.value)? {
                        any = true;
                        break;
                    }
                }
                any
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// 解析查询字符串
pub fn parse_filter(text: &str) -> Result<Vec<FilterClause>> {
    let mut clauses: Vec<FilterClause> = Vec::new();
    let text = text.trim().trim_start_matches('?');

    for part in text.split('&').filter(|p| !p.trim().is_empty()) {
        let (path, raw) = part.split_once('=').ok_or_else(|| {
            RuleError::compilation(part, "过滤项缺少 '='")
        })?;
        let path = path.trim();
        check_path(path)?;

        let (operator, value) = Operator::split_prefix(raw.trim());
        let term = FilterTerm {
            operator,
            value: value.to_string(),
        };
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();

        match clauses.iter_mut().find(|c| c.path == segments) {
            Some(clause) => clause.terms.push(term),
            None => clauses.push(FilterClause {
                path: segments,
                terms: vec![term],
            }),
        }
    }

    if clauses.is_empty() {
        return Err(RuleError::compilation(text, "过滤查询为空"));
    }
    Ok(clauses)
}

fn collect_path(value: &Value, path: &[String], out: &mut Vec<Value>) {
    match value {
        Value::List(items) => {
            for item in items {
                collect_path(item, path, out);
            }
        }
        _ if path.is_empty() => {
            if !value.is_null() {
                out.push(value.clone());
            }
        }
        Value::Record(record) => {
            if let Some(next) = record.property(&path[0]) {
                collect_path(&next, &path[1..], out);
            }
        }
        _ => {}
    }
}

/// 参考实现：基于字段路径的过滤查询
#[derive(Clone, Default)]
pub struct FilterQueryCompiler {
    symbols: Option<Arc<dyn SymbolTable>>,
}

impl FilterQueryCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编译时用符号表校验首级路径
    pub fn with_symbols(symbols: Arc<dyn SymbolTable>) -> Self {
        Self {
            symbols: Some(symbols),
        }
    }
}

impl QueryCompiler for FilterQueryCompiler {
    fn compile(&self, text: &str, subject_type: &TypeRef) -> Result<Predicate> {
        let clauses = parse_filter(text)?;

        if let (Some(symbols), TypeRef::Record(_)) = (&self.symbols, subject_type) {
            for clause in &clauses {
                symbols
                    .resolve_property(subject_type, &clause.path[0])
                    .map_err(|e| RuleError::compilation(text, e.to_string()))?;
            }
        }

        debug!(query = text, subject = %subject_type, clauses = clauses.len(), "编译过滤查询");
        Ok(Arc::new(move |subject: &Value| {
            for clause in &clauses {
                if !clause.matches(subject)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }))
    }
}
