//! 文档结构校验
//!
//! 在加载时检查协议和规则集的结构问题，并给出可定位的路径，
//! 如 `rule[1].then.action[0].operation[2]`。
//! 内置方言（过滤查询、文本表达式）只做语法检查，符号解析留到首次编译。

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::action::{ActionTemplate, PropertyOperation};
use crate::condition::{Clause, ConditionSet};
use crate::error::{Result, RuleError};
use crate::protocol::{ProtocolDefinition, RuleDefinition, RuleSetDefinition};
use crate::query::parse_filter;
use crate::record::{Participation, Record, Relationship};
use crate::text::parse_expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {}: {}", level, self.location, self.message)
    }
}

/// 校验结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// 存在错误时拒绝整份文档，警告只记录日志
    pub fn into_result(self, document: &str) -> Result<()> {
        for issue in self.warnings() {
            warn!(document, location = %issue.location, "{}", issue.message);
        }
        let errors: Vec<String> = self
            .errors()
            .map(|i| format!("{}: {}", i.location, i.message))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::DocumentLoad {
                document: document.to_string(),
                message: errors.join("; "),
            })
        }
    }
}

/// 结构校验器
#[derive(Debug, Default)]
pub struct Validator {
    report: ValidationReport,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate_protocol(mut self, protocol: &ProtocolDefinition) -> ValidationReport {
        self.check_header(&protocol.id, &protocol.name);
        self.check_condition(&protocol.condition, "when");
        self.check_rules(&protocol.rules);
        self.report
    }

    pub fn validate_ruleset(mut self, ruleset: &RuleSetDefinition) -> ValidationReport {
        self.check_header(&ruleset.id, &ruleset.name);
        self.check_condition(&ruleset.condition, "when");
        self.check_rules(&ruleset.rules);

        if ruleset.triggers.is_empty() {
            self.warning("trigger", "规则集没有触发器，只能被显式调用");
        }
        for (i, trigger) in ruleset.triggers.iter().enumerate() {
            let path = format!("trigger[{}]", i);
            if trigger.subject_type.trim().is_empty() {
                self.error(&path, "触发器缺少主体类型");
            }
            if trigger.event.is_empty() {
                self.error(&path, "触发器事件掩码为空");
            }
            if let Some(guard) = &trigger.guard {
                self.check_condition(guard, &format!("{}.when", path));
            }
        }
        self.report
    }

    fn check_header(&mut self, id: &str, name: &str) {
        if id.trim().is_empty() {
            self.error("id", "文档 ID 不能为空");
        }
        if name.trim().is_empty() {
            self.warning("name", "文档名称为空");
        }
    }

    fn check_rules(&mut self, rules: &[RuleDefinition]) {
        let mut seen = HashSet::new();
        for (i, rule) in rules.iter().enumerate() {
            let path = format!("rule[{}]", i);
            if rule.id.trim().is_empty() {
                self.error(&path, "规则 ID 不能为空");
            } else if !seen.insert(rule.id.as_str()) {
                self.error(&path, format!("规则 ID '{}' 重复", rule.id));
            }
            self.check_condition(&rule.condition, &format!("{}.when", path));

            if rule.actions().is_empty() {
                self.warning(&path, "规则没有任何动作");
            }
            for (j, action) in rule.actions().iter().enumerate() {
                self.check_action(action, &format!("{}.then.action[{}]", path, j));
            }
        }
    }

    fn check_condition(&mut self, condition: &ConditionSet, path: &str) {
        for (i, clause) in condition.clauses.iter().enumerate() {
            let path = format!("{}.clause[{}]", path, i);
            match clause {
                Clause::ImsiExpression(query) => {
                    if let Err(e) = parse_filter(&query.filter) {
                        self.error(&path, e.to_string());
                    }
                }
                Clause::LinqExpression(text) => {
                    if let Err(e) = parse_expression(text) {
                        self.error(&path, format!("表达式语法错误: {}", e));
                    }
                }
                // 表达式树在上下文连接时已检查
                Clause::LinqXmlExpression(_) => {}
            }
        }
    }

    fn check_action(&mut self, action: &ActionTemplate, path: &str) {
        if action.repeat == 0 {
            self.error(path, "repeat 必须大于 0");
        }
        match (&action.element, &action.json_model) {
            (None, None) => self.error(path, "缺少模板记录（element 或 jsonModel）"),
            (Some(_), Some(_)) => self.warning(path, "同时给出 element 和 jsonModel，以 element 为准"),
            (None, Some(json)) => {
                if let Err(e) = Record::from_json(json) {
                    self.error(&format!("{}.jsonModel", path), e.to_string());
                }
            }
            (Some(_), None) => {}
        }

        for (i, operation) in action.operations.iter().enumerate() {
            let path = format!("{}.operation[{}]", path, i);
            if operation.property_name().trim().is_empty() {
                self.error(&path, "缺少 propertyName");
            }
            match operation {
                PropertyOperation::Assign(assign) => {
                    if assign.value.is_none() {
                        if assign.expression.trim().is_empty() {
                            self.error(&path, "assign 既没有表达式也没有内联值");
                        } else if let Err(e) = parse_expression(&assign.expression) {
                            self.error(&path, format!("表达式语法错误: {}", e));
                        }
                    }
                    match (&assign.scope, &assign.where_filter) {
                        (None, Some(_)) => self.error(&path, "where 需要配合 scope 使用"),
                        (_, Some(filter)) => {
                            if let Err(e) = parse_filter(filter) {
                                self.error(&format!("{}.where", path), e.to_string());
                            }
                        }
                        _ => {}
                    }
                }
                PropertyOperation::Add(add) => {
                    let json = add.value.to_json();
                    let name = add.property_name.as_str();
                    let parsed = if name.eq_ignore_ascii_case("participation") {
                        serde_json::from_value::<Participation>(json).err()
                    } else if name.eq_ignore_ascii_case("relationship") {
                        serde_json::from_value::<Relationship>(json).err()
                    } else {
                        None
                    };
                    if let Some(e) = parsed {
                        self.error(&path, format!("无效的关系条目: {}", e));
                    }
                }
            }
        }
    }

    fn error(&mut self, location: &str, message: impl Into<String>) {
        self.push(Severity::Error, location, message.into());
    }

    fn warning(&mut self, location: &str, message: impl Into<String>) {
        self.push(Severity::Warning, location, message.into());
    }

    fn push(&mut self, severity: Severity, location: &str, message: String) {
        self.report.issues.push(ValidationIssue {
            severity,
            location: location.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{AddOperation, AssignOperation};
    use crate::protocol::{Trigger, TriggerEventFlags};

    fn valid_rule(id: &str) -> RuleDefinition {
        RuleDefinition::new(id, "rule")
            .when(ConditionSet::all(vec![Clause::query("age=>=18")]))
            .with_action(
                ActionTemplate::new(Record::new("Act"))
                    .with_operation(AssignOperation::new("sequenceId", "index + 1")),
            )
    }

    #[test]
    fn test_valid_protocol() {
        let protocol = ProtocolDefinition::new("p1", "protocol").with_rule(valid_rule("r1"));
        let report = Validator::new().validate_protocol(&protocol);
        assert!(report.is_valid(), "{:?}", report.issues);
        assert_eq!(report.warnings().count(), 0);
    }

    #[test]
    fn test_duplicate_rule_ids() {
        let protocol = ProtocolDefinition::new("p1", "protocol")
            .with_rule(valid_rule("r1"))
            .with_rule(valid_rule("r1"));
        let report = Validator::new().validate_protocol(&protocol);
        let errors: Vec<_> = report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].location, "rule[1]");
    }

    #[test]
    fn test_action_problems() {
        let mut action = ActionTemplate::from_json_model("{not json")
            .with_operation(AssignOperation::new("x", "").filtered("use=home"))
            .with_operation(AddOperation::new("participation", 42));
        action.repeat = 0;
        let protocol = ProtocolDefinition::new("p1", "protocol")
            .with_rule(RuleDefinition::new("r1", "rule").with_action(action));
        let report = Validator::new().validate_protocol(&protocol);
        let locations: Vec<_> = report.errors().map(|e| e.location.as_str()).collect();
        assert!(locations.contains(&"rule[0].then.action[0]"));
        assert!(locations.contains(&"rule[0].then.action[0].jsonModel"));
        assert!(locations.contains(&"rule[0].then.action[0].operation[0]"));
        assert!(locations.contains(&"rule[0].then.action[0].operation[1]"));
    }

    #[test]
    fn test_condition_syntax() {
        let rule = RuleDefinition::new("r1", "rule")
            .when(ConditionSet::all(vec![Clause::text("age >"), Clause::query("age")]))
            .with_action(ActionTemplate::new(Record::new("Act")));
        let protocol = ProtocolDefinition::new("p1", "protocol").with_rule(rule);
        let report = Validator::new().validate_protocol(&protocol);
        assert_eq!(report.errors().count(), 2);
        let err = report.into_result("p1").unwrap_err();
        assert_eq!(err.code(), "DOCUMENT_LOAD_ERROR");
        assert!(err.to_string().contains("rule[0].when.clause[0]"));
    }

    #[test]
    fn test_ruleset_triggers() {
        let ruleset = RuleSetDefinition::new("rs", "rules")
            .with_rule(valid_rule("r1"))
            .with_trigger(Trigger::new("", TriggerEventFlags::NONE));
        let report = Validator::new().validate_ruleset(&ruleset);
        assert_eq!(report.errors().count(), 2);

        let ruleset = RuleSetDefinition::new("rs", "rules").with_rule(valid_rule("r1"));
        let report = Validator::new().validate_ruleset(&ruleset);
        assert!(report.is_valid());
        assert_eq!(report.warnings().count(), 1);
    }
}
