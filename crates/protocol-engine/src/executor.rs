//! 协议执行器
//!
//! 对主体记录依次评估协议条件、规则条件并执行动作模板，收集生成的记录。
//! 单个动作模板失败只中止该模板：失败被记录下来，默认继续执行同一规则中的其余模板。

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use cdss_shared::observability::metrics::{
    record_action_failure, record_protocol_evaluation, record_records_generated,
    record_rule_evaluation,
};

use crate::condition::ConditionSet;
use crate::error::Result;
use crate::protocol::{ProtocolDefinition, RuleDefinition, RuleSetDefinition};
use crate::record::Record;
use crate::services::{EngineServices, EvaluationContext};
use crate::value::Value;

/// 动作模板执行失败
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFailure {
    pub rule_id: String,
    pub action_index: usize,
    pub code: String,
    pub message: String,
}

/// 评估结果
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub document_id: String,
    pub matched: bool,
    /// 条件满足的规则
    pub matched_rules: Vec<String>,
    pub generated: Vec<Record>,
    pub failures: Vec<ActionFailure>,
    pub evaluation_trace: Vec<String>,
    pub evaluation_time_ms: i64,
}

impl EvaluationResult {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Default::default()
        }
    }
}

/// 协议执行器
#[derive(Clone)]
pub struct ProtocolExecutor {
    services: EngineServices,
    /// 是否记录详细评估追踪
    trace_enabled: bool,
    continue_on_action_failure: bool,
}

impl ProtocolExecutor {
    pub fn new(services: EngineServices) -> Self {
        Self {
            services,
            trace_enabled: false,
            continue_on_action_failure: true,
        }
    }

    pub fn from_config(services: EngineServices, config: &cdss_shared::config::EngineConfig) -> Self {
        Self {
            services,
            trace_enabled: config.trace_enabled,
            continue_on_action_failure: config.continue_on_action_failure,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 动作模板失败后是否继续执行同一规则的其余模板
    pub fn continue_on_action_failure(mut self, enabled: bool) -> Self {
        self.continue_on_action_failure = enabled;
        self
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// 执行协议：协议条件成立后逐条执行规则
    #[instrument(skip(self, protocol, subject, ctx), fields(protocol_id = %protocol.id))]
    pub fn execute_protocol(
        &self,
        protocol: &ProtocolDefinition,
        subject: &mut Record,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult> {
        self.execute_document(&protocol.id, &protocol.condition, &protocol.rules, subject, ctx)
    }

    /// 执行规则集（触发器候选判断由调用方完成）
    #[instrument(skip(self, ruleset, subject, ctx), fields(ruleset_id = %ruleset.id))]
    pub fn execute_ruleset(
        &self,
        ruleset: &RuleSetDefinition,
        subject: &mut Record,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult> {
        self.execute_document(&ruleset.id, &ruleset.condition, &ruleset.rules, subject, ctx)
    }

    /// 执行单条规则
    pub fn execute_rule(
        &self,
        rule: &RuleDefinition,
        subject: &mut Record,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult> {
        let start = Instant::now();
        let mut result = EvaluationResult::new(rule.id.clone());
        result.matched = self.run_rule(rule, subject, ctx, &mut result, "rule")?;
        result.evaluation_time_ms = start.elapsed().as_millis() as i64;
        Ok(result)
    }

    fn execute_document(
        &self,
        document_id: &str,
        condition: &ConditionSet,
        rules: &[RuleDefinition],
        subject: &mut Record,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult> {
        let start = Instant::now();
        let mut result = EvaluationResult::new(document_id);

        let subject_value = Value::from(subject.clone());
        if !condition.evaluate(&subject_value, &self.services, ctx)? {
            self.trace(&mut result, format!("{}: 条件不满足", document_id));
            result.evaluation_time_ms = start.elapsed().as_millis() as i64;
            debug!(document = document_id, "协议条件不满足");
            return Ok(result);
        }

        for (i, rule) in rules.iter().enumerate() {
            let path = format!("rule[{}]", i);
            if self.run_rule(rule, subject, ctx, &mut result, &path)? {
                result.matched = true;
            }
        }

        let elapsed = start.elapsed();
        result.evaluation_time_ms = elapsed.as_millis() as i64;
        record_protocol_evaluation(document_id, elapsed.as_secs_f64());

        info!(
            document = document_id,
            matched_rules = result.matched_rules.len(),
            generated = result.generated.len(),
            failures = result.failures.len(),
            "协议评估完成"
        );
        Ok(result)
    }

    /// 评估规则条件，满足时执行全部动作模板
    fn run_rule(
        &self,
        rule: &RuleDefinition,
        subject: &mut Record,
        ctx: &EvaluationContext,
        result: &mut EvaluationResult,
        path: &str,
    ) -> Result<bool> {
        let subject_value = Value::from(subject.clone());
        let matched = rule.condition.evaluate(&subject_value, &self.services, ctx)?;

        record_rule_evaluation(matched);
        self.trace(
            result,
            format!(
                "{}: {} => {}",
                path,
                rule.id,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            ),
        );
        if !matched {
            return Ok(false);
        }
        result.matched_rules.push(rule.id.clone());

        for (i, action) in rule.actions().iter().enumerate() {
            // 在副本上执行，失败时主体不留下半成品关联
            let mut scratch = subject.clone();
            match action.evaluate(&mut scratch, &self.services, ctx) {
                Ok(records) => {
                    *subject = scratch;
                    record_records_generated(records.len());
                    self.trace(
                        result,
                        format!("{}.then.action[{}]: 生成 {} 条记录", path, i, records.len()),
                    );
                    result.generated.extend(records);
                }
                Err(e) => {
                    record_action_failure(e.code());
                    warn!(rule = %rule.id, action = i, code = e.code(), "动作模板执行失败: {}", e);
                    self.trace(result, format!("{}.then.action[{}]: 失败 - {}", path, i, e));
                    result.failures.push(ActionFailure {
                        rule_id: rule.id.clone(),
                        action_index: i,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    if !self.continue_on_action_failure {
                        break;
                    }
                }
            }
        }

        Ok(true)
    }

    fn trace(&self, result: &mut EvaluationResult, line: String) {
        if self.trace_enabled {
            result.evaluation_trace.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionTemplate, AssignOperation};
    use crate::condition::Clause;
    use crate::symbols::{SymbolRegistry, TypeDescriptor};
    use crate::types::TypeRef;

    fn services() -> EngineServices {
        let mut registry = SymbolRegistry::with_builtins();
        registry.register(TypeDescriptor::new("Patient").property("age", TypeRef::Int));
        registry.register(
            TypeDescriptor::new("Act")
                .property("sequenceId", TypeRef::Int)
                .property("dose", TypeRef::Float),
        );
        EngineServices::new(registry)
    }

    fn protocol() -> ProtocolDefinition {
        ProtocolDefinition::new("p1", "protocol")
            .when(ConditionSet::all(vec![Clause::query("age=>=18")]))
            .with_rule(
                RuleDefinition::new("seq", "sequence")
                    .with_action(
                        ActionTemplate::new(Record::new("Act"))
                            .repeated(2)
                            .with_operation(AssignOperation::new("sequenceId", "index + 1")),
                    ),
            )
            .with_rule(
                RuleDefinition::new("senior", "senior only")
                    .when(ConditionSet::all(vec![Clause::text("age >= 65")]))
                    .with_action(ActionTemplate::new(Record::new("Act"))),
            )
            .with_rule(
                RuleDefinition::new("broken", "conversion failure")
                    .with_action(
                        ActionTemplate::new(Record::new("Act"))
                            .with_operation(AssignOperation::new("dose", "\"high\"")),
                    )
                    .with_action(ActionTemplate::new(Record::new("Act"))),
            )
    }

    fn patient(age: i64) -> Record {
        Record::new("Patient").with_property("age", age)
    }

    #[test]
    fn test_protocol_gate() {
        let executor = ProtocolExecutor::new(services());
        let mut subject = patient(10);
        let result = executor
            .execute_protocol(&protocol(), &mut subject, &EvaluationContext::new())
            .unwrap();
        assert!(!result.matched);
        assert!(result.generated.is_empty());
        assert!(subject.participations.is_empty());
    }

    #[test]
    fn test_failed_action_does_not_stop_siblings() {
        let executor = ProtocolExecutor::new(services()).with_trace();
        let mut subject = patient(30);
        let result = executor
            .execute_protocol(&protocol(), &mut subject, &EvaluationContext::new())
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.matched_rules, vec!["seq", "broken"]);
        // 2 条来自 seq，1 条来自 broken 的第二个模板
        assert_eq!(result.generated.len(), 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].rule_id, "broken");
        assert_eq!(result.failures[0].code, "TYPE_CONVERSION_ERROR");
        assert_eq!(subject.participations.len(), 3);
        assert!(!result.evaluation_trace.is_empty());
    }

    #[test]
    fn test_stop_on_action_failure() {
        let executor = ProtocolExecutor::new(services()).continue_on_action_failure(false);
        let mut subject = patient(30);
        let result = executor
            .execute_protocol(&protocol(), &mut subject, &EvaluationContext::new())
            .unwrap();
        assert_eq!(result.generated.len(), 2);
        assert_eq!(result.failures.len(), 1);
    }

    #[test]
    fn test_execute_single_rule() {
        let executor = ProtocolExecutor::new(services());
        let protocol = protocol();
        let mut subject = patient(70);
        let result = executor
            .execute_rule(&protocol.rules[1], &mut subject, &EvaluationContext::new())
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.generated.len(), 1);
        assert!(result.evaluation_trace.is_empty());
    }

    #[test]
    fn test_compile_error_surfaces() {
        let protocol = ProtocolDefinition::new("p1", "protocol")
            .when(ConditionSet::all(vec![Clause::text("age >=")]));
        let executor = ProtocolExecutor::new(services());
        let err = executor
            .execute_protocol(&protocol, &mut patient(30), &EvaluationContext::new())
            .unwrap_err();
        assert_eq!(err.code(), "COMPILATION_ERROR");
    }
}
