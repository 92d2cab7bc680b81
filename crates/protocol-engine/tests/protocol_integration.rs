//! 协议引擎集成测试
//!
//! 从 JSON 文档出发，覆盖加载、条件评估、动作模板实例化和关联建立的完整流程。

use protocol_engine::expression::{from_native, NativeExpr, NodeElement, ParameterNode};
use protocol_engine::query::{FilterQueryCompiler, Predicate, QueryCompiler};
use protocol_engine::{
    load_protocol_json, Clause, ConditionSet, EngineServices, EvaluationContext,
    ProtocolDefinition, ProtocolExecutor, ProtocolStore, Record, RuleDefinition, RuleError,
    SymbolRegistry, TriggerEventFlags, TypeDescriptor, TypeRef, Value, RECORD_TARGET,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn registry() -> SymbolRegistry {
    let mut registry = SymbolRegistry::with_builtins();
    registry.register(
        TypeDescriptor::new("Patient")
            .property("age", TypeRef::Int)
            .property("genderConcept", TypeRef::String)
            .property("dateOfBirth", TypeRef::DateTime)
            .property("addresses", TypeRef::list(TypeRef::record("EntityAddress"))),
    );
    registry.register(
        TypeDescriptor::new("EntityAddress")
            .property("use", TypeRef::String)
            .property("city", TypeRef::String),
    );
    registry.register(
        TypeDescriptor::new("SubstanceAdministration")
            .property("sequenceId", TypeRef::Int)
            .property("doseQuantity", TypeRef::Float),
    );
    registry.register(
        TypeDescriptor::new("Observation")
            .property("note", TypeRef::String)
            .property("tags", TypeRef::list(TypeRef::String)),
    );
    registry
}

fn services() -> EngineServices {
    EngineServices::new(registry())
}

fn patient(age: i64) -> Record {
    serde_json::from_value(json!({
        "$type": "Patient",
        "age": age,
        "genderConcept": "female",
        "addresses": [
            {"$type": "EntityAddress", "use": "work", "city": "Toronto"},
            {"$type": "EntityAddress", "use": "home", "city": "Hamilton"},
            {"$type": "EntityAddress", "use": "temp", "city": "Ottawa"}
        ]
    }))
    .unwrap()
}

/// 统计编译调用次数的过滤查询编译器
struct CountingQuery {
    inner: FilterQueryCompiler,
    calls: Arc<AtomicUsize>,
}

impl QueryCompiler for CountingQuery {
    fn compile(&self, text: &str, subject_type: &TypeRef) -> protocol_engine::Result<Predicate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(text, subject_type)
    }
}

// ============================================================================
// 条件集
// ============================================================================

#[test]
fn test_combinators_over_mixed_dialects() {
    let services = services();
    let ctx = EvaluationContext::new();

    let all = ConditionSet::all(vec![
        Clause::query("age=>=18"),
        Clause::text("age <= 65"),
        Clause::negated_query("genderConcept=male"),
    ]);
    for age in [5, 18, 30, 65, 70] {
        let subject = Value::from(patient(age));
        let expected = (18..=65).contains(&age);
        assert_eq!(all.evaluate(&subject, &services, &ctx).unwrap(), expected, "age {age}");
    }

    let any = ConditionSet::any(vec![
        Clause::query("age=<5"),
        Clause::text("age > 60"),
        Clause::negated_query("genderConcept=male"),
    ]);
    let mut male = patient(30);
    male.set("genderConcept", Value::from("male")).unwrap();
    assert!(!any.evaluate(&Value::from(male.clone()), &services, &ctx).unwrap());
    assert!(any.evaluate(&Value::from(patient(30)), &services, &ctx).unwrap());
    male.set("age", Value::Int(70)).unwrap();
    assert!(any.evaluate(&Value::from(male), &services, &ctx).unwrap());
}

#[test]
fn test_protocol_conditions_compile_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let services = services().with_query(Arc::new(CountingQuery {
        inner: FilterQueryCompiler::new(),
        calls: calls.clone(),
    }));
    let protocol = load_protocol_json(
        &json!({
            "id": "adult",
            "name": "adult screening",
            "when": {"clause": [{"imsiExpression": {"filter": "age=>=18"}}]},
            "rule": [{
                "id": "screen",
                "name": "screen",
                "when": {"clause": [{"imsiExpression": {"filter": "genderConcept=female"}}]},
                "then": {"action": [{"element": {"$type": "Observation"}}]}
            }]
        })
        .to_string(),
    )
    .unwrap();

    let executor = ProtocolExecutor::new(services);
    let ctx = EvaluationContext::new();
    for age in [30, 40, 50, 10] {
        executor
            .execute_protocol(&protocol, &mut patient(age), &ctx)
            .unwrap();
    }
    // 协议条件一次，规则条件一次
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(protocol.condition.compile_count(), 1);
    assert_eq!(protocol.rules[0].condition.compile_count(), 1);
}

// ============================================================================
// 表达式树文档往返
// ============================================================================

#[test]
fn test_ast_document_round_trip() {
    let registry = registry();
    let patient_type = TypeRef::record("Patient");
    let s = NativeExpr::parameter("subject", patient_type.clone());
    let age = NativeExpr::member(s, "age", &registry).unwrap();
    let body = age
        .clone()
        .ge(NativeExpr::constant(18))
        .and_also(age.le(NativeExpr::constant(65)));
    let lambda = NativeExpr::lambda(vec![ParameterNode::new("subject", patient_type)], body);

    let tree = from_native(&lambda).unwrap();
    let element = NodeElement::from_tree(&tree).unwrap();
    let protocol = ProtocolDefinition::new("working-age", "working age").with_rule(
        RuleDefinition::new("r1", "range")
            .when(ConditionSet::all(vec![Clause::ast(element)]))
            .with_action(protocol_engine::ActionTemplate::new(Record::new("Observation"))),
    );

    let saved = protocol.to_json().unwrap();
    let document: serde_json::Value = serde_json::from_str(&saved).unwrap();
    let clause = &document["ProtocolDefinition"]["rule"][0]["when"]["clause"][0];
    assert_eq!(clause["linqXmlExpression"]["node"], "lambdaExpression");

    let reloaded = load_protocol_json(&saved).unwrap();
    let executor = ProtocolExecutor::new(services());
    let ctx = EvaluationContext::new();
    assert!(executor
        .execute_protocol(&reloaded, &mut patient(30), &ctx)
        .unwrap()
        .matched);
    assert!(!executor
        .execute_protocol(&reloaded, &mut patient(70), &ctx)
        .unwrap()
        .matched);
}

fn patient_born(date_of_birth: &str, id: uuid::Uuid) -> Record {
    serde_json::from_value(json!({
        "$type": "Patient",
        "id": id,
        "age": 4,
        "dateOfBirth": date_of_birth
    }))
    .unwrap()
}

fn ast_condition(body: serde_json::Value) -> ConditionSet {
    let element: NodeElement = serde_json::from_value(json!({
        "node": "lambdaExpression",
        "parameter": [{"node": "parameterExpression", "parameterName": "s", "type": "Patient"}],
        "body": body
    }))
    .unwrap();
    let mut condition = ConditionSet::all(vec![Clause::ast(element)]);
    condition.initialize_context().unwrap();
    condition
}

#[test]
fn test_datetime_property_in_text_and_ast_clauses() {
    let services = services();
    let ctx = EvaluationContext::at("2024-06-01T00:00:00Z".parse().unwrap());
    let subject = Value::from(patient_born("2021-03-01", uuid::Uuid::new_v4()));

    let year = ConditionSet::all(vec![Clause::text("dateOfBirth.Year > 2000")]);
    assert!(year.evaluate(&subject, &services, &ctx).unwrap());

    let born_before_now = ConditionSet::all(vec![Clause::text("dateOfBirth < now")]);
    assert!(born_before_now.evaluate(&subject, &services, &ctx).unwrap());

    let born_before = |date: &str| {
        ast_condition(json!({
            "node": "binaryExpression", "operator": "lt",
            "left": {"node": "memberExpression", "memberName": "dateOfBirth",
                     "object": {"node": "parameterExpression", "parameterName": "s", "type": "Patient"}},
            "right": {"node": "constantExpression", "type": "datetime", "value": date}
        }))
    };
    assert!(born_before("2022-01-01").evaluate(&subject, &services, &ctx).unwrap());
    assert!(!born_before("2020-01-01").evaluate(&subject, &services, &ctx).unwrap());
}

#[test]
fn test_uuid_constant_matches_record_identity() {
    let services = services();
    let ctx = EvaluationContext::new();
    let id = uuid::Uuid::parse_str("5b2a3c1e-0000-4000-8000-000000000001").unwrap();
    let identity_is = |value: uuid::Uuid| {
        ast_condition(json!({
            "node": "binaryExpression", "operator": "eq",
            "left": {"node": "memberExpression", "memberName": "id",
                     "object": {"node": "parameterExpression", "parameterName": "s", "type": "Patient"}},
            "right": {"node": "constantExpression", "type": "uuid", "value": value.to_string()}
        }))
    };

    let subject = Value::from(patient_born("2021-03-01", id));
    assert!(identity_is(id).evaluate(&subject, &services, &ctx).unwrap());
    assert!(!identity_is(uuid::Uuid::new_v4())
        .evaluate(&subject, &services, &ctx)
        .unwrap());

    // 保存后重新加载，常量仍为 uuid
    let protocol = ProtocolDefinition::new("by-identity", "by identity").with_rule(
        RuleDefinition::new("r1", "identity")
            .when(identity_is(id))
            .with_action(protocol_engine::ActionTemplate::new(Record::new("Observation"))),
    );
    let saved = protocol.to_json().unwrap();
    let reloaded = load_protocol_json(&saved).unwrap();
    let executor = ProtocolExecutor::new(services.clone());
    assert!(executor
        .execute_protocol(&reloaded, &mut patient_born("2021-03-01", id), &ctx)
        .unwrap()
        .matched);
    assert!(!executor
        .execute_protocol(&reloaded, &mut patient_born("2021-03-01", uuid::Uuid::new_v4()), &ctx)
        .unwrap()
        .matched);
}

#[test]
fn test_unparseable_subject_date_is_conversion_error() {
    let services = services();
    let ctx = EvaluationContext::new();
    let mut record = patient_born("2021-03-01", uuid::Uuid::new_v4());
    record.set("dateOfBirth", Value::from("sometime")).unwrap();

    let condition = ConditionSet::all(vec![Clause::text("dateOfBirth < now")]);
    let err = condition
        .evaluate(&Value::from(record), &services, &ctx)
        .unwrap_err();
    assert_eq!(err.code(), "TYPE_CONVERSION_ERROR");
}

#[test]
fn test_unsupported_node_fails_load() {
    let json = json!({
        "id": "bad",
        "name": "bad",
        "rule": [{
            "id": "r1",
            "when": {"clause": [{"linqXmlExpression": {
                "node": "lambdaExpression",
                "parameter": [{"node": "parameterExpression", "parameterName": "s", "type": "Patient"}],
                "body": {"node": "conditionalExpression"}
            }}]},
            "then": {"action": [{"element": {"$type": "Observation"}}]}
        }]
    });
    let err = load_protocol_json(&json.to_string()).unwrap_err();
    assert!(err.is_load_time());
    match err {
        RuleError::UnsupportedConstruct { construct, location } => {
            assert_eq!(construct, "conditionalExpression");
            assert!(location.starts_with("bad#rule[0].when.clause[0]"), "{location}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let store = ProtocolStore::new();
    assert!(store.load_from_json(&json.to_string()).is_err());
    assert!(store.is_empty());
}

// ============================================================================
// 动作模板
// ============================================================================

fn series_protocol() -> ProtocolDefinition {
    load_protocol_json(
        &json!({
            "ProtocolDefinition": {
                "id": "series",
                "name": "three dose series",
                "rule": [{
                    "id": "doses",
                    "name": "doses",
                    "then": {"action": [{
                        "repeat": 3,
                        "element": {"$type": "SubstanceAdministration"},
                        "operation": [
                            {"assign": {"propertyName": "sequenceId", "expression": "index + 1"}},
                            {"assign": {"propertyName": "doseQuantity", "value": 0.5}}
                        ]
                    }]}
                }]
            }
        })
        .to_string(),
    )
    .unwrap()
}

#[test]
fn test_repeat_assigns_sequence() {
    let executor = ProtocolExecutor::new(services());
    let result = executor
        .execute_protocol(&series_protocol(), &mut patient(20), &EvaluationContext::new())
        .unwrap();

    assert!(result.matched);
    let sequence: Vec<_> = result
        .generated
        .iter()
        .map(|r| r.get("sequenceId").cloned())
        .collect();
    assert_eq!(
        sequence,
        vec![Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Int(3))]
    );
    assert!(result
        .generated
        .iter()
        .all(|r| r.get("doseQuantity") == Some(&Value::Float(0.5))));
}

#[test]
fn test_generated_records_are_linked() {
    let executor = ProtocolExecutor::new(services());
    let mut subject = patient(20);
    let result = executor
        .execute_protocol(&series_protocol(), &mut subject, &EvaluationContext::new())
        .unwrap();

    let subject_key = subject.key.expect("subject key assigned");
    assert_eq!(subject.participations_with_role(RECORD_TARGET).count(), 3);
    for record in &result.generated {
        let key = record.key.expect("generated key");
        assert!(!key.is_nil());
        let link = record
            .participations_with_role(RECORD_TARGET)
            .next()
            .expect("record target participation");
        assert_eq!(link.player, Some(subject_key));
        assert_eq!(link.act, Some(key));
        assert!(subject
            .participations_with_role(RECORD_TARGET)
            .any(|p| p.act == Some(key)));
    }
}

#[test]
fn test_scoped_where_assignment() {
    let protocol = |filter: &str| {
        load_protocol_json(
            &json!({
                "id": "address",
                "name": "address",
                "rule": [{
                    "id": "r1",
                    "then": {"action": [{
                        "element": {"$type": "Observation", "note": "unchanged"},
                        "operation": [{"assign": {
                            "propertyName": "note",
                            "scope": "addresses",
                            "where": filter,
                            "expression": "city"
                        }}]
                    }]}
                }]
            })
            .to_string(),
        )
        .unwrap()
    };
    let executor = ProtocolExecutor::new(services());
    let ctx = EvaluationContext::new();

    let result = executor
        .execute_protocol(&protocol("use=home"), &mut patient(40), &ctx)
        .unwrap();
    assert_eq!(result.generated[0].get("note"), Some(&Value::from("Hamilton")));

    let result = executor
        .execute_protocol(&protocol("use=billing"), &mut patient(40), &ctx)
        .unwrap();
    assert!(result.failures.is_empty());
    assert_eq!(result.generated[0].get("note"), Some(&Value::from("unchanged")));
}

#[test]
fn test_add_operations_build_links() {
    let protocol = load_protocol_json(
        &json!({
            "id": "links",
            "name": "links",
            "rule": [{
                "id": "r1",
                "then": {"action": [{
                    "element": {"$type": "Observation"},
                    "operation": [
                        {"add": {"propertyName": "tags", "value": "screening"}},
                        {"add": {"propertyName": "participation", "value": {"participationRole": "Authororiginator"}}}
                    ]
                }]}
            }]
        })
        .to_string(),
    )
    .unwrap();
    let result = ProtocolExecutor::new(services())
        .execute_protocol(&protocol, &mut patient(40), &EvaluationContext::new())
        .unwrap();

    let record = &result.generated[0];
    assert_eq!(
        record.get("tags"),
        Some(&Value::List(vec![Value::from("screening")]))
    );
    assert_eq!(record.participations_with_role("Authororiginator").count(), 1);
    assert_eq!(record.participations_with_role(RECORD_TARGET).count(), 1);
}

// ============================================================================
// 文档库与示例文档
// ============================================================================

fn demos_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos")
}

fn demo_services() -> EngineServices {
    let mut registry = SymbolRegistry::with_builtins();
    let schema = std::fs::read_to_string(demos_dir().join("schema.json")).unwrap();
    registry.register_schema_json(&schema).unwrap();
    EngineServices::new(registry)
}

#[test]
fn test_demo_library() {
    let store = ProtocolStore::new();
    store.load_dir(demos_dir().join("protocols")).unwrap();
    store.load_dir(demos_dir().join("rulesets")).unwrap();
    assert_eq!(store.list_ids(), vec!["hpv-immunization", "newborn-screening"]);

    let services = demo_services();
    let executor = ProtocolExecutor::new(services.clone()).with_trace();
    let ctx = EvaluationContext::new();
    let subjects: Vec<Record> = serde_json::from_str(
        &std::fs::read_to_string(demos_dir().join("subjects/patients.json")).unwrap(),
    )
    .unwrap();

    let hpv = store.protocol("hpv-immunization").unwrap();
    let mut adolescent = subjects[0].clone();
    let result = executor.execute_protocol(&hpv, &mut adolescent, &ctx).unwrap();
    assert!(result.failures.is_empty(), "{:?}", result.failures);
    assert_eq!(result.matched_rules, vec!["hpv-series", "hpv-counselling"]);
    assert_eq!(result.generated.len(), 4);
    assert_eq!(result.generated[3].get("note"), Some(&Value::from("Hamilton")));
    let last_dose = result.generated[2].get("actTime").cloned();
    assert!(matches!(last_dose, Some(Value::DateTime(t)) if t > ctx.now));

    let mut newborn = subjects[1].clone();
    let result = executor.execute_protocol(&hpv, &mut newborn, &ctx).unwrap();
    assert!(!result.matched);

    let payload = Value::from(newborn.clone());
    let candidates = store
        .candidates("Patient", TriggerEventFlags::INSERTED, &payload, &services, &ctx)
        .unwrap();
    assert_eq!(candidates.len(), 1);
    let result = executor
        .execute_ruleset(&candidates[0], &mut newborn, &ctx)
        .unwrap();
    assert_eq!(result.generated.len(), 1);
    assert_eq!(newborn.participations_with_role(RECORD_TARGET).count(), 1);
}
