//! 协议引擎性能基准测试
//!
//! 覆盖过滤操作符、已编译条件集的重复评估以及动作模板实例化。

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use protocol_engine::evaluator::ConditionEvaluator;
use protocol_engine::{
    ActionTemplate, AssignOperation, Clause, ConditionSet, EngineServices, EvaluationContext,
    Operator, Record, SymbolRegistry, TypeDescriptor, TypeRef, Value,
};
use serde_json::json;
use std::hint::black_box;

fn services() -> EngineServices {
    let mut registry = SymbolRegistry::with_builtins();
    registry.register(
        TypeDescriptor::new("Patient")
            .property("age", TypeRef::Int)
            .property("genderConcept", TypeRef::String),
    );
    registry.register(TypeDescriptor::new("SubstanceAdministration").property("sequenceId", TypeRef::Int));
    EngineServices::new(registry)
}

fn patient() -> Value {
    Value::from_json(json!({"$type": "Patient", "age": 42, "genderConcept": "female"}))
        .expect("valid patient")
}

/// 过滤操作符基准
fn bench_filter_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_operators");
    let number = Value::Int(1000);
    let text = Value::from("hello world");

    for (name, operator, field, expected) in [
        ("eq", Operator::Eq, &number, "1000"),
        ("gte", Operator::Gte, &number, "500"),
        ("contains", Operator::Contains, &text, "world"),
        ("starts_with", Operator::StartsWith, &text, "hello"),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                ConditionEvaluator::evaluate(
                    black_box(Some(field)),
                    black_box(operator),
                    black_box(expected),
                )
            })
        });
    }

    group.finish();
}

/// 已编译条件集的重复评估（首次调用完成编译）
fn bench_condition_sets(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition_sets");
    let services = services();
    let ctx = EvaluationContext::new();
    let subject = patient();

    let sets = [
        ("query", ConditionSet::all(vec![Clause::query("age=>=18&genderConcept=female")])),
        ("text", ConditionSet::all(vec![Clause::text("age >= 18 && genderConcept == \"female\"")])),
        (
            "mixed_or",
            ConditionSet::any(vec![Clause::query("age=<5"), Clause::text("age > 40")]),
        ),
    ];

    for (name, set) in &sets {
        set.evaluate(&subject, &services, &ctx).expect("warm up");
        group.bench_with_input(BenchmarkId::new("evaluate", name), set, |b, set| {
            b.iter(|| set.evaluate(black_box(&subject), &services, &ctx))
        });
    }

    group.finish();
}

/// 动作模板按 repeat 实例化
fn bench_action_templates(c: &mut Criterion) {
    let mut group = c.benchmark_group("action_templates");
    let services = services();
    let ctx = EvaluationContext::new();

    for repeat in [1u32, 3, 10] {
        let action = ActionTemplate::new(Record::new("SubstanceAdministration"))
            .repeated(repeat)
            .with_operation(AssignOperation::new("sequenceId", "index + 1"));
        group.bench_with_input(BenchmarkId::new("repeat", repeat), &action, |b, action| {
            b.iter(|| {
                let mut subject = Record::new("Patient").with_property("age", 42);
                action.evaluate(&mut subject, &services, &ctx)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_filter_operators,
    bench_condition_sets,
    bench_action_templates
);
criterion_main!(benches);
