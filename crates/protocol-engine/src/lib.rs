//! 临床协议规则引擎
//!
//! 加载 JSON 形式的临床协议与规则集，对主体记录评估条件并实例化动作模板：
//! - 三种条件方言：过滤查询、序列化表达式树、文本表达式
//! - 条件按需编译，每个条件集只编译一次
//! - 动作模板按 repeat 次数实例化，属性操作支持作用域与过滤
//! - 生成的记录与主体之间建立双向 RecordTarget 关联
//! - 规则集可按主体类型与持久化事件订阅触发

pub mod action;
pub mod condition;
pub mod convert;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expression;
pub mod operators;
pub mod protocol;
pub mod query;
pub mod record;
pub mod services;
pub mod store;
pub mod symbols;
pub mod text;
pub mod types;
pub mod validator;
pub mod value;

pub use action::{ActionTemplate, AddOperation, AssignOperation, PropertyOperation};
pub use condition::{Clause, ConditionSet};
pub use error::{Result, RuleError};
pub use executor::{ActionFailure, EvaluationResult, ProtocolExecutor};
pub use operators::{LogicalOperator, Operator};
pub use protocol::{
    load_document_json, load_protocol_json, load_ruleset_json, ProtocolDefinition,
    ProtocolDocument, RuleDefinition, RuleSetDefinition, Trigger, TriggerEventFlags,
};
pub use record::{Participation, Record, Relationship, RECORD_TARGET};
pub use services::{EngineServices, EvaluationContext};
pub use store::{PersistenceEvents, ProtocolStore, TriggerHandler};
pub use symbols::{SymbolRegistry, SymbolTable, TypeDescriptor};
pub use types::TypeRef;
pub use validator::{ValidationReport, Validator};
pub use value::Value;
