//! 协议、规则与规则集定义
//!
//! 文档形式（JSON）：
//!
//! ```json
//! {
//!   "ProtocolDefinition": {
//!     "id": "hpv-schedule", "name": "HPV", "version": "1.0",
//!     "when": {"evaluation": "And", "clause": [{"imsiExpression": {"filter": "genderConcept=female"}}]},
//!     "rule": [{
//!       "id": "dose-1", "name": "第一剂",
//!       "when": {"clause": [{"linqExpression": "age >= 9"}]},
//!       "then": {"action": [{"repeat": 1, "element": {"$type": "SubstanceAdministration"}}]}
//!     }]
//!   }
//! }
//! ```
//!
//! 规则集（`RuleSetDefinition`）额外带有 `trigger` 列表。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::action::ActionTemplate;
use crate::condition::ConditionSet;
use crate::error::{Result, RuleError};
use crate::services::{EngineServices, EvaluationContext};
use crate::validator::Validator;
use crate::value::Value;

/// 持久化生命周期事件位标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TriggerEventFlags(u16);

impl TriggerEventFlags {
    pub const NONE: Self = Self(0);
    pub const INSERTING: Self = Self(1);
    pub const INSERTED: Self = Self(1 << 1);
    pub const UPDATING: Self = Self(1 << 2);
    pub const UPDATED: Self = Self(1 << 3);
    pub const OBSOLETING: Self = Self(1 << 4);
    pub const OBSOLETED: Self = Self(1 << 5);
    pub const QUERYING: Self = Self(1 << 6);
    pub const QUERIED: Self = Self(1 << 7);
    pub const AFTER_PERSISTENCE: Self = Self(Self::INSERTED.0 | Self::UPDATED.0 | Self::OBSOLETED.0);
    pub const BEFORE_PERSISTENCE: Self =
        Self(Self::INSERTING.0 | Self::UPDATING.0 | Self::OBSOLETING.0);
    pub const ALWAYS: Self = Self(0xFF);

    const BASIC: [(&'static str, Self); 8] = [
        ("Inserting", Self::INSERTING),
        ("Inserted", Self::INSERTED),
        ("Updating", Self::UPDATING),
        ("Updated", Self::UPDATED),
        ("Obsoleting", Self::OBSOLETING),
        ("Obsoleted", Self::OBSOLETED),
        ("Querying", Self::QUERYING),
        ("Queried", Self::QUERIED),
    ];

    const ALIASES: [(&'static str, Self); 4] = [
        ("AfterPersistence", Self::AFTER_PERSISTENCE),
        ("BeforePersistence", Self::BEFORE_PERSISTENCE),
        ("Always", Self::ALWAYS),
        ("None", Self::NONE),
    ];

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// 组成该掩码的基本事件名
    pub fn names(&self) -> Vec<&'static str> {
        Self::BASIC
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for TriggerEventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TriggerEventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TriggerEventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        f.write_str(&self.names().join("|"))
    }
}

impl FromStr for TriggerEventFlags {
    type Err = RuleError;

    /// 支持 `Inserted|Updated`、`Inserted, Updated` 以及组合别名
    fn from_str(s: &str) -> Result<Self> {
        let mut flags = Self::NONE;
        for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            let flag = Self::BASIC
                .iter()
                .chain(Self::ALIASES.iter())
                .find(|(name, _)| name.eq_ignore_ascii_case(part))
                .map(|(_, flag)| *flag)
                .ok_or_else(|| RuleError::unsupported(part, "trigger.event"))?;
            flags |= flag;
        }
        Ok(flags)
    }
}

impl Serialize for TriggerEventFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TriggerEventFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Form {
            One(String),
            Many(Vec<String>),
        }

        let text = match Form::deserialize(deserializer)? {
            Form::One(s) => s,
            Form::Many(items) => items.join("|"),
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// 规则集触发器
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type")]
    pub subject_type: String,
    pub event: TriggerEventFlags,
    /// 针对事件负载的守卫条件
    #[serde(rename = "when", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ConditionSet>,
}

impl Trigger {
    pub fn new(subject_type: impl Into<String>, event: TriggerEventFlags) -> Self {
        Self {
            subject_type: subject_type.into(),
            event,
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: ConditionSet) -> Self {
        self.guard = Some(guard);
        self
    }

    /// 类型与事件是否命中，守卫条件在负载上求值
    pub fn matches(
        &self,
        subject_type: &str,
        event: TriggerEventFlags,
        payload: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<bool> {
        if !self.subject_type.eq_ignore_ascii_case(subject_type) || !self.event.intersects(event) {
            return Ok(false);
        }
        match &self.guard {
            Some(guard) => guard.evaluate(payload, services, ctx),
            None => Ok(true),
        }
    }
}

/// then 子句
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThenClause {
    #[serde(rename = "action", default)]
    pub actions: Vec<ActionTemplate>,
}

/// 规则
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "when", default)]
    pub condition: ConditionSet,
    #[serde(default)]
    pub then: ThenClause,
}

impl RuleDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn when(mut self, condition: ConditionSet) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_action(mut self, action: ActionTemplate) -> Self {
        self.then.actions.push(action);
        self
    }

    pub fn actions(&self) -> &[ActionTemplate] {
        &self.then.actions
    }

    fn initialize_context(&mut self) -> Result<()> {
        self.condition.initialize_context().map_err(|e| e.within("when"))
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// 协议
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "when", default)]
    pub condition: ConditionSet,
    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleDefinition>,
}

impl ProtocolDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            ..Default::default()
        }
    }

    pub fn when(mut self, condition: ConditionSet) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_rule(mut self, rule: RuleDefinition) -> Self {
        self.rules.push(rule);
        self
    }

    /// 为所有条件集合建立上下文，错误带文档定位
    pub fn initialize_context(&mut self) -> Result<()> {
        initialize_all(&self.id, &mut self.condition, &mut self.rules)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&ProtocolDocumentRef::Protocol(self))?)
    }
}

/// 规则集
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "when", default)]
    pub condition: ConditionSet,
    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(rename = "trigger", default)]
    pub triggers: Vec<Trigger>,
}

impl RuleSetDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            ..Default::default()
        }
    }

    pub fn with_rule(mut self, rule: RuleDefinition) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn initialize_context(&mut self) -> Result<()> {
        initialize_all(&self.id, &mut self.condition, &mut self.rules)?;
        for (i, trigger) in self.triggers.iter_mut().enumerate() {
            if let Some(guard) = trigger.guard.as_mut() {
                guard
                    .initialize_context()
                    .map_err(|e| e.in_document(&self.id, &format!("trigger[{}].when", i)))?;
            }
        }
        Ok(())
    }

    /// 任一触发器命中即为候选
    pub fn is_candidate(
        &self,
        subject_type: &str,
        event: TriggerEventFlags,
        payload: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<bool> {
        for trigger in &self.triggers {
            if trigger.matches(subject_type, event, payload, services, ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&ProtocolDocumentRef::RuleSet(self))?)
    }
}

fn initialize_all(id: &str, condition: &mut ConditionSet, rules: &mut [RuleDefinition]) -> Result<()> {
    condition
        .initialize_context()
        .map_err(|e| e.in_document(id, "when"))?;
    for (i, rule) in rules.iter_mut().enumerate() {
        rule.initialize_context()
            .map_err(|e| e.in_document(id, &format!("rule[{}]", i)))?;
    }
    Ok(())
}

/// 顶层文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolDocument {
    #[serde(rename = "ProtocolDefinition")]
    Protocol(ProtocolDefinition),
    #[serde(rename = "RuleSetDefinition")]
    RuleSet(RuleSetDefinition),
}

#[derive(Serialize)]
enum ProtocolDocumentRef<'a> {
    #[serde(rename = "ProtocolDefinition")]
    Protocol(&'a ProtocolDefinition),
    #[serde(rename = "RuleSetDefinition")]
    RuleSet(&'a RuleSetDefinition),
}

impl ProtocolDocument {
    pub fn id(&self) -> &str {
        match self {
            Self::Protocol(p) => &p.id,
            Self::RuleSet(r) => &r.id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 加载顶层文档：解析、结构校验、上下文连接，任一步失败则整份文档被拒绝
pub fn load_document_json(json: &str) -> Result<ProtocolDocument> {
    let raw: serde_json::Value = serde_json::from_str(json).map_err(|e| RuleError::DocumentLoad {
        document: "<unknown>".to_string(),
        message: e.to_string(),
    })?;
    let document_id = raw
        .as_object()
        .and_then(|o| o.values().next())
        .and_then(|d| d.get("id"))
        .and_then(|id| id.as_str())
        .unwrap_or("<unknown>")
        .to_string();

    let mut document: ProtocolDocument =
        serde_json::from_value(raw).map_err(|e| RuleError::DocumentLoad {
            document: document_id.clone(),
            message: e.to_string(),
        })?;

    match &mut document {
        ProtocolDocument::Protocol(p) => {
            p.initialize_context()?;
            Validator::new().validate_protocol(p).into_result(&p.id)?;
        }
        ProtocolDocument::RuleSet(r) => {
            r.initialize_context()?;
            Validator::new().validate_ruleset(r).into_result(&r.id)?;
        }
    }

    let kind = match &document {
        ProtocolDocument::Protocol(_) => "protocol",
        ProtocolDocument::RuleSet(_) => "ruleset",
    };
    cdss_shared::observability::metrics::record_document_loaded(kind);
    info!(document = %document.id(), kind, "文档已加载");
    Ok(document)
}

/// 加载协议文档（顶层可带或不带 `ProtocolDefinition` 包装）
pub fn load_protocol_json(json: &str) -> Result<ProtocolDefinition> {
    match load_document_json(&wrap(json, "ProtocolDefinition"))? {
        ProtocolDocument::Protocol(p) => Ok(p),
        ProtocolDocument::RuleSet(r) => Err(RuleError::DocumentLoad {
            document: r.id,
            message: "期望 ProtocolDefinition, 实际 RuleSetDefinition".to_string(),
        }),
    }
}

/// 加载规则集文档（顶层可带或不带 `RuleSetDefinition` 包装）
pub fn load_ruleset_json(json: &str) -> Result<RuleSetDefinition> {
    match load_document_json(&wrap(json, "RuleSetDefinition"))? {
        ProtocolDocument::RuleSet(r) => Ok(r),
        ProtocolDocument::Protocol(p) => Err(RuleError::DocumentLoad {
            document: p.id,
            message: "期望 RuleSetDefinition, 实际 ProtocolDefinition".to_string(),
        }),
    }
}

/// 未带顶层标签的文档补上默认标签
fn wrap(json: &str, tag: &str) -> String {
    let wrapped = serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|v| {
            v.as_object().map(|o| {
                o.len() == 1
                    && (o.contains_key("ProtocolDefinition") || o.contains_key("RuleSetDefinition"))
            })
        })
        .unwrap_or(true);
    if wrapped {
        json.to_string()
    } else {
        format!("{{\"{}\": {}}}", tag, json)
    }
}
