//! 记录模型
//!
//! 规则引擎只关心临床行为/实体的最小形态：类名、标识、创建时间、
//! 参与关系、实体关系以及按名称存取的属性。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, RuleError};
use crate::value::Value;

/// 生成记录与主体之间的参与角色
pub const RECORD_TARGET: &str = "RecordTarget";

/// 参与关系：把一个实体（player）以某个角色挂到一个行为（act）上
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub participation_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<Uuid>,
}

impl Participation {
    pub fn new(role: impl Into<String>, player: Option<Uuid>, act: Option<Uuid>) -> Self {
        Self {
            participation_role: role.into(),
            player,
            act,
        }
    }

    pub fn record_target(player: Option<Uuid>, act: Option<Uuid>) -> Self {
        Self::new(RECORD_TARGET, player, act)
    }
}

/// 记录之间的关系
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub relationship_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
}

/// 记录（行为、实体或嵌套组件）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(rename = "$type", default)]
    pub class_name: String,
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(rename = "participation", default, skip_serializing_if = "Vec::is_empty")]
    pub participations: Vec<Arc<Participation>>,
    #[serde(rename = "relationship", default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Arc<Relationship>>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: Uuid) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// 从 JSON 文本解析
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 按名称读取存储的属性，名称大小写不敏感
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).or_else(|| {
            self.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// 读取属性，包括内置成员（id / creationTime / participation ...）
    pub fn property(&self, name: &str) -> Option<Value> {
        match builtin_member(name) {
            Some(Builtin::Key) => Some(self.key.map(Value::Uuid).unwrap_or(Value::Null)),
            Some(Builtin::CreationTime) => {
                Some(self.creation_time.map(Value::DateTime).unwrap_or(Value::Null))
            }
            Some(Builtin::ClassName) => Some(Value::String(self.class_name.clone())),
            Some(Builtin::Participation) => Some(links_to_value(&self.participations)),
            Some(Builtin::Relationship) => Some(links_to_value(&self.relationships)),
            None => self.get(name).cloned(),
        }
    }

    /// 写入属性；内置成员会做最基本的类型检查
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        match builtin_member(name) {
            Some(Builtin::Key) => {
                self.key = match value {
                    Value::Null => None,
                    Value::Uuid(u) => Some(u),
                    Value::String(s) => Some(Uuid::parse_str(&s).map_err(|e| {
                        RuleError::evaluation(format!("无效的标识 '{}': {}", s, e))
                    })?),
                    other => {
                        return Err(RuleError::evaluation(format!(
                            "标识需要 uuid, 实际 {}",
                            other.type_name()
                        )));
                    }
                };
            }
            Some(Builtin::CreationTime) => {
                self.creation_time = match value {
                    Value::Null => None,
                    Value::DateTime(d) => Some(d),
                    other => {
                        return Err(RuleError::evaluation(format!(
                            "creationTime 需要 datetime, 实际 {}",
                            other.type_name()
                        )));
                    }
                };
            }
            Some(Builtin::ClassName) => {
                self.class_name = value.to_string();
            }
            Some(Builtin::Participation) | Some(Builtin::Relationship) => {
                return Err(RuleError::evaluation(format!(
                    "{} 是关系集合，只能通过 add 追加",
                    name
                )));
            }
            None => {
                let key = self
                    .properties
                    .keys()
                    .find(|k| k.eq_ignore_ascii_case(name))
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                self.properties.insert(key, value);
            }
        }
        Ok(())
    }

    /// 按点号路径解析属性（如 "addresses" 或 "names.0.given"）
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut current = self.property(first)?;

        for part in parts {
            current = match current {
                Value::Record(record) => record.property(part)?,
                Value::List(items) => {
                    let index: usize = part.parse().ok()?;
                    items.get(index)?.clone()
                }
                _ => return None,
            };
        }

        Some(current)
    }

    /// 以本记录为模板生成新实例
    ///
    /// 新实例拥有新的标识和新的关系容器，但容器中的元素与模板共享。
    /// 列表属性同理：复制的是列表本身，元素记录仍是同一份 `Arc`。
    pub fn instantiate(&self) -> Self {
        Self {
            class_name: self.class_name.clone(),
            key: Some(Uuid::new_v4()),
            creation_time: self.creation_time,
            participations: self.participations.clone(),
            relationships: self.relationships.clone(),
            properties: self.properties.clone(),
        }
    }

    pub fn add_participation(&mut self, participation: Arc<Participation>) {
        self.participations.push(participation);
    }

    /// 查找某个角色的参与关系
    pub fn participations_with_role<'a>(
        &'a self,
        role: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Participation>> + 'a {
        self.participations
            .iter()
            .filter(move |p| p.participation_role == role)
    }
}

/// 把关系集合暴露为匿名记录列表，供表达式读取
fn links_to_value<T: Serialize>(links: &[Arc<T>]) -> Value {
    let items = links
        .iter()
        .filter_map(|link| serde_json::to_value(link.as_ref()).ok())
        .filter_map(|json| Value::from_json(json).ok())
        .collect();
    Value::List(items)
}

enum Builtin {
    Key,
    CreationTime,
    ClassName,
    Participation,
    Relationship,
}

fn builtin_member(name: &str) -> Option<Builtin> {
    match name.to_ascii_lowercase().as_str() {
        "id" | "key" => Some(Builtin::Key),
        "creationtime" => Some(Builtin::CreationTime),
        "$type" | "classname" => Some(Builtin::ClassName),
        "participation" | "participations" => Some(Builtin::Participation),
        "relationship" | "relationships" => Some(Builtin::Relationship),
        _ => None,
    }
}
