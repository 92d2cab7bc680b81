//! 动作模板（then）

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::operation::PropertyOperation;
use crate::condition::CompileCache;
use crate::error::{Result, RuleError};
use crate::record::{Participation, Record};
use crate::services::{EngineServices, EvaluationContext};
use crate::value::Value;

fn default_repeat() -> u32 {
    1
}

/// 动作模板
///
/// 模板记录可以内联给出（`element`），也可以是 JSON 文本（`jsonModel`），
/// 后者在首次使用时解析并缓存。每次重复都从模板生成一条新记录，
/// 按声明顺序执行属性操作，再与主体建立双向 `RecordTarget` 关联。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_model: Option<String>,
    #[serde(rename = "operation", default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<PropertyOperation>,
    #[serde(skip)]
    parsed: CompileCache<Arc<Record>>,
}

impl ActionTemplate {
    pub fn new(element: Record) -> Self {
        Self {
            repeat: 1,
            element: Some(element),
            json_model: None,
            operations: Vec::new(),
            parsed: CompileCache::default(),
        }
    }

    pub fn from_json_model(json: impl Into<String>) -> Self {
        Self {
            repeat: 1,
            element: None,
            json_model: Some(json.into()),
            operations: Vec::new(),
            parsed: CompileCache::default(),
        }
    }

    pub fn repeated(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_operation(mut self, operation: impl Into<PropertyOperation>) -> Self {
        self.operations.push(operation.into());
        self
    }

    /// 模板记录，`jsonModel` 只解析一次
    pub fn template(&self) -> Result<Arc<Record>> {
        self.parsed.get_or_try_init(|| match (&self.element, &self.json_model) {
            (Some(element), _) => Ok(Arc::new(element.clone())),
            (None, Some(json)) => {
                let record = Record::from_json(json)
                    .map_err(|e| RuleError::compilation("jsonModel", e.to_string()))?;
                debug!(class = %record.class_name, "解析 jsonModel 模板");
                Ok(Arc::new(record))
            }
            (None, None) => Err(RuleError::compilation("action", "缺少模板记录")),
        })
    }

    pub fn parse_count(&self) -> usize {
        self.parsed.compilations()
    }

    /// 对主体执行模板，返回按生成顺序排列的记录
    ///
    /// 任一次重复失败时主体保持不变；关联在全部重复成功后才写回主体。
    pub fn evaluate(
        &self,
        subject: &mut Record,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<Vec<Record>> {
        let template = self.template()?;
        let subject_key = subject.key.unwrap_or_else(Uuid::new_v4);
        let mut snapshot = subject.clone();
        snapshot.key = Some(subject_key);
        let subject_value = Value::from(snapshot);
        let repeat = self.repeat.max(1);
        let mut generated = Vec::with_capacity(repeat as usize);
        let mut links = Vec::with_capacity(repeat as usize);

        for index in 0..repeat {
            let ctx = ctx.with_index(i64::from(index));
            let mut record = template.instantiate();

            for (i, operation) in self.operations.iter().enumerate() {
                operation
                    .apply(&mut record, &subject_value, services, &ctx)
                    .map_err(|e| e.within(&format!("operation[{}]", i)))?;
            }

            let key = *record.key.get_or_insert_with(Uuid::new_v4);
            let link = Arc::new(Participation::record_target(Some(subject_key), Some(key)));
            record.add_participation(link.clone());
            links.push(link);
            record.creation_time = Some(ctx.now);

            debug!(index, class = %record.class_name, key = %key, "生成记录");
            generated.push(record);
        }

        subject.key = Some(subject_key);
        for link in links {
            subject.add_participation(link);
        }
        Ok(generated)
    }
}
