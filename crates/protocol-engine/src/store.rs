//! 协议库
//!
//! 使用 DashMap 提供线程安全的协议/规则集存储，支持目录加载、
//! 按触发器查找候选规则集，以及向持久化层订阅生命周期事件。

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RuleError};
use crate::executor::{EvaluationResult, ProtocolExecutor};
use crate::protocol::{
    load_document_json, ProtocolDefinition, ProtocolDocument, RuleSetDefinition, TriggerEventFlags,
};
use crate::record::Record;
use crate::services::{EngineServices, EvaluationContext};
use crate::value::Value;

/// 生命周期事件回调
pub type TriggerHandler =
    Arc<dyn Fn(TriggerEventFlags, &mut Record) -> Result<EvaluationResult> + Send + Sync>;

/// 持久化层的事件订阅能力
pub trait PersistenceEvents {
    fn subscribe(
        &self,
        subject_type: &str,
        events: TriggerEventFlags,
        handler: TriggerHandler,
    ) -> Result<()>;
}

/// 协议库
#[derive(Clone, Default)]
pub struct ProtocolStore {
    protocols: Arc<DashMap<String, Arc<ProtocolDefinition>>>,
    rulesets: Arc<DashMap<String, Arc<RuleSetDefinition>>>,
}

impl ProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 协议与规则集总数
    pub fn len(&self) -> usize {
        self.protocols.len() + self.rulesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.rulesets.is_empty()
    }

    pub fn insert_protocol(&self, protocol: ProtocolDefinition) {
        let id = protocol.id.clone();
        if self.protocols.insert(id.clone(), Arc::new(protocol)).is_some() {
            debug!("协议已替换: {}", id);
        }
    }

    pub fn insert_ruleset(&self, ruleset: RuleSetDefinition) {
        let id = ruleset.id.clone();
        if self.rulesets.insert(id.clone(), Arc::new(ruleset)).is_some() {
            debug!("规则集已替换: {}", id);
        }
    }

    fn insert_document(&self, document: ProtocolDocument) -> String {
        let id = document.id().to_string();
        match document {
            ProtocolDocument::Protocol(p) => self.insert_protocol(p),
            ProtocolDocument::RuleSet(r) => self.insert_ruleset(r),
        }
        id
    }

    /// 从 JSON 文本加载一份文档
    #[instrument(skip(self, json))]
    pub fn load_from_json(&self, json: &str) -> Result<String> {
        let document = load_document_json(json)?;
        let id = self.insert_document(document);
        info!("文档已入库: {}", id);
        Ok(id)
    }

    /// 从文件加载一份文档
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let document = read_document(path.as_ref())?;
        let id = self.insert_document(document);
        info!("文档已入库: {}", id);
        Ok(id)
    }

    /// 加载目录下全部 `*.json` 文档；任一文档失败则整个目录都不入库
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let documents = paths
            .iter()
            .map(|p| read_document(p))
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<String> = documents
            .into_iter()
            .map(|d| self.insert_document(d))
            .collect();
        info!("目录加载完成: {} 份文档", ids.len());
        Ok(ids)
    }

    pub fn protocol(&self, id: &str) -> Option<Arc<ProtocolDefinition>> {
        self.protocols.get(id).map(|p| p.value().clone())
    }

    pub fn ruleset(&self, id: &str) -> Option<Arc<RuleSetDefinition>> {
        self.rulesets.get(id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.protocols.contains_key(id) || self.rulesets.contains_key(id)
    }

    /// 全部协议，按 ID 排序
    pub fn protocols(&self) -> Vec<Arc<ProtocolDefinition>> {
        let mut all: Vec<_> = self.protocols.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// 全部规则集，按 ID 排序
    pub fn rulesets(&self) -> Vec<Arc<RuleSetDefinition>> {
        let mut all: Vec<_> = self.rulesets.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .protocols
            .iter()
            .map(|p| p.key().clone())
            .chain(self.rulesets.iter().map(|r| r.key().clone()))
            .collect();
        ids.sort();
        ids
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> Result<()> {
        if self.protocols.remove(id).is_some() || self.rulesets.remove(id).is_some() {
            info!("文档已删除: {}", id);
            Ok(())
        } else {
            warn!("删除不存在的文档: {}", id);
            Err(RuleError::RuleNotFound(id.to_string()))
        }
    }

    pub fn clear(&self) {
        let count = self.len();
        self.protocols.clear();
        self.rulesets.clear();
        info!("已清空 {} 份文档", count);
    }

    /// 触发器命中（类型、事件掩码与守卫条件）的规则集
    pub fn candidates(
        &self,
        subject_type: &str,
        event: TriggerEventFlags,
        payload: &Value,
        services: &EngineServices,
        ctx: &EvaluationContext,
    ) -> Result<Vec<Arc<RuleSetDefinition>>> {
        let mut matched = Vec::new();
        for ruleset in self.rulesets() {
            if ruleset.is_candidate(subject_type, event, payload, services, ctx)? {
                matched.push(ruleset);
            }
        }
        debug!(subject_type, %event, candidates = matched.len(), "查找候选规则集");
        Ok(matched)
    }

    /// 为每个规则集的每个触发器向持久化层订阅，返回订阅数
    #[instrument(skip(self, events, executor))]
    pub fn attach(&self, events: &dyn PersistenceEvents, executor: ProtocolExecutor) -> Result<usize> {
        let mut subscriptions = 0;
        for ruleset in self.rulesets() {
            for trigger in &ruleset.triggers {
                let ruleset = ruleset.clone();
                let trigger = trigger.clone();
                let executor = executor.clone();
                let subject_type = trigger.subject_type.clone();
                let mask = trigger.event;

                let handler: TriggerHandler = Arc::new(move |event: TriggerEventFlags, record: &mut Record| {
                    let ctx = EvaluationContext::new();
                    let payload = Value::from(record.clone());
                    let class_name = record.class_name.clone();
                    if !trigger.matches(&class_name, event, &payload, executor.services(), &ctx)? {
                        return Ok(EvaluationResult::new(ruleset.id.clone()));
                    }
                    executor.execute_ruleset(&ruleset, record, &ctx)
                });

                events.subscribe(&subject_type, mask, handler)?;
                subscriptions += 1;
            }
        }
        info!("已订阅 {} 个触发器", subscriptions);
        Ok(subscriptions)
    }
}

fn read_document(path: &Path) -> Result<ProtocolDocument> {
    let json = std::fs::read_to_string(path)?;
    load_document_json(&json).map_err(|e| match e {
        RuleError::DocumentLoad { document, message } if document == "<unknown>" => {
            RuleError::DocumentLoad {
                document: path.display().to_string(),
                message,
            }
        }
        other => other,
    })
}
