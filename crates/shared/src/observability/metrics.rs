//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集。
//! 引擎以命令行方式运行，指标快照由调用方在结束时渲染输出。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 安装 Prometheus recorder 并注册指标描述
pub fn init(service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_engine_metrics(service_name);

    Ok(MetricsHandle { handle })
}

/// 注册引擎指标描述，出现在导出文本的 HELP 注释中
fn register_engine_metrics(service_name: &str) {
    metrics::describe_counter!(
        "protocol_rule_evaluations_total",
        "Total number of rule condition evaluations"
    );
    metrics::describe_histogram!(
        "protocol_rule_evaluation_duration_seconds",
        "Protocol evaluation duration in seconds"
    );
    metrics::describe_counter!(
        "protocol_condition_compilations_total",
        "Total number of condition set compilations"
    );
    metrics::describe_counter!(
        "protocol_records_generated_total",
        "Total number of records generated by action templates"
    );
    metrics::describe_counter!(
        "protocol_action_failures_total",
        "Total number of failed action templates"
    );
    metrics::describe_counter!(
        "protocol_documents_loaded_total",
        "Total number of protocol documents loaded"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录规则条件评估
#[inline]
pub fn record_rule_evaluation(matched: bool) {
    metrics::counter!(
        "protocol_rule_evaluations_total",
        "matched" => if matched { "true" } else { "false" }
    )
    .increment(1);
}

/// 记录一次协议或规则集评估的耗时
#[inline]
pub fn record_protocol_evaluation(document_id: &str, duration_secs: f64) {
    metrics::histogram!(
        "protocol_rule_evaluation_duration_seconds",
        "document" => document_id.to_string()
    )
    .record(duration_secs);
}

/// 记录条件集编译
#[inline]
pub fn record_condition_compilation() {
    metrics::counter!("protocol_condition_compilations_total").increment(1);
}

/// 记录动作模板生成的记录数
#[inline]
pub fn record_records_generated(count: usize) {
    metrics::counter!("protocol_records_generated_total").increment(count as u64);
}

/// 记录动作模板失败
#[inline]
pub fn record_action_failure(code: &str) {
    metrics::counter!("protocol_action_failures_total", "code" => code.to_string()).increment(1);
}

/// 记录文档加载
#[inline]
pub fn record_document_loaded(kind: &str) {
    metrics::counter!("protocol_documents_loaded_total", "kind" => kind.to_string()).increment(1);
}
