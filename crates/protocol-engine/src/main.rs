//! 临床协议引擎命令行
//!
//! - `check`：加载并校验协议/规则集文档
//! - `run`：对主体记录执行已加载的协议，输出评估结果 JSON
//! - `list`：列出配置目录中的文档

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

use cdss_shared::config::AppConfig;
use cdss_shared::observability;
use protocol_engine::{
    EngineServices, EvaluationContext, EvaluationResult, ProtocolExecutor, ProtocolStore, Record,
    SymbolRegistry, TriggerEventFlags, Value,
};

const SERVICE_NAME: &str = "protocol-engine";

#[derive(Parser)]
#[command(name = "protocol-engine", version, about = "临床协议规则引擎")]
struct Cli {
    /// 配置目录
    #[arg(long, env = "CONFIG_DIR", default_value = "config", global = true)]
    config_dir: PathBuf,

    /// 结束时输出 Prometheus 指标快照到 stderr
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 校验文档
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// 对主体记录执行协议
    Run(RunArgs),
    /// 列出已加载的文档
    List(LibraryArgs),
}

#[derive(Args)]
struct LibraryArgs {
    /// 协议目录（覆盖配置中的 engine.protocol_dir）
    #[arg(long)]
    protocol_dir: Option<PathBuf>,

    /// 规则集目录（覆盖配置中的 engine.ruleset_dir）
    #[arg(long)]
    ruleset_dir: Option<PathBuf>,

    /// 额外加载的单个文档
    #[arg(long = "document")]
    documents: Vec<PathBuf>,

    /// 记录类型声明 JSON
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    library: LibraryArgs,

    /// 主体记录文件（单个对象或对象数组）
    #[arg(long = "subject", required = true)]
    subjects: Vec<PathBuf>,

    /// 只执行指定协议
    #[arg(long)]
    protocol: Option<String>,

    /// 同时按该事件执行触发器命中的规则集，如 `Inserted|Updated`
    #[arg(long)]
    event: Option<String>,

    /// 评估时间（RFC 3339），默认当前时间
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// 在结果中记录评估追踪
    #[arg(long)]
    trace: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectReport {
    subject: Record,
    results: Vec<EvaluationResult>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir, SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let guard = observability::init(SERVICE_NAME, &config.observability)?;

    let code = match cli.command {
        Command::Check { files } => check(&files),
        Command::List(args) => list(&config, &args)?,
        Command::Run(args) => run(&config, &args)?,
    };

    if cli.print_metrics {
        if let Some(rendered) = guard.render_metrics() {
            eprintln!("{}", rendered);
        }
    }
    Ok(code)
}

fn check(files: &[PathBuf]) -> ExitCode {
    let mut failed = 0;
    for file in files {
        let store = ProtocolStore::new();
        match store.load_file(file) {
            Ok(id) => println!("ok     {} ({})", file.display(), id),
            Err(e) => {
                failed += 1;
                println!("error  {}: [{}] {}", file.display(), e.code(), e);
            }
        }
    }
    if failed > 0 {
        warn!(failed, total = files.len(), "文档校验失败");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn list(config: &AppConfig, args: &LibraryArgs) -> Result<ExitCode> {
    let (store, _) = open_library(config, args)?;
    for protocol in store.protocols() {
        println!("protocol  {}  {} (v{})", protocol.id, protocol.name, protocol.version);
    }
    for ruleset in store.rulesets() {
        let triggers: Vec<String> = ruleset
            .triggers
            .iter()
            .map(|t| format!("{}:{}", t.subject_type, t.event))
            .collect();
        println!("ruleset   {}  {} [{}]", ruleset.id, ruleset.name, triggers.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

fn run(config: &AppConfig, args: &RunArgs) -> Result<ExitCode> {
    let (store, services) = open_library(config, &args.library)?;

    let mut executor = ProtocolExecutor::from_config(services.clone(), &config.engine);
    if args.trace {
        executor = executor.with_trace();
    }

    let protocols = match &args.protocol {
        Some(id) => vec![store
            .protocol(id)
            .with_context(|| format!("协议不存在: {}", id))?],
        None => store.protocols(),
    };
    let event: Option<TriggerEventFlags> = args
        .event
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("无效的事件名称")?;
    let ctx = args.now.map(EvaluationContext::at).unwrap_or_default();

    let mut reports = Vec::new();
    for path in &args.subjects {
        for mut subject in read_subjects(path)? {
            let mut results = Vec::new();
            for protocol in &protocols {
                results.push(executor.execute_protocol(protocol, &mut subject, &ctx)?);
            }
            if let Some(event) = event {
                let payload = Value::from(subject.clone());
                let class_name = subject.class_name.clone();
                for ruleset in store.candidates(&class_name, event, &payload, &services, &ctx)? {
                    results.push(executor.execute_ruleset(&ruleset, &mut subject, &ctx)?);
                }
            }
            info!(
                subject = %subject.class_name,
                generated = results.iter().map(|r| r.generated.len()).sum::<usize>(),
                "主体评估完成"
            );
            reports.push(SubjectReport { subject, results });
        }
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    let failed = reports
        .iter()
        .flat_map(|r| &r.results)
        .any(|r| !r.failures.is_empty());
    Ok(if failed { ExitCode::from(2) } else { ExitCode::SUCCESS })
}

/// 按配置和命令行参数构建符号表并加载文档库
fn open_library(config: &AppConfig, args: &LibraryArgs) -> Result<(ProtocolStore, EngineServices)> {
    let mut registry = SymbolRegistry::with_builtins();
    if let Some(schema) = &args.schema {
        let json = std::fs::read_to_string(schema)
            .with_context(|| format!("无法读取类型声明: {}", schema.display()))?;
        let count = registry.register_schema_json(&json)?;
        info!(count, "已注册记录类型");
    }
    let services = EngineServices::new(registry);

    let store = ProtocolStore::new();
    let dirs = [
        args.protocol_dir.as_ref().or(config.engine.protocol_dir.as_ref()),
        args.ruleset_dir.as_ref().or(config.engine.ruleset_dir.as_ref()),
    ];
    for dir in dirs.into_iter().flatten() {
        store
            .load_dir(dir)
            .with_context(|| format!("加载目录失败: {}", dir.display()))?;
    }
    for document in &args.documents {
        store
            .load_file(document)
            .with_context(|| format!("加载文档失败: {}", document.display()))?;
    }
    info!(documents = store.len(), "文档库已就绪");
    Ok((store, services))
}

fn read_subjects(path: &Path) -> Result<Vec<Record>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取主体记录: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    let records = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Record>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(records)
}
