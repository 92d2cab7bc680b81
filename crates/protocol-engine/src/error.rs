//! 规则引擎错误类型
//!
//! 加载期错误（文档、符号、不支持的构造）不会重试，直接返回给调用方；
//! 评估期错误只中止受影响的最小单元（一个动作模板）。
//! 作用域解析失败不是错误：对应的赋值操作直接跳过。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("文档加载失败 [{document}]: {message}")]
    DocumentLoad { document: String, message: String },

    #[error("符号解析失败: {symbol} - {message}")]
    SymbolResolution { symbol: String, message: String },

    #[error("不支持的表达式构造: {construct} (位置: {location})")]
    UnsupportedConstruct { construct: String, location: String },

    #[error("表达式编译失败 [{location}]: {message}")]
    Compilation { location: String, message: String },

    #[error("类型转换失败: 属性 {property} 无法转换为 {target}: {message}")]
    TypeConversion {
        property: String,
        target: String,
        message: String,
    },

    #[error("表达式执行失败: {0}")]
    Evaluation(String),

    #[error("表达式上下文未初始化: {0}")]
    ContextNotInitialized(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    pub fn symbol(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SymbolResolution {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(construct: impl Into<String>, location: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            construct: construct.into(),
            location: location.into(),
        }
    }

    pub fn compilation(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::DocumentLoad { .. } => "DOCUMENT_LOAD_ERROR",
            Self::SymbolResolution { .. } => "SYMBOL_RESOLUTION_ERROR",
            Self::UnsupportedConstruct { .. } => "UNSUPPORTED_CONSTRUCT",
            Self::Compilation { .. } => "COMPILATION_ERROR",
            Self::TypeConversion { .. } => "TYPE_CONVERSION_ERROR",
            Self::Evaluation(_) => "EVALUATION_ERROR",
            Self::ContextNotInitialized(_) => "CONTEXT_NOT_INITIALIZED",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// 是否属于加载/转换期错误（整份文档或整条表达式被拒绝）
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            Self::DocumentLoad { .. }
                | Self::SymbolResolution { .. }
                | Self::UnsupportedConstruct { .. }
                | Self::Json(_)
        )
    }

    /// 在表达式内部位置前追加外层位置（如 `clause[1]`）
    pub fn within(self, outer: &str) -> Self {
        let join = |inner: String| {
            if inner.is_empty() {
                outer.to_string()
            } else {
                format!("{}.{}", outer, inner)
            }
        };
        match self {
            Self::UnsupportedConstruct { construct, location } => Self::UnsupportedConstruct {
                construct,
                location: join(location),
            },
            Self::Compilation { location, message } => Self::Compilation {
                location: join(location),
                message,
            },
            other => other,
        }
    }

    /// 为错误补充文档定位信息，便于定位出错的规则
    pub fn in_document(self, document: &str, location: &str) -> Self {
        match self {
            Self::UnsupportedConstruct { construct, location: inner } => {
                Self::UnsupportedConstruct {
                    construct,
                    location: join_location(document, location, &inner),
                }
            }
            Self::Compilation { location: inner, message } => Self::Compilation {
                location: join_location(document, location, &inner),
                message,
            },
            Self::DocumentLoad { .. } => self,
            other => Self::DocumentLoad {
                document: document.to_string(),
                message: format!("{}: {}", location, other),
            },
        }
    }
}

fn join_location(document: &str, outer: &str, inner: &str) -> String {
    if inner.is_empty() {
        format!("{}#{}", document, outer)
    } else {
        format!("{}#{}.{}", document, outer, inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = RuleError::unsupported("lambdaInvoke", "root");
        assert_eq!(err.code(), "UNSUPPORTED_CONSTRUCT");
        assert!(err.is_load_time());
    }

    #[test]
    fn test_in_document_keeps_unsupported_kind() {
        let err = RuleError::unsupported("foo", "body").in_document("proto-1", "when.clause[0]");
        match err {
            RuleError::UnsupportedConstruct { location, .. } => {
                assert_eq!(location, "proto-1#when.clause[0].body");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_in_document_wraps_symbol_errors() {
        let err = RuleError::symbol("Patient.foo", "未注册").in_document("proto-1", "rule[0]");
        assert_eq!(err.code(), "DOCUMENT_LOAD_ERROR");
        assert!(err.to_string().contains("rule[0]"));
    }
}
