//! 表达式节点模型
//!
//! - `node` / `tree`：arena 形式的节点树与上下文连接
//! - `element`：文档中的节点形式
//! - `native`：符号已解析的宿主表达式
//! - `compile`：降级为闭包

mod compile;
mod element;
mod native;
mod node;
mod tree;

pub use compile::{compile_lambda, CompiledLambda, Env};
pub(crate) use compile::compare;
pub use element::NodeElement;
pub use native::NativeExpr;
pub use node::{BinaryOperator, ExpressionNode, NodeId, ParameterNode, UnaryOperator};
pub use tree::{from_native, ExpressionTree};
