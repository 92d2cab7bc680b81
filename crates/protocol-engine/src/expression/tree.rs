//! 表达式树 arena
//!
//! 节点按下标存放，父节点关系由 `initialize_context` 一次性建立。
//! 参数节点在转换时沿父链向上查找声明了同名参数的 lambda。

use crate::error::{Result, RuleError};
use crate::expression::native::NativeExpr;
use crate::expression::node::{BinaryOperator, ExpressionNode, NodeId, ParameterNode};
use crate::symbols::SymbolTable;
use crate::types::TypeRef;
use crate::value::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionTree {
    nodes: Vec<ExpressionNode>,
    parents: Vec<Option<NodeId>>,
    root: Option<NodeId>,
    initialized: bool,
}

impl ExpressionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加节点，返回其下标
    pub fn push(&mut self, node: ExpressionNode) -> NodeId {
        self.nodes.push(node);
        self.initialized = false;
        self.nodes.len() - 1
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
        self.initialized = false;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ExpressionNode> {
        self.nodes.get(id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(id).copied().flatten()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// 上下文连接：为每个节点记录父节点下标
    ///
    /// 每个节点只能有一个父节点，且必须从根可达；子节点下标越界或被多处引用都视为结构错误。
    pub fn initialize_context(&mut self) -> Result<()> {
        let root = self
            .root
            .ok_or_else(|| RuleError::compilation("", "表达式树缺少根节点"))?;
        if root >= self.nodes.len() {
            return Err(RuleError::compilation("", "根节点下标越界"));
        }

        let mut parents = vec![None; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        visited[root] = true;

        while let Some(id) = stack.pop() {
            for child in self.nodes[id].children() {
                if child >= self.nodes.len() {
                    return Err(RuleError::compilation(
                        self.location(id, &parents),
                        format!("子节点下标 {} 越界", child),
                    ));
                }
                if visited[child] {
                    return Err(RuleError::compilation(
                        self.location(id, &parents),
                        format!("节点 {} 被多次引用", child),
                    ));
                }
                visited[child] = true;
                parents[child] = Some(id);
                stack.push(child);
            }
        }

        self.parents = parents;
        self.initialized = true;
        Ok(())
    }

    /// 沿父链查找声明了 `name` 参数的 lambda
    pub fn enclosing_lambda(&self, id: NodeId, name: &str) -> Option<(NodeId, &ParameterNode)> {
        let mut current = self.parent(id);
        while let Some(ancestor) = current {
            if let Some(ExpressionNode::Lambda { parameters, .. }) = self.nodes.get(ancestor) {
                if let Some(p) = parameters.iter().find(|p| p.name == name) {
                    return Some((ancestor, p));
                }
            }
            current = self.parent(ancestor);
        }
        None
    }

    /// 推断节点类型
    pub fn node_type(&self, id: NodeId, symbols: &dyn SymbolTable) -> Result<TypeRef> {
        Ok(self.convert(id, symbols)?.ty())
    }

    /// 转换为宿主可执行表达式
    pub fn to_native(&self, symbols: &dyn SymbolTable) -> Result<NativeExpr> {
        if !self.initialized {
            return Err(RuleError::ContextNotInitialized(
                "转换前必须先调用 initialize_context".to_string(),
            ));
        }
        let root = self
            .root
            .ok_or_else(|| RuleError::compilation("", "表达式树缺少根节点"))?;
        self.convert(root, symbols)
    }

    /// 转换为单参数谓词或值函数所需的 lambda
    pub fn to_native_lambda(&self, symbols: &dyn SymbolTable, arity: usize) -> Result<NativeExpr> {
        let native = self.to_native(symbols)?;
        match &native {
            NativeExpr::Lambda { parameters, .. } if parameters.len() == arity => Ok(native),
            NativeExpr::Lambda { parameters, .. } => Err(RuleError::compilation(
                "root",
                format!("lambda 参数个数为 {}, 需要 {}", parameters.len(), arity),
            )),
            _ => Err(RuleError::compilation("root", "根节点必须是 lambdaExpression")),
        }
    }

    fn convert(&self, id: NodeId, symbols: &dyn SymbolTable) -> Result<NativeExpr> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| RuleError::compilation(id.to_string(), "节点不存在"))?;

        let native = match node {
            ExpressionNode::Constant { value, value_type } => {
                NativeExpr::typed_constant(value.clone(), value_type.clone())
            }

            ExpressionNode::Parameter(param) => {
                let (_, declared) = self.enclosing_lambda(id, &param.name).ok_or_else(|| {
                    RuleError::symbol(
                        param.name.clone(),
                        format!("没有 lambda 声明该参数 (位置: {})", self.path(id)),
                    )
                })?;
                NativeExpr::Parameter(declared.clone())
            }

            ExpressionNode::Member {
                object,
                static_type,
                member_name,
            } => match (object, static_type) {
                (Some(object), None) => {
                    let target = self.convert(*object, symbols)?;
                    NativeExpr::member(target, member_name, symbols)?
                }
                (None, Some(static_type)) => {
                    NativeExpr::static_member(static_type, member_name, symbols)?
                }
                _ => return Err(self.dispatch_error(id, member_name)),
            },

            ExpressionNode::Unary {
                op,
                operand,
                explicit_type,
            } => {
                let operand = self.convert(*operand, symbols)?;
                match (op.requires_type(), explicit_type) {
                    (true, Some(ty)) => NativeExpr::convert(*op, operand, ty.clone()),
                    (true, None) => {
                        return Err(RuleError::compilation(
                            self.path(id),
                            format!("{} 需要 type 属性", op),
                        ));
                    }
                    (false, _) => NativeExpr::unary(*op, operand),
                }
            }

            ExpressionNode::Binary { op, left, right } => {
                let left = self.convert(*left, symbols)?;
                let right = self.convert(*right, symbols)?;
                if *op == BinaryOperator::TypeIs {
                    let ty = match &right {
                        NativeExpr::Constant {
                            value: Value::String(name),
                            ..
                        } => symbols.resolve_type(name)?,
                        _ => {
                            return Err(RuleError::compilation(
                                self.path(id),
                                "is 的右操作数必须是类型名常量",
                            ));
                        }
                    };
                    NativeExpr::binary(*op, left, NativeExpr::typed_constant(Value::String(ty.name()), TypeRef::String))
                } else {
                    NativeExpr::binary(*op, left, right)
                }
            }

            ExpressionNode::MethodCall {
                object,
                static_type,
                method_name,
                type_arguments,
                arguments,
            } => {
                let args = arguments
                    .iter()
                    .map(|a| self.convert(*a, symbols))
                    .collect::<Result<Vec<_>>>()?;
                match (object, static_type) {
                    (Some(object), None) => {
                        let target = self.convert(*object, symbols)?;
                        NativeExpr::call(target, method_name, type_arguments, args, symbols)?
                    }
                    (None, Some(static_type)) => NativeExpr::static_call(
                        static_type,
                        method_name,
                        type_arguments,
                        args,
                        symbols,
                    )?,
                    _ => return Err(self.dispatch_error(id, method_name)),
                }
            }

            ExpressionNode::TypeTest { object, query_type } => {
                let operand = self.convert(*object, symbols)?;
                NativeExpr::type_test(operand, query_type.clone())
            }

            ExpressionNode::Lambda { parameters, body } => {
                let body = self.convert(*body, symbols)?;
                NativeExpr::lambda(parameters.clone(), body)
            }
        };

        Ok(native)
    }

    fn dispatch_error(&self, id: NodeId, member: &str) -> RuleError {
        RuleError::compilation(
            self.path(id),
            format!("{} 必须且只能指定 object 或 staticClass 之一", member),
        )
    }

    /// 节点在树中的位置描述，如 `lambdaExpression.binaryExpression[1]`
    pub fn path(&self, id: NodeId) -> String {
        self.location(id, &self.parents)
    }

    fn location(&self, id: NodeId, parents: &[Option<NodeId>]) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let kind = self.nodes.get(node_id).map(|n| n.kind()).unwrap_or("?");
            let parent = parents.get(node_id).copied().flatten();
            let segment = match parent.and_then(|p| self.nodes.get(p)) {
                Some(p) => {
                    let index = p.children().iter().position(|c| *c == node_id).unwrap_or(0);
                    format!("{}[{}]", kind, index)
                }
                None => kind.to_string(),
            };
            segments.push(segment);
            current = parent;
        }
        segments.reverse();
        segments.join(".")
    }
}

/// 由宿主表达式生成文档节点树（已完成上下文连接）
pub fn from_native(expr: &NativeExpr) -> Result<ExpressionTree> {
    let mut tree = ExpressionTree::new();
    let root = push_native(&mut tree, expr);
    tree.set_root(root);
    tree.initialize_context()?;
    Ok(tree)
}

fn push_native(tree: &mut ExpressionTree, expr: &NativeExpr) -> NodeId {
    let node = match expr {
        NativeExpr::Constant { value, ty } => ExpressionNode::Constant {
            value: value.clone(),
            value_type: ty.clone(),
        },
        NativeExpr::Parameter(p) => ExpressionNode::Parameter(p.clone()),
        NativeExpr::Property { target, accessor } => {
            let object = target.as_ref().map(|t| push_native(tree, t));
            ExpressionNode::Member {
                static_type: object.is_none().then(|| accessor.declaring_type.name()),
                object,
                member_name: accessor.name.clone(),
            }
        }
        NativeExpr::Unary { op, operand, ty } => {
            let operand = push_native(tree, operand);
            ExpressionNode::Unary {
                op: *op,
                operand,
                explicit_type: op.requires_type().then(|| ty.clone()),
            }
        }
        NativeExpr::Binary { op, left, right } => {
            let left = push_native(tree, left);
            let right = push_native(tree, right);
            ExpressionNode::Binary {
                op: *op,
                left,
                right,
            }
        }
        NativeExpr::Call {
            target,
            invoker,
            arguments,
        } => {
            let object = target.as_ref().map(|t| push_native(tree, t));
            let arguments = arguments.iter().map(|a| push_native(tree, a)).collect();
            ExpressionNode::MethodCall {
                static_type: object.is_none().then(|| invoker.declaring_type.name()),
                object,
                method_name: invoker.name.clone(),
                type_arguments: invoker.type_arguments.clone(),
                arguments,
            }
        }
        NativeExpr::TypeTest { operand, ty } => {
            let object = push_native(tree, operand);
            ExpressionNode::TypeTest {
                object,
                query_type: ty.clone(),
            }
        }
        NativeExpr::Lambda { parameters, body } => {
            let body = push_native(tree, body);
            ExpressionNode::Lambda {
                parameters: parameters.clone(),
                body,
            }
        }
    };
    tree.push(node)
}
