//! 表达式的文档形式
//!
//! 文档中的节点名、操作符都是原样保存的字符串，未知取值在加载时的
//! 转换阶段报 `UnsupportedConstruct`，而不是在反序列化阶段失败。
//!
//! ```json
//! {
//!   "node": "lambdaExpression",
//!   "parameter": [{"node": "parameterExpression", "parameterName": "s", "type": "Patient"}],
//!   "body": {
//!     "node": "binaryExpression", "operator": "gte",
//!     "left": {"node": "memberExpression", "memberName": "age",
//!              "object": {"node": "parameterExpression", "parameterName": "s", "type": "Patient"}},
//!     "right": {"node": "constantExpression", "type": "int", "value": 18}
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::convert::{DefaultValueConverter, ValueConverter};
use crate::error::{Result, RuleError};
use crate::expression::node::{
    BinaryOperator, ExpressionNode, NodeId, ParameterNode, UnaryOperator,
};
use crate::expression::tree::ExpressionTree;
use crate::types::TypeRef;
use crate::value::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeElement {
    #[serde(rename = "node")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_class: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub method_type_argument: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Box<NodeElement>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<Box<NodeElement>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Box<NodeElement>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Box<NodeElement>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub argument: Vec<NodeElement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter: Vec<NodeElement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<NodeElement>>,
}

impl NodeElement {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    /// 转换为节点树并完成上下文连接
    pub fn to_tree(&self) -> Result<ExpressionTree> {
        let mut tree = ExpressionTree::new();
        let root = self.push_into(&mut tree, &self.kind)?;
        tree.set_root(root);
        tree.initialize_context()?;
        Ok(tree)
    }

    fn push_into(&self, tree: &mut ExpressionTree, location: &str) -> Result<NodeId> {
        let node = match self.kind.as_str() {
            "constantExpression" => {
                let value = self.value.clone().unwrap_or(Value::Null);
                let (value, value_type) = match &self.type_name {
                    Some(name) => {
                        let value_type = parse_type(name, location)?;
                        (typed_constant(value, &value_type, location)?, value_type)
                    }
                    None => {
                        let value_type = value.type_ref();
                        (value, value_type)
                    }
                };
                ExpressionNode::Constant { value, value_type }
            }

            "parameterExpression" => ExpressionNode::Parameter(self.parameter_node(location)?),

            "memberExpression" => {
                let object = self.child(&self.object, tree, location, "object")?;
                ExpressionNode::Member {
                    object,
                    static_type: self.static_class.clone(),
                    member_name: required(&self.member_name, "memberName", location)?,
                }
            }

            "unaryExpression" => {
                let op = required(&self.operator, "operator", location)?;
                let op = UnaryOperator::from_code(&op).ok_or_else(|| {
                    RuleError::unsupported(format!("unaryExpression[operator={}]", op), location)
                })?;
                let operand = self
                    .child(&self.operand, tree, location, "operand")?
                    .ok_or_else(|| missing("operand", location))?;
                let explicit_type = self
                    .type_name
                    .as_deref()
                    .map(|t| parse_type(t, location))
                    .transpose()?;
                ExpressionNode::Unary {
                    op,
                    operand,
                    explicit_type,
                }
            }

            "binaryExpression" => {
                let op = required(&self.operator, "operator", location)?;
                let op = BinaryOperator::from_code(&op).ok_or_else(|| {
                    RuleError::unsupported(format!("binaryExpression[operator={}]", op), location)
                })?;
                let left = self
                    .child(&self.left, tree, location, "left")?
                    .ok_or_else(|| missing("left", location))?;
                let right = self
                    .child(&self.right, tree, location, "right")?
                    .ok_or_else(|| missing("right", location))?;
                ExpressionNode::Binary { op, left, right }
            }

            "methodCallExpression" => {
                let object = self.child(&self.object, tree, location, "object")?;
                let mut arguments = Vec::with_capacity(self.argument.len());
                for (i, arg) in self.argument.iter().enumerate() {
                    let loc = format!("{}.argument[{}]", location, i);
                    arguments.push(arg.push_into(tree, &loc)?);
                }
                let type_arguments = self
                    .method_type_argument
                    .iter()
                    .map(|t| parse_type(t, location))
                    .collect::<Result<Vec<_>>>()?;
                ExpressionNode::MethodCall {
                    object,
                    static_type: self.static_class.clone(),
                    method_name: required(&self.method_name, "methodName", location)?,
                    type_arguments,
                    arguments,
                }
            }

            "typeBinaryExpression" => {
                let object = self
                    .child(&self.object, tree, location, "object")?
                    .ok_or_else(|| missing("object", location))?;
                let query_type = required(&self.operand_type, "operandType", location)?;
                ExpressionNode::TypeTest {
                    object,
                    query_type: parse_type(&query_type, location)?,
                }
            }

            "lambdaExpression" => {
                let parameters = self
                    .parameter
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let loc = format!("{}.parameter[{}]", location, i);
                        if p.kind != "parameterExpression" {
                            return Err(RuleError::unsupported(
                                format!("lambda 参数节点 {}", p.kind),
                                loc,
                            ));
                        }
                        p.parameter_node(&loc)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let body = self
                    .child(&self.body, tree, location, "body")?
                    .ok_or_else(|| missing("body", location))?;
                ExpressionNode::Lambda { parameters, body }
            }

            other => return Err(RuleError::unsupported(other, location)),
        };

        Ok(tree.push(node))
    }

    fn child(
        &self,
        slot: &Option<Box<NodeElement>>,
        tree: &mut ExpressionTree,
        location: &str,
        name: &str,
    ) -> Result<Option<NodeId>> {
        slot.as_ref()
            .map(|child| child.push_into(tree, &format!("{}.{}", location, name)))
            .transpose()
    }

    fn parameter_node(&self, location: &str) -> Result<ParameterNode> {
        let name = required(&self.parameter_name, "parameterName", location)?;
        let ty = match &self.type_name {
            Some(t) => parse_type(t, location)?,
            None => TypeRef::Any,
        };
        Ok(ParameterNode::new(name, ty))
    }

    /// 由节点树生成文档形式
    pub fn from_tree(tree: &ExpressionTree) -> Result<Self> {
        let root = tree
            .root()
            .ok_or_else(|| RuleError::compilation("", "表达式树缺少根节点"))?;
        Self::from_node(tree, root)
    }

    fn from_node(tree: &ExpressionTree, id: NodeId) -> Result<Self> {
        let node = tree
            .node(id)
            .ok_or_else(|| RuleError::compilation(id.to_string(), "节点不存在"))?;
        let boxed = |child: NodeId| Self::from_node(tree, child).map(Box::new);

        let mut element = Self::new(node.kind());
        match node {
            ExpressionNode::Constant { value, value_type } => {
                element.value = (!value.is_null()).then(|| value.clone());
                element.type_name = Some(value_type.name());
            }
            ExpressionNode::Parameter(p) => {
                element.parameter_name = Some(p.name.clone());
                element.type_name = Some(p.ty.name());
            }
            ExpressionNode::Member {
                object,
                static_type,
                member_name,
            } => {
                element.object = object.map(boxed).transpose()?;
                element.static_class = static_type.clone();
                element.member_name = Some(member_name.clone());
            }
            ExpressionNode::Unary {
                op,
                operand,
                explicit_type,
            } => {
                element.operator = Some(op.code().to_string());
                element.operand = Some(boxed(*operand)?);
                element.type_name = explicit_type.as_ref().map(TypeRef::name);
            }
            ExpressionNode::Binary { op, left, right } => {
                element.operator = Some(op.code().to_string());
                element.left = Some(boxed(*left)?);
                element.right = Some(boxed(*right)?);
            }
            ExpressionNode::MethodCall {
                object,
                static_type,
                method_name,
                type_arguments,
                arguments,
            } => {
                element.object = object.map(boxed).transpose()?;
                element.static_class = static_type.clone();
                element.method_name = Some(method_name.clone());
                element.method_type_argument = type_arguments.iter().map(TypeRef::name).collect();
                element.argument = arguments
                    .iter()
                    .map(|a| Self::from_node(tree, *a))
                    .collect::<Result<Vec<_>>>()?;
            }
            ExpressionNode::TypeTest { object, query_type } => {
                element.object = Some(boxed(*object)?);
                element.operand_type = Some(query_type.name());
            }
            ExpressionNode::Lambda { parameters, body } => {
                element.parameter = parameters
                    .iter()
                    .map(|p| {
                        let mut param = Self::new("parameterExpression");
                        param.parameter_name = Some(p.name.clone());
                        param.type_name = Some(p.ty.name());
                        param
                    })
                    .collect();
                element.body = Some(boxed(*body)?);
            }
        }
        Ok(element)
    }
}

fn required(value: &Option<String>, attribute: &str, location: &str) -> Result<String> {
    value.clone().ok_or_else(|| missing(attribute, location))
}

fn missing(attribute: &str, location: &str) -> RuleError {
    RuleError::compilation(location, format!("缺少 {}", attribute))
}

/// 文档中的常量以 JSON 原始形态出现，按声明的标量类型转换
fn typed_constant(value: Value, value_type: &TypeRef, location: &str) -> Result<Value> {
    if value.is_null() || !value_type.is_scalar() || value.type_ref() == *value_type {
        return Ok(value);
    }
    DefaultValueConverter.convert(value, value_type).map_err(|e| {
        RuleError::compilation(location, format!("常量无法转换为 {}: {}", value_type, e))
    })
}

fn parse_type(name: &str, location: &str) -> Result<TypeRef> {
    name.parse()
        .map_err(|e: RuleError| RuleError::compilation(location, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_lambda_document() {
        let element: NodeElement = serde_json::from_value(json!({
            "node": "lambdaExpression",
            "parameter": [{"node": "parameterExpression", "parameterName": "s", "type": "Patient"}],
            "body": {
                "node": "binaryExpression", "operator": "gte",
                "left": {"node": "memberExpression", "memberName": "age",
                         "object": {"node": "parameterExpression", "parameterName": "s", "type": "Patient"}},
                "right": {"node": "constantExpression", "type": "int", "value": 18}
            }
        }))
        .unwrap();

        let tree = element.to_tree().unwrap();
        assert_eq!(tree.len(), 5);
        assert!(tree.is_initialized());
        assert_eq!(NodeElement::from_tree(&tree).unwrap(), element);
    }

    #[test]
    fn test_unknown_node_kind() {
        let element: NodeElement = serde_json::from_value(json!({
            "node": "lambdaExpression",
            "parameter": [{"node": "parameterExpression", "parameterName": "s"}],
            "body": {"node": "conditionalExpression"}
        }))
        .unwrap();

        match element.to_tree().unwrap_err() {
            RuleError::UnsupportedConstruct {
                construct,
                location,
            } => {
                assert_eq!(construct, "conditionalExpression");
                assert_eq!(location, "lambdaExpression.body");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_operator() {
        let element: NodeElement = serde_json::from_value(json!({
            "node": "binaryExpression", "operator": "xor",
            "left": {"node": "constantExpression", "value": true},
            "right": {"node": "constantExpression", "value": false}
        }))
        .unwrap();
        assert_eq!(element.to_tree().unwrap_err().code(), "UNSUPPORTED_CONSTRUCT");
    }

    #[test]
    fn test_missing_operand() {
        let element: NodeElement = serde_json::from_value(json!({
            "node": "unaryExpression", "operator": "not"
        }))
        .unwrap();
        assert_eq!(element.to_tree().unwrap_err().code(), "COMPILATION_ERROR");
    }
    fn constant_value(element: serde_json::Value) -> Result<Value> {
        let element: NodeElement = serde_json::from_value(element).unwrap();
        let tree = element.to_tree()?;
        match tree.root().and_then(|id| tree.node(id)) {
            Some(ExpressionNode::Constant { value, .. }) => Ok(value.clone()),
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn test_typed_constants_take_declared_type() {
        let id = uuid::Uuid::parse_str("5b2a3c1e-0000-4000-8000-000000000001").unwrap();
        let value = constant_value(json!({
            "node": "constantExpression", "type": "uuid", "value": id.to_string()
        }))
        .unwrap();
        assert_eq!(value, Value::Uuid(id));

        let value = constant_value(json!({
            "node": "constantExpression", "type": "datetime", "value": "2021-03-01"
        }))
        .unwrap();
        let expected = crate::convert::parse_datetime("2021-03-01").unwrap();
        assert_eq!(value, Value::DateTime(expected));

        let value = constant_value(json!({
            "node": "constantExpression", "type": "float", "value": 2
        }))
        .unwrap();
        assert!(matches!(value, Value::Float(f) if f == 2.0));
    }

    #[test]
    fn test_unconvertible_constant_fails() {
        let err = constant_value(json!({
            "node": "constantExpression", "type": "uuid", "value": "not-a-uuid"
        }))
        .unwrap_err();
        assert_eq!(err.code(), "COMPILATION_ERROR");
        assert!(err.to_string().contains("constantExpression"));
    }

    #[test]
    fn test_uuid_constant_survives_save_and_reload() {
        let id = uuid::Uuid::new_v4();
        let element: NodeElement = serde_json::from_value(json!({
            "node": "constantExpression", "type": "uuid", "value": id.to_string()
        }))
        .unwrap();
        let saved = NodeElement::from_tree(&element.to_tree().unwrap()).unwrap();
        let json = serde_json::to_value(&saved).unwrap();
        assert_eq!(json["type"], "uuid");
        assert_eq!(constant_value(json).unwrap(), Value::Uuid(id));
    }
}
