//! 动作：模板实例化与属性操作

mod operation;
mod template;

pub use operation::{AddOperation, AssignOperation, PropertyOperation};
pub use template::ActionTemplate;
