//! 建立在浮层之上的外围服务

pub mod task_input;

pub use task_input::{TaskInput, TaskInputMode};
