//! Overlay Bridge - 控制端与外部浮层展示进程之间的文件系统同步层
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误类型、DisplayState、优雅关闭
//! - **overlay**: 进程监管、状态通道、命令通道、交互请求与 Overlay 句柄
//! - **services**: 基于浮层的任务输入
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod observability;
pub mod overlay;
pub mod services;

pub use crate::config::{load_config, OverlayConfig};
pub use crate::core::{DisplayState, OverlayError};
pub use crate::overlay::{Command, Overlay, TaskScript, TaskStep};
