//! 浮层错误类型
//!
//! 只有启动失败与调用方误用会返回给调用者；发布失败、命令解析失败、进程组残留等在内部记录日志后吞掉。

use thiserror::Error;

/// 浮层桥接过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OverlayError {
    /// 展示进程无法启动（致命，向 start() 调用者传播）
    #[error("Failed to launch presenter `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 自定义更新与状态结构不兼容（例如 currentStep 传了字符串）
    #[error("Invalid custom update: {0}")]
    InvalidUpdate(String),

    /// 已有一个交互请求在等待回答
    #[error("An input request is already pending")]
    RequestPending,

    /// 等待回答期间展示进程被停止
    #[error("Input request cancelled: overlay stopped")]
    Cancelled,

    #[error("Overlay is not running")]
    NotRunning,

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, OverlayError>;
