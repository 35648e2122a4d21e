//! 核心层：错误类型、展示状态、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::OverlayError;
pub use shutdown::{
    run_with_graceful_shutdown, OverlayCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::DisplayState;
