//! 任务输入：从用户处获取下一条任务指令
//!
//! 目前只有文本模式可用（通过浮层输入框提问）；语音与按键模式依赖语音识别，不在本 crate 内实现。

use crate::core::error::Result;
use crate::core::OverlayError;
use crate::overlay::Overlay;

/// 文本模式下展示给用户的提示语
const TASK_PROMPT: &str = "Enter task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskInputMode {
    Voice,
    Button,
    #[default]
    Text,
}

pub struct TaskInput {
    overlay: Overlay,
    mode: TaskInputMode,
}

impl TaskInput {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            mode: TaskInputMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: TaskInputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn set_mode(&mut self, mode: TaskInputMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> TaskInputMode {
        self.mode
    }

    /// 阻塞直到拿到一条任务；浮层在等待期间被停止时返回 Cancelled
    pub async fn wait_for_task(&self) -> Result<String> {
        match self.mode {
            TaskInputMode::Text => {
                let task = self.overlay.request_input(TASK_PROMPT, None).await?;
                tracing::info!(task = %task, "task received");
                Ok(task.trim().to_string())
            }
            TaskInputMode::Voice => Err(OverlayError::Unsupported(
                "voice task input is not available".to_string(),
            )),
            TaskInputMode::Button => Err(OverlayError::Unsupported(
                "button task input is not available".to_string(),
            )),
        }
    }
}
