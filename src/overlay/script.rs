//! 预置任务脚本：一次性描述多步任务并按节奏播放到浮层

use std::time::Duration;

use super::Overlay;

/// 任务中的单个步骤
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStep {
    pub name: String,
    /// 播放到下一步之前停留的时间
    pub duration: Duration,
}

impl TaskStep {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }
}

/// 完整任务：标签、任务名、有序步骤
#[derive(Debug, Clone, PartialEq)]
pub struct TaskScript {
    pub agent_type: String,
    pub task_name: String,
    pub steps: Vec<TaskStep>,
}

impl TaskScript {
    pub fn new(agent_type: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            task_name: task_name.into(),
            steps: Vec::new(),
        }
    }

    /// 追加一步（构建器风格）
    pub fn step(mut self, name: impl Into<String>, duration: Duration) -> Self {
        self.steps.push(TaskStep::new(name, duration));
        self
    }

    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }
}

impl Overlay {
    /// 播放脚本：show_task → 逐步 update_step（1 起始）→ complete_task
    ///
    /// sound 在开始和完成时各提示一次，中间步骤不带音效。
    pub async fn run_script(&self, script: &TaskScript, sound: Option<&str>) {
        self.show_task(&script.agent_type, &script.task_name, script.total_steps(), sound)
            .await;
        for (index, step) in script.steps.iter().enumerate() {
            self.update_step(index as u32 + 1, &step.name, None).await;
            tokio::time::sleep(step.duration).await;
        }
        self.complete_task(sound).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;

    #[test]
    fn test_builder_counts_steps() {
        let script = TaskScript::new("Install", "quick setup")
            .step("download", Duration::from_millis(10))
            .step("install", Duration::from_millis(10));
        assert_eq!(script.total_steps(), 2);
        assert_eq!(script.steps[1].name, "install");
    }

    #[tokio::test]
    async fn test_run_script_ends_complete() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = OverlayConfig::default();
        cfg.presenter.app_dir = dir.path().to_path_buf();
        let overlay = Overlay::new(cfg);

        let script = TaskScript::new("Debug", "fix issues")
            .step("analyze", Duration::ZERO)
            .step("patch", Duration::ZERO)
            .step("verify", Duration::ZERO);
        overlay.run_script(&script, None).await;

        let state = overlay.state().await;
        assert_eq!(state.agent_type, "Debug");
        assert_eq!(state.current_step, 3);
        assert_eq!(state.total_steps, 3);
        assert_eq!(state.task_name, "verify");
        assert!(state.is_complete);
        assert!(!state.is_active);
        assert!(state.play_sound.is_none());
    }

    #[tokio::test]
    async fn test_run_script_cues_sound_at_completion() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = OverlayConfig::default();
        cfg.presenter.app_dir = dir.path().to_path_buf();
        let overlay = Overlay::new(cfg);

        let script = TaskScript::new("Create", "build").step("compile", Duration::ZERO);
        overlay.run_script(&script, Some("chime")).await;

        let state = overlay.state().await;
        assert!(state.is_complete);
        assert_eq!(state.play_sound.as_deref(), Some("chime"));
        assert!(state.sound_timestamp.is_some());
    }
}
