//! 展示状态：控制端对浮层的完整描述
//!
//! DisplayState 是整份快照而非增量：每次变更都在内存中原地修改，随后整体序列化发布。
//! 字段名按展示进程约定使用 camelCase；未识别的附加字段保存在 `extra` 中并随快照一起输出。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::OverlayError;

/// 由交互请求维护、自定义更新不能直接改的字段
const INPUT_OWNED_FIELDS: [&str; 2] = ["isWaitingForInput", "inputPrompt"];

/// 控制端当前希望展示的内容
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayState {
    /// 当前角色/类别标签（Create / Install / Code / Error ...）
    pub agent_type: String,
    /// 任务名；步骤推进时兼作步骤描述
    pub task_name: String,
    pub current_step: u32,
    pub total_steps: u32,
    pub is_complete: bool,
    /// 圆点是否处于脉动（工作中）状态
    pub is_active: bool,
    pub is_visible: bool,
    pub is_waiting_for_input: bool,
    /// 仅在 is_waiting_for_input 为 true 时有意义
    pub input_prompt: String,
    /// 一次性音效：展示进程看到新的 sound_timestamp 时播放
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_timestamp: Option<i64>,
    /// send_custom_update 写入的前向兼容字段
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            agent_type: "Create".to_string(),
            task_name: "initializing".to_string(),
            current_step: 0,
            total_steps: 3,
            is_complete: false,
            is_active: true,
            is_visible: false,
            is_waiting_for_input: false,
            input_prompt: String::new(),
            play_sound: None,
            sound_timestamp: None,
            extra: Map::new(),
        }
    }
}

impl DisplayState {
    /// 开始新任务：步骤归零，显示并激活，清除完成/等待标记
    pub fn show_task(&mut self, agent_type: &str, task_name: &str, total_steps: u32, sound: Option<&str>) {
        self.agent_type = agent_type.to_string();
        self.task_name = task_name.to_string();
        self.current_step = 0;
        self.total_steps = total_steps;
        self.is_complete = false;
        self.is_active = true;
        self.is_visible = true;
        self.is_waiting_for_input = false;
        self.input_prompt.clear();
        self.set_sound(sound);
    }

    /// 推进到第 step 步（1 起始）；total_steps > 0 时不会超过总步数
    pub fn update_step(&mut self, step: u32, step_name: &str, sound: Option<&str>) {
        self.current_step = self.clamp_step(step);
        self.task_name = step_name.to_string();
        self.is_complete = false;
        self.is_waiting_for_input = false;
        self.input_prompt.clear();
        self.set_sound(sound);
    }

    pub fn complete_task(&mut self, sound: Option<&str>) {
        self.is_complete = true;
        self.is_active = false;
        self.is_waiting_for_input = false;
        self.input_prompt.clear();
        self.set_sound(sound);
    }

    pub fn show_error(&mut self, message: &str, sound: Option<&str>) {
        self.announce("Error", message, sound);
        self.is_active = false;
    }

    /// 通用公告；agent_type 为 None 时沿用当前标签
    pub fn show_message(&mut self, message: &str, agent_type: Option<&str>, sound: Option<&str>) {
        let agent_type = agent_type
            .map(str::to_string)
            .unwrap_or_else(|| self.agent_type.clone());
        self.announce(&agent_type, message, sound);
        self.is_active = true;
    }

    fn announce(&mut self, agent_type: &str, message: &str, sound: Option<&str>) {
        self.agent_type = agent_type.to_string();
        self.task_name = message.to_string();
        self.current_step = 0;
        self.total_steps = 0;
        self.is_complete = false;
        self.is_visible = true;
        self.is_waiting_for_input = false;
        self.input_prompt.clear();
        self.set_sound(sound);
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.is_visible = visible;
    }

    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    /// 进入等待输入：浮层必须可见才能收到回答
    pub fn begin_input(&mut self, prompt: &str, sound: Option<&str>) {
        self.is_waiting_for_input = true;
        self.input_prompt = prompt.to_string();
        self.is_visible = true;
        self.is_active = true;
        self.set_sound(sound);
    }

    pub fn end_input(&mut self) {
        self.is_waiting_for_input = false;
        self.input_prompt.clear();
    }

    /// 合并任意字段：已知字段按类型覆盖，未知字段进入 extra；类型不符时状态保持不变
    ///
    /// 等待输入相关字段只能由交互请求修改；currentStep 与 update_step 一样被限制在 totalSteps 内。
    pub fn merge(&mut self, fields: Map<String, Value>) -> Result<(), OverlayError> {
        if let Some(key) = INPUT_OWNED_FIELDS.iter().find(|k| fields.contains_key(**k)) {
            return Err(OverlayError::InvalidUpdate(format!(
                "{} is managed by request_input",
                key
            )));
        }
        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => return Err(OverlayError::InvalidUpdate("state is not an object".to_string())),
        };
        for (key, value) in fields {
            current.insert(key, value);
        }
        let mut merged: DisplayState = serde_json::from_value(Value::Object(current))
            .map_err(|e| OverlayError::InvalidUpdate(e.to_string()))?;
        merged.current_step = merged.clamp_step(merged.current_step);
        *self = merged;
        Ok(())
    }

    fn clamp_step(&self, step: u32) -> u32 {
        if self.total_steps > 0 && step > self.total_steps {
            tracing::debug!(step, total = self.total_steps, "step beyond total, clamping");
            self.total_steps
        } else {
            step
        }
    }

    fn set_sound(&mut self, sound: Option<&str>) {
        match sound {
            Some(name) => {
                self.play_sound = Some(name.to_string());
                self.sound_timestamp = Some(chrono::Utc::now().timestamp_millis());
            }
            None => {
                self.play_sound = None;
                self.sound_timestamp = None;
            }
        }
    }
}
