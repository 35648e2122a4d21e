//! 浮层配置：从 config/overlay.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OVERLAY__*` 覆盖（双下划线表示嵌套，如 `OVERLAY__CHANNEL__POLL_INTERVAL_MS=50`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 配置根（对应 config/overlay.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OverlayConfig {
    #[serde(default)]
    pub presenter: PresenterSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

/// [presenter] 段：展示进程的安装目录与启动命令
#[derive(Debug, Clone, Deserialize)]
pub struct PresenterSection {
    /// 展示进程目录；两个协议文件也放在这里
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// 额外注入子进程的环境变量（如 DISPLAY）
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("overlay_app")
}

fn default_program() -> String {
    "npm".to_string()
}

fn default_args() -> Vec<String> {
    vec!["start".to_string()]
}

impl Default for PresenterSection {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            program: default_program(),
            args: default_args(),
            env: HashMap::new(),
        }
    }
}

/// [channel] 段：协议文件名与轮询节奏
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSection {
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_command_file")]
    pub command_file: String,
    /// 命令监听与等待输入共用的轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// hide() 发布后留给展示进程做退场动画的时间（毫秒）
    #[serde(default = "default_hide_delay_ms")]
    pub hide_delay_ms: u64,
}

fn default_state_file() -> String {
    "overlay_state.json".to_string()
}

fn default_command_file() -> String {
    "overlay_commands.json".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_hide_delay_ms() -> u64 {
    100
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            command_file: default_command_file(),
            poll_interval_ms: default_poll_interval_ms(),
            hide_delay_ms: default_hide_delay_ms(),
        }
    }
}

impl ChannelSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn hide_delay(&self) -> Duration {
        Duration::from_millis(self.hide_delay_ms)
    }
}

/// [supervisor] 段：终止进程组时的等待窗口
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    /// SIGTERM 之后等待整组退出的时间（毫秒），超时则 SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// SIGKILL 之后确认退出的时间（毫秒）
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_kill_timeout_ms() -> u64 {
    1000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

impl SupervisorSection {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// 从 config 目录加载配置，环境变量 OVERLAY__* 可覆盖
///
/// 1. 按顺序查找 config/overlay.toml、../config/overlay.toml、overlay.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OVERLAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<OverlayConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/overlay", "../config/overlay", "overlay"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OVERLAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
