//! 命令通道：展示进程 → 控制端
//!
//! 后台 watcher 按固定间隔检查命令文件的修改时间；发现更新就读取、解析、删除，再分发。
//! 删除不依赖分发结果，格式错误的命令记录日志后丢弃，不会卡死通道（至多一次投递）。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::state_channel::remove_artifact;
use super::Overlay;

tokio::task_local! {
    /// 命令分发期间置位；stop() 据此判断自己是否运行在 watcher 内部
    static DISPATCHING: ();
}

/// 当前代码是否运行在命令分发回调中
pub(crate) fn in_dispatch() -> bool {
    DISPATCHING.try_with(|_| ()).is_ok()
}

/// 展示进程发来的单个事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// 用户点击了关闭按钮
    Close,
    /// 用户提交了一段文本
    TextInput { text: String },
    /// 未识别的 action（展示进程比控制端新）
    #[serde(other)]
    Unknown,
}

/// 命令文件的读取端：记录上次处理过但未能删除的命令的 mtime
#[derive(Debug)]
pub struct CommandChannel {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl CommandChannel {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 检查一次命令文件；有新命令则消费并返回
    ///
    /// 文件不存在、暂时读不到或长度为零时返回 None，下一轮重试；
    /// 一旦读到内容，无论能否解析都会删除文件。
    pub async fn poll(&mut self) -> Option<Command> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!("Command artifact not accessible, retrying: {}", e);
                return None;
            }
        };
        let mtime = meta.modified().ok();
        if let (Some(current), Some(last)) = (mtime, self.last_mtime) {
            if current <= last {
                return None;
            }
        }

        let raw = match tokio::fs::read(&self.path).await {
            // 零长度：展示进程刚创建文件还没写入
            Ok(raw) if raw.is_empty() => return None,
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Command artifact unreadable, retrying: {}", e);
                return None;
            }
        };
        let parsed = serde_json::from_slice::<Command>(&raw);
        // 删除成功后再出现的文件必然是新写入；删不掉时靠 mtime 避免重复消费
        self.last_mtime = if remove_artifact(&self.path).await {
            None
        } else {
            mtime
        };

        match parsed {
            Ok(command) => {
                tracing::debug!(?command, "command received");
                Some(command)
            }
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed command ({}): {}",
                    e,
                    String::from_utf8_lossy(&raw)
                );
                None
            }
        }
    }
}

/// watcher 主循环：每个 tick 轮询一次，分发在本任务内同步执行
///
/// 分发回调里调用 stop() 只会取消 token；循环在本次分发返回后退出，不会自我 join。
pub(crate) async fn run_watcher(
    overlay: Overlay,
    mut channel: CommandChannel,
    interval: Duration,
    token: CancellationToken,
) {
    tracing::debug!(path = %channel.path().display(), "command watcher started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(command) = channel.poll().await {
            DISPATCHING.scope((), overlay.dispatch(command)).await;
            if token.is_cancelled() {
                break;
            }
        }
    }
    tracing::debug!("command watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel_in(dir: &TempDir) -> CommandChannel {
        CommandChannel::new(dir.path().join("overlay_commands.json"))
    }

    #[test]
    fn test_command_wire_format() {
        let close: Command = serde_json::from_str(r#"{"action":"close"}"#).unwrap();
        assert_eq!(close, Command::Close);

        let text: Command =
            serde_json::from_str(r#"{"action":"text_input","text":"hello"}"#).unwrap();
        assert_eq!(text, Command::TextInput { text: "hello".to_string() });

        let unknown: Command = serde_json::from_str(r#"{"action":"minimize"}"#).unwrap();
        assert_eq!(unknown, Command::Unknown);

        assert!(serde_json::from_str::<Command>(r#"{"action":"text_input"}"#).is_err());
    }

    #[tokio::test]
    async fn test_poll_consumes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let mut channel = channel_in(&dir);
        assert!(channel.poll().await.is_none());

        std::fs::write(channel.path(), r#"{"action":"close"}"#).unwrap();
        assert_eq!(channel.poll().await, Some(Command::Close));
        assert!(!channel.path().exists());
        assert!(channel.poll().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_command_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut channel = channel_in(&dir);

        std::fs::write(channel.path(), "{not json").unwrap();
        assert!(channel.poll().await.is_none());
        assert!(!channel.path().exists());
    }

    #[tokio::test]
    async fn test_empty_file_is_retried() {
        let dir = TempDir::new().unwrap();
        let mut channel = channel_in(&dir);

        std::fs::write(channel.path(), "").unwrap();
        assert!(channel.poll().await.is_none());
        assert!(channel.path().exists());

        std::fs::write(channel.path(), r#"{"action":"text_input","text":""}"#).unwrap();
        assert_eq!(
            channel.poll().await,
            Some(Command::TextInput { text: String::new() })
        );
    }

    #[tokio::test]
    async fn test_whitespace_only_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let mut channel = channel_in(&dir);

        std::fs::write(channel.path(), " \n\t").unwrap();
        assert!(channel.poll().await.is_none());
        assert!(!channel.path().exists());

        std::fs::write(channel.path(), r#"{"action":"close"}"#).unwrap();
        assert_eq!(channel.poll().await, Some(Command::Close));
    }

    #[tokio::test]
    async fn test_not_in_dispatch_by_default() {
        assert!(!in_dispatch());
        let inside = DISPATCHING.scope((), async { in_dispatch() }).await;
        assert!(inside);
    }
}
