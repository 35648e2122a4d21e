//! 状态通道：控制端 → 展示进程
//!
//! 每次发布都把完整 DisplayState 写入同目录临时文件再 persist 覆盖目标文件，
//! 读者永远看不到写了一半的 JSON。无确认、后写覆盖先写。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::core::{DisplayState, OverlayError};

#[derive(Debug, Clone)]
pub struct StateChannel {
    path: PathBuf,
}

impl StateChannel {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 原子替换状态文件；目录不存在时自动创建
    pub async fn write(&self, state: &DisplayState) -> Result<(), OverlayError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec(state)?;

        let tmp_file = NamedTempFile::new_in(&dir)?;
        tokio::fs::write(tmp_file.path(), json).await?;
        tmp_file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// 读取当前已发布的状态（诊断与测试用）
    pub async fn read(&self) -> Result<DisplayState, OverlayError> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// 删除状态文件；文件本就不存在不算错误
    pub async fn remove(&self) {
        remove_artifact(&self.path).await;
    }
}

/// 删除协议文件；返回文件是否已不存在
pub(crate) async fn remove_artifact(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "artifact removed");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to remove artifact: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_dir_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let channel = StateChannel::new(dir.path().join("nested/app/overlay_state.json"));

        let mut state = DisplayState::default();
        state.show_task("Create", "build X", 4, Some("start"));
        channel.write(&state).await.unwrap();

        let back = channel.read().await.unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    async fn test_write_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let channel = StateChannel::new(dir.path().join("overlay_state.json"));

        let mut state = DisplayState::default();
        channel.write(&state).await.unwrap();
        state.update_step(2, "step2", None);
        channel.write(&state).await.unwrap();

        assert_eq!(channel.read().await.unwrap().current_step, 2);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temporary files must not linger");
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let channel = StateChannel::new(dir.path().join("overlay_state.json"));
        channel.remove().await;
        channel.write(&DisplayState::default()).await.unwrap();
        channel.remove().await;
        assert!(!channel.path().exists());
    }
}
