//! 展示进程监管：启动、整组终止
//!
//! unix 上子进程放进独立进程组，停止时：
//! - 向整个进程组发送 SIGTERM
//! - 等待宽限期，组内仍有存活进程则 SIGKILL
//! - 仍杀不掉只记录告警，保证 stop() 总能返回
//!
//! Windows 没有进程组信号，用 `taskkill /T` 按进程树结束。

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::config::{PresenterSection, SupervisorSection};
use crate::core::OverlayError;

/// 组内进程是否退出的检查间隔
const EXIT_POLL: Duration = Duration::from_millis(20);

/// 正在运行的展示进程
#[derive(Debug)]
pub struct PresenterProcess {
    child: Child,
    /// 进程组 id（即子进程 pid）
    pgid: Option<u32>,
}

impl PresenterProcess {
    /// 在 app_dir 下启动展示进程，stdout/stderr 转发到 tracing
    pub fn spawn(cfg: &PresenterSection) -> Result<Self, OverlayError> {
        let command_line = std::iter::once(cfg.program.as_str())
            .chain(cfg.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        std::fs::create_dir_all(&cfg.app_dir).map_err(|source| OverlayError::Launch {
            command: command_line.clone(),
            source,
        })?;

        let mut cmd = Command::new(&cfg.program);
        cmd.args(&cfg.args)
            .current_dir(&cfg.app_dir)
            .envs(&cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|source| OverlayError::Launch {
            command: command_line.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let pgid = child.id();
        tracing::info!(command = %command_line, pid = ?pgid, "presenter launched");
        Ok(Self { child, pgid })
    }

    pub fn id(&self) -> Option<u32> {
        self.pgid
    }

    /// 终止整个进程组；失败只记录日志
    #[cfg(unix)]
    pub async fn terminate(mut self, cfg: &SupervisorSection) {
        use nix::sys::signal::Signal;

        let Some(pgid) = self.pgid else {
            return;
        };

        signal_group(pgid, Signal::SIGTERM);
        if self.wait_group_exit(pgid, cfg.grace_period()).await {
            tracing::info!(pgid, "presenter process group exited");
            return;
        }

        tracing::warn!(
            pgid,
            "Presenter did not exit within {}ms, killing process group",
            cfg.grace_period_ms
        );
        signal_group(pgid, Signal::SIGKILL);
        if !self.wait_group_exit(pgid, cfg.kill_timeout()).await {
            tracing::warn!(pgid, "Presenter process group still alive after SIGKILL");
        }
    }

    #[cfg(windows)]
    pub async fn terminate(mut self, cfg: &SupervisorSection) {
        let Some(pid) = self.pgid else {
            return;
        };

        // 先不带 /F 请求关闭整棵进程树，宽限期后再强制
        tree_kill(pid, false).await;
        if self.wait_leader_exit(cfg.grace_period()).await {
            tracing::info!(pid, "presenter process tree exited");
            return;
        }

        tracing::warn!(
            pid,
            "Presenter did not exit within {}ms, killing process tree",
            cfg.grace_period_ms
        );
        tree_kill(pid, true).await;
        if !self.wait_leader_exit(cfg.kill_timeout()).await {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!("Presenter already gone: {}", e);
            }
            tracing::warn!(pid, "Presenter still alive after taskkill");
        }
    }

    #[cfg(windows)]
    async fn wait_leader_exit(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "presenter exited");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for presenter: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    /// 等待组长被回收且组内再无进程；超时返回 false
    #[cfg(unix)]
    async fn wait_group_exit(&mut self, pgid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leader_gone = !matches!(self.child.try_wait(), Ok(None));
            if leader_gone && !group_alive(pgid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => tracing::debug!(pgid, ?signal, "signal sent to presenter group"),
        Err(Errno::ESRCH) => tracing::debug!(pgid, "presenter group already gone"),
        Err(e) => tracing::warn!(pgid, "Failed to send {:?}: {}", signal, e),
    }
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    !matches!(
        killpg(Pid::from_raw(pgid as i32), None::<Signal>),
        Err(Errno::ESRCH)
    )
}

#[cfg(windows)]
async fn tree_kill(pid: u32, force: bool) {
    let mut cmd = tokio::process::Command::new("taskkill");
    cmd.arg("/T").arg("/PID").arg(pid.to_string());
    if force {
        cmd.arg("/F");
    }
    match cmd
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => tracing::debug!(pid, force, "taskkill sent"),
        // 128 表示进程已不存在
        Ok(status) => tracing::debug!(pid, force, ?status, "taskkill reported failure"),
        Err(e) => tracing::warn!(pid, "Failed to run taskkill: {}", e),
    }
}

/// 逐行转发子进程输出；非 UTF-8 内容按有损解码记录，管道始终被读空
async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(target: "presenter", stream, "{}", text.trim_end());
            }
            Err(e) => {
                tracing::debug!(target: "presenter", stream, "output closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn presenter(dir: &TempDir, script: &str) -> PresenterSection {
        PresenterSection {
            app_dir: dir.path().to_path_buf(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        }
    }

    fn quick() -> SupervisorSection {
        SupervisorSection {
            grace_period_ms: 1000,
            kill_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let cfg = PresenterSection {
            app_dir: dir.path().to_path_buf(),
            program: "definitely-not-a-real-presenter-binary".to_string(),
            args: vec![],
            env: HashMap::new(),
        };
        let err = PresenterProcess::spawn(&cfg).unwrap_err();
        assert!(matches!(err, OverlayError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_terminate_gracefully() {
        let dir = TempDir::new().unwrap();
        let process = PresenterProcess::spawn(&presenter(&dir, "exec sleep 30")).unwrap();
        let pgid = process.id().unwrap();
        assert!(group_alive(pgid));

        process.terminate(&quick()).await;
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let process =
            PresenterProcess::spawn(&presenter(&dir, "trap '' TERM; exec sleep 30")).unwrap();
        let pgid = process.id().unwrap();
        // 等 exec 完成，SIGTERM 已被忽略
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cfg = SupervisorSection {
            grace_period_ms: 200,
            kill_timeout_ms: 2000,
        };
        let started = std::time::Instant::now();
        process.terminate(&cfg).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_pipe_drained() {
        let dir = TempDir::new().unwrap();
        // 先写无效 UTF-8，再写远超管道缓冲区的数据；读端停止时 touch 永远到不了
        let script = "printf '\\377\\376\\n'; \
                      yes 'presenter log line' | head -c 300000; \
                      yes 'stderr line' | head -c 300000 >&2; \
                      touch done; exec sleep 30";
        let process = PresenterProcess::spawn(&presenter(&dir, script)).unwrap();

        let marker = dir.path().join("done");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists());
        process.terminate(&quick()).await;
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_quiet() {
        let dir = TempDir::new().unwrap();
        let process = PresenterProcess::spawn(&presenter(&dir, "exit 0")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate(&quick()).await;
    }
}
