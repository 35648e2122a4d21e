//! 浮层控制端：进程监管 + 状态通道 + 命令通道 + 交互请求
//!
//! `Overlay` 是可廉价克隆的句柄，内部持有唯一的状态对象；所有变更经由它的方法串行化：
//! 修改内存中的 DisplayState，再在同一把锁内发布到状态文件。
//!
//! 锁顺序：stopping → lifecycle → state → pending request。
//! stopping 在整个停止过程中持有，重叠的 stop() 会等前一次把进程组清理完再返回；
//! 分发回调里的 stop() 遇到正在进行的停止时直接返回，由外层 stop() 负责 join watcher。

pub mod command;
pub(crate) mod request;
pub mod script;
pub mod state_channel;
pub mod supervisor;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, OverlayConfig};
use crate::core::{DisplayState, OverlayError};

pub use command::{Command, CommandChannel};
pub use script::{TaskScript, TaskStep};
pub use state_channel::StateChannel;
pub use supervisor::PresenterProcess;

use command::{in_dispatch, run_watcher};
use request::InputCoordinator;
use state_channel::remove_artifact;

/// 关闭按钮回调；收到 Overlay 句柄，可在其中调用 stop()
pub type CloseHandler = Arc<dyn Fn(Overlay) -> BoxFuture<'static, ()> + Send + Sync>;
/// 文本提交回调；与交互请求并行，每条 text_input 都会触发
pub type TextHandler = Arc<dyn Fn(Overlay, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    close: Option<CloseHandler>,
    text: Option<TextHandler>,
}

/// 内存状态与「是否在运行」放在同一把锁下，发布与删除文件因此互斥
struct StateHolder {
    display: DisplayState,
    /// 运行中会话的取消 token；None 表示未运行，发布为空操作
    session: Option<CancellationToken>,
}

/// 一次 start() 到 stop() 之间拥有的资源
struct Session {
    presenter: PresenterProcess,
    watcher: JoinHandle<()>,
    token: CancellationToken,
}

struct Inner {
    config: OverlayConfig,
    state_channel: StateChannel,
    command_path: PathBuf,
    state: Mutex<StateHolder>,
    lifecycle: Mutex<Option<Session>>,
    /// 串行化 stop()：持有期间展示进程组尚未确认退出
    stopping: Mutex<()>,
    requests: InputCoordinator,
    handlers: RwLock<Handlers>,
}

/// 浮层控制句柄
#[derive(Clone)]
pub struct Overlay {
    inner: Arc<Inner>,
}

impl Overlay {
    pub fn new(config: OverlayConfig) -> Self {
        let app_dir = &config.presenter.app_dir;
        let state_channel = StateChannel::new(app_dir.join(&config.channel.state_file));
        let command_path = app_dir.join(&config.channel.command_file);
        tracing::debug!(app_dir = %app_dir.display(), "overlay created");
        Self {
            inner: Arc::new(Inner {
                config,
                state_channel,
                command_path,
                state: Mutex::new(StateHolder {
                    display: DisplayState::default(),
                    session: None,
                }),
                lifecycle: Mutex::new(None),
                stopping: Mutex::new(()),
                requests: InputCoordinator::new(),
                handlers: RwLock::new(Handlers::default()),
            }),
        }
    }

    /// 加载配置后创建；配置加载失败时使用默认值
    pub fn from_config_file(config_path: Option<PathBuf>) -> Self {
        let cfg = load_config(config_path).unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            OverlayConfig::default()
        });
        Self::new(cfg)
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }

    pub fn state_path(&self) -> &Path {
        self.inner.state_channel.path()
    }

    pub fn command_path(&self) -> &Path {
        &self.inner.command_path
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.session.is_some()
    }

    /// 当前内存状态快照
    pub async fn state(&self) -> DisplayState {
        self.inner.state.lock().await.display.clone()
    }

    pub async fn presenter_pid(&self) -> Option<u32> {
        self.inner
            .lifecycle
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.presenter.id())
    }

    /// 是否有交互请求在等待回答
    pub async fn is_waiting_for_input(&self) -> bool {
        self.inner.requests.is_pending().await
    }

    // ---------- 生命周期 ----------

    /// 启动展示进程与命令 watcher；已在运行时为空操作
    pub async fn start(&self) -> Result<(), OverlayError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            tracing::debug!("overlay already running");
            return Ok(());
        }

        tracing::info!("Starting overlay presenter...");
        let presenter = PresenterProcess::spawn(&self.inner.config.presenter)?;
        remove_artifact(&self.inner.command_path).await;

        let token = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().await;
            state.session = Some(token.clone());
            self.publish_locked(&state).await;
        }

        let watcher = tokio::spawn(run_watcher(
            self.clone(),
            CommandChannel::new(&self.inner.command_path),
            self.inner.config.channel.poll_interval(),
            token.clone(),
        ));

        *lifecycle = Some(Session {
            presenter,
            watcher,
            token,
        });
        tracing::info!("Overlay started");
        Ok(())
    }

    /// 停止展示进程及其整个进程组，删除两个协议文件
    ///
    /// 幂等；返回时展示进程组已退出（或已放弃强杀并记录告警）。
    /// 可在关闭回调中调用：此时不等待 watcher，watcher 在本次分发结束后自行退出。
    pub async fn stop(&self) {
        let _stopping = if in_dispatch() {
            // 外层 stop() 正在等待本次分发结束，这里再等它会互相卡住
            match self.inner.stopping.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::debug!("stop already in progress, leaving it to the outer call");
                    return;
                }
            }
        } else {
            self.inner.stopping.lock().await
        };

        let session = self.inner.lifecycle.lock().await.take();
        let Some(session) = session else {
            return;
        };
        tracing::info!("Stopping overlay...");

        self.inner.state.lock().await.session = None;
        session.token.cancel();
        self.inner.requests.cancel().await;

        let mut watcher = session.watcher;
        if in_dispatch() {
            tracing::debug!("stop requested from command dispatch, watcher exits after this command");
        } else {
            let join_timeout = self.inner.config.channel.poll_interval()
                + self.inner.config.supervisor.kill_timeout();
            if tokio::time::timeout(join_timeout, &mut watcher).await.is_err() {
                tracing::warn!("Command watcher did not finish in time, aborting it");
                watcher.abort();
            }
        }

        session
            .presenter
            .terminate(&self.inner.config.supervisor)
            .await;

        // 停止期间若已被重新 start，则保留新会话的文件
        let lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_none() {
            let mut state = self.inner.state.lock().await;
            state.display.end_input();
            self.inner.state_channel.remove().await;
            remove_artifact(&self.inner.command_path).await;
        }
        tracing::info!("Overlay stopped");
    }

    // ---------- 回调 ----------

    /// 注册关闭按钮回调；未注册时关闭命令默认执行 hide()
    ///
    /// 回调运行在 watcher 任务上，不能在其中等待 request_input 的回答。
    pub async fn set_close_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Overlay) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: CloseHandler = Arc::new(move |overlay| handler(overlay).boxed());
        self.inner.handlers.write().await.close = Some(handler);
    }

    pub async fn clear_close_handler(&self) {
        self.inner.handlers.write().await.close = None;
    }

    pub async fn set_text_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Overlay, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TextHandler = Arc::new(move |overlay, text| handler(overlay, text).boxed());
        self.inner.handlers.write().await.text = Some(handler);
    }

    pub async fn clear_text_handler(&self) {
        self.inner.handlers.write().await.text = None;
    }

    // ---------- 状态变更（每个都以发布结束） ----------

    pub async fn show_task(&self, agent_type: &str, task_name: &str, total_steps: u32, sound: Option<&str>) {
        self.mutate(|s| s.show_task(agent_type, task_name, total_steps, sound))
            .await;
        tracing::info!(agent_type, task_name, total_steps, "task started");
    }

    pub async fn update_step(&self, step: u32, step_name: &str, sound: Option<&str>) {
        self.mutate(|s| s.update_step(step, step_name, sound)).await;
        tracing::info!(step, step_name, "step updated");
    }

    pub async fn complete_task(&self, sound: Option<&str>) {
        self.mutate(|s| s.complete_task(sound)).await;
        tracing::info!("task completed");
    }

    pub async fn show_error(&self, message: &str, sound: Option<&str>) {
        self.mutate(|s| s.show_error(message, sound)).await;
    }

    pub async fn show_message(&self, message: &str, agent_type: Option<&str>, sound: Option<&str>) {
        self.mutate(|s| s.show_message(message, agent_type, sound))
            .await;
    }

    pub async fn show(&self) {
        self.mutate(|s| s.set_visible(true)).await;
    }

    /// 隐藏浮层；发布后短暂停顿，给展示进程留出退场动画时间
    pub async fn hide(&self) {
        self.mutate(|s| s.set_visible(false)).await;
        tokio::time::sleep(self.inner.config.channel.hide_delay()).await;
    }

    pub async fn set_active(&self, active: bool) {
        self.mutate(|s| s.set_active(active)).await;
    }

    /// 合并任意字段后发布；字段类型与已知字段冲突时返回 InvalidUpdate 且不发布
    pub async fn send_custom_update(&self, fields: Map<String, Value>) -> Result<(), OverlayError> {
        let mut state = self.inner.state.lock().await;
        state.display.merge(fields)?;
        self.publish_locked(&state).await;
        Ok(())
    }

    /// 提问并等待回答
    ///
    /// 返回用户提交的文本（空串也是合法回答）；等待期间 stop() 返回 `Cancelled`，
    /// 已有请求未回答时返回 `RequestPending`，未运行时返回 `NotRunning`。
    ///
    /// 调用方的 future 被丢弃（如外层 timeout）时，等待标记会在后台清除并重新发布。
    pub async fn request_input(&self, prompt: &str, sound: Option<&str>) -> Result<String, OverlayError> {
        // 先于 answer 声明：drop 顺序相反，后台清理时接收端已关闭
        let mut guard = AbandonGuard::new(self.clone());
        let begun = {
            let mut state = self.inner.state.lock().await;
            match state.session.clone() {
                None => Err(OverlayError::NotRunning),
                Some(token) => match self.inner.requests.begin(prompt).await {
                    Ok(answer) => {
                        state.display.begin_input(prompt, sound);
                        self.publish_locked(&state).await;
                        Ok((answer, token))
                    }
                    Err(e) => Err(e),
                },
            }
        };
        let (mut answer, token) = match begun {
            Ok(pair) => pair,
            Err(e) => {
                guard.disarm();
                return Err(e);
            }
        };
        tracing::info!(prompt, "waiting for user input");

        let result = tokio::select! {
            result = &mut answer => result.map_err(|_| OverlayError::Cancelled),
            _ = token.cancelled() => Err(OverlayError::Cancelled),
        };
        guard.disarm();
        result
    }

    // ---------- 内部 ----------

    async fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut DisplayState),
    {
        let mut state = self.inner.state.lock().await;
        f(&mut state.display);
        self.publish_locked(&state).await;
    }

    /// 在持有 state 锁时发布；未运行时为空操作，写失败只记录日志
    async fn publish_locked(&self, state: &StateHolder) {
        if state.session.is_none() {
            tracing::trace!("overlay not running, publish skipped");
            return;
        }
        match self.inner.state_channel.write(&state.display).await {
            Ok(()) => tracing::debug!(
                task = %state.display.task_name,
                step = state.display.current_step,
                visible = state.display.is_visible,
                "state published"
            ),
            Err(e) => tracing::warn!("Failed to publish overlay state: {}", e),
        }
    }

    /// 由 watcher 调用：按 action 分发一条命令
    pub(crate) async fn dispatch(&self, command: Command) {
        match command {
            Command::Close => {
                let handler = self.inner.handlers.read().await.close.clone();
                match handler {
                    Some(handler) => {
                        tracing::info!("close requested, invoking handler");
                        handler(self.clone()).await;
                    }
                    None => {
                        self.hide().await;
                        tracing::info!("close requested, overlay hidden");
                    }
                }
            }
            Command::TextInput { text } => {
                self.resolve_input(&text).await;
                let handler = self.inner.handlers.read().await.text.clone();
                if let Some(handler) = handler {
                    handler(self.clone(), text).await;
                }
            }
            Command::Unknown => {
                tracing::warn!("Ignoring command with unknown action");
            }
        }
    }

    /// 等待方已放弃的请求：清除等待标记并发布；槽位已被新请求占用时不动
    async fn clear_abandoned_input(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(request) = self.inner.requests.take_abandoned().await {
            state.display.end_input();
            self.publish_locked(&state).await;
            tracing::info!(prompt = %request.prompt, "input request abandoned by caller");
        }
    }

    /// 有待回答请求时：先清除等待标记并发布，再唤醒等待方
    async fn resolve_input(&self, text: &str) {
        let pending = {
            let mut state = self.inner.state.lock().await;
            let pending = self.inner.requests.take().await;
            if pending.is_some() {
                state.display.end_input();
                self.publish_locked(&state).await;
            }
            pending
        };

        match pending {
            Some(request) => {
                let prompt = request.prompt.clone();
                if request.answer(text.to_string()) {
                    tracing::info!(prompt = %prompt, "input received");
                } else {
                    tracing::debug!("input arrived after requester gave up");
                }
            }
            None => tracing::debug!("text input with no pending request"),
        }
    }
}

/// request_input 的 future 在拿到结果前被丢弃时，安排后台清理等待状态
struct AbandonGuard {
    overlay: Option<Overlay>,
}

impl AbandonGuard {
    fn new(overlay: Overlay) -> Self {
        Self {
            overlay: Some(overlay),
        }
    }

    fn disarm(&mut self) {
        self.overlay = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(overlay) = self.overlay.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { overlay.clear_abandoned_input().await });
            }
            Err(_) => tracing::debug!("runtime gone, abandoned input request left as is"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn overlay_in(dir: &TempDir) -> Overlay {
        let mut cfg = OverlayConfig::default();
        cfg.presenter.app_dir = dir.path().to_path_buf();
        cfg.channel.hide_delay_ms = 0;
        Overlay::new(cfg)
    }

    #[tokio::test]
    async fn test_mutations_while_stopped_update_memory_only() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        assert!(!overlay.is_running().await);

        overlay.show_task("Create", "build X", 4, None).await;
        overlay.update_step(1, "analyzing", None).await;
        overlay.hide().await;

        let state = overlay.state().await;
        assert_eq!(state.current_step, 1);
        assert_eq!(state.task_name, "analyzing");
        assert!(!state.is_visible);
        assert!(!overlay.state_path().exists());
    }

    #[tokio::test]
    async fn test_request_input_requires_running() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        let err = overlay.request_input("Enter task", None).await.unwrap_err();
        assert!(matches!(err, OverlayError::NotRunning));
        assert!(!overlay.state().await.is_waiting_for_input);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        overlay.stop().await;
        overlay.stop().await;
        assert!(!overlay.is_running().await);
    }

    #[tokio::test]
    async fn test_custom_update_rejects_bad_types() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        let fields = json!({ "isVisible": "yes" }).as_object().cloned().unwrap();
        let err = overlay.send_custom_update(fields).await.unwrap_err();
        assert!(matches!(err, OverlayError::InvalidUpdate(_)));

        let fields = json!({ "progressColor": "#60a5fa" }).as_object().cloned().unwrap();
        overlay.send_custom_update(fields).await.unwrap();
        assert_eq!(
            overlay.state().await.extra.get("progressColor"),
            Some(&json!("#60a5fa"))
        );
    }

    #[tokio::test]
    async fn test_close_without_handler_hides() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        overlay.show().await;
        overlay.dispatch(Command::Close).await;
        assert!(!overlay.state().await.is_visible);
    }

    #[tokio::test]
    async fn test_text_handler_receives_every_input() {
        let dir = TempDir::new().unwrap();
        let overlay = overlay_in(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        overlay
            .set_text_handler(move |_, text| {
                let sink = sink.clone();
                async move { sink.lock().await.push(text) }
            })
            .await;

        overlay
            .dispatch(Command::TextInput { text: "a".to_string() })
            .await;
        overlay
            .dispatch(Command::TextInput { text: String::new() })
            .await;
        assert_eq!(*seen.lock().await, vec!["a".to_string(), String::new()]);
    }
}
