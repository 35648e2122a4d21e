//! 交互请求协调：把异步到达的 text_input 命令变成同步的「提问并等待回答」
//!
//! 同一时刻至多一个待回答请求；回答通过 oneshot 直接唤醒等待方，停止时丢弃发送端即取消。

use tokio::sync::{oneshot, Mutex};

use crate::core::OverlayError;

/// 一个待回答的请求：提示语与回答槽
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub prompt: String,
    answer: oneshot::Sender<String>,
}

impl PendingRequest {
    /// 投递回答；等待方已放弃时返回 false
    pub fn answer(self, text: String) -> bool {
        self.answer.send(text).is_ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct InputCoordinator {
    pending: Mutex<Option<PendingRequest>>,
}

impl InputCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新请求；已有仍在等待的请求时拒绝，而不是排队或覆盖
    pub async fn begin(&self, prompt: &str) -> Result<oneshot::Receiver<String>, OverlayError> {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.as_ref() {
            if !existing.answer.is_closed() {
                return Err(OverlayError::RequestPending);
            }
            tracing::debug!(prompt = %existing.prompt, "replacing abandoned input request");
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingRequest {
            prompt: prompt.to_string(),
            answer: tx,
        });
        Ok(rx)
    }

    /// 取出待回答请求（text_input 到达时调用）
    pub async fn take(&self) -> Option<PendingRequest> {
        self.pending.lock().await.take()
    }

    /// 取出等待方已放弃（接收端已 drop）的请求；仍有人等待时返回 None
    pub async fn take_abandoned(&self) -> Option<PendingRequest> {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|r| r.answer.is_closed()) {
            pending.take()
        } else {
            None
        }
    }

    /// 丢弃待回答请求，等待方收到取消
    pub async fn cancel(&self) {
        if let Some(request) = self.pending.lock().await.take() {
            tracing::info!(prompt = %request.prompt, "pending input request cancelled");
        }
    }

    pub async fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.answer.is_closed())
    }
}
