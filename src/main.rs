//! overlay-demo：启动浮层并演示任务进度与文本输入
//!
//! 用法：`overlay-demo [--ask] [--config path/to/overlay.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use overlay_bridge::core::{
    run_with_graceful_shutdown, OverlayCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
use overlay_bridge::services::TaskInput;
use overlay_bridge::{observability, Overlay, OverlayError, TaskScript};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let ask = args.iter().any(|a| a == "--ask");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let overlay = Overlay::from_config_file(config_path);
    let manager = Arc::new(ShutdownManager::new());

    // 关闭按钮：停止浮层并结束演示
    let close_manager = Arc::clone(&manager);
    overlay
        .set_close_handler(move |overlay| {
            let manager = Arc::clone(&close_manager);
            async move {
                tracing::info!("User clicked close, stopping demo...");
                overlay.stop().await;
                manager.shutdown(ShutdownReason::PresenterClosed);
            }
        })
        .await;

    let supervisor_cfg = &overlay.config().supervisor;
    let cleanup_timeout = supervisor_cfg.grace_period() + supervisor_cfg.kill_timeout() * 2;
    let mut coordinator =
        ShutdownCoordinator::new(Arc::clone(&manager)).with_timeout(cleanup_timeout);
    coordinator.register(OverlayCleanup::new(overlay.clone()));

    overlay.start().await.context("Failed to start overlay")?;

    run_with_graceful_shutdown(
        Arc::clone(&manager),
        async {
            if let Err(e) = run_demo(&overlay, ask).await {
                tracing::error!("Demo failed: {:#}", e);
                overlay.show_error(&e.to_string(), None).await;
            }
        },
        || coordinator.run_cleanup(),
    )
    .await;

    Ok(())
}

async fn run_demo(overlay: &Overlay, ask: bool) -> anyhow::Result<()> {
    let task_name = if ask {
        overlay.hide().await;
        match TaskInput::new(overlay.clone()).wait_for_task().await {
            Ok(task) if task.is_empty() => {
                overlay.show_message("No task detected", Some("Info"), None).await;
                return Ok(());
            }
            Ok(task) => format!("building {task}"),
            Err(OverlayError::Cancelled) => return Ok(()),
            Err(e) => return Err(e).context("Failed to read task"),
        }
    } else {
        "building neural network".to_string()
    };

    let script = TaskScript::new("Create", task_name)
        .step("loading training data", Duration::from_secs(2))
        .step("initializing model", Duration::from_secs(2))
        .step("training network", Duration::from_secs(3))
        .step("validating results", Duration::from_secs(2));
    overlay.run_script(&script, Some("complete")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let next = overlay
        .request_input("what would you like to do next?", Some("prompt"))
        .await;
    match next {
        Ok(action) if !action.trim().is_empty() => {
            let script = TaskScript::new("Execute", format!("performing {}", action.trim()))
                .step("preparing environment", Duration::from_secs(2))
                .step("executing command", Duration::from_secs(2));
            overlay.run_script(&script, Some("complete")).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(_) | Err(OverlayError::Cancelled) => {}
        Err(e) => return Err(e).context("Failed to read next action"),
    }

    overlay.hide().await;
    Ok(())
}
