//! # clipshot：命令行入口
//!
//! 以默认目标启动剪贴板监视，Ctrl-C 停止。参数解析由外层前端负责。

use clipshot::storage::AppPaths;
use clipshot::{AppError, ClipshotService};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("❌ {} ({})", e, e.code());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let paths = AppPaths::resolve()?;
    log::info!("📁 配置目录: {}", paths.config_dir.display());

    let service = ClipshotService::open(&paths)?;
    service.start_watch(None).await?;
    log::info!("👀 正在监视剪贴板，按 Ctrl-C 退出");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("⚠️ 无法监听 Ctrl-C 信号: {}", e);
    }

    if let Some(stats) = service.stop_watch().await? {
        log::info!(
            "📊 共上传成功 {} 次，失败 {} 次",
            stats.successes,
            stats.failures
        );
    }
    Ok(())
}
