use chunk_uploader::{config::AppConfig, logging, LocalFile, LocalStoreStrategy, UploadEngine};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

fn print_usage() {
    eprintln!("用法: chunk-uploader <文件路径> [配置文件路径]");
    eprintln!("  配置文件默认: {}", DEFAULT_CONFIG_PATH);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(file_path) = args.next() else {
        print_usage();
        std::process::exit(2);
    };
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = AppConfig::load_or_default(&config_path).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("chunk-uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let source = Arc::new(LocalFile::open(&file_path)?);
    let store = Arc::new(LocalStoreStrategy::open(&config.storage.root).await?);
    info!("上传文件: {:?}, 存储目录: {:?}", source.path(), store.root());
    let engine = UploadEngine::from_config(source, store, &config.upload)?;

    engine.on_progress(|percent| info!("上传进度: {}%", percent));
    engine.on_error(|e| {
        if !e.is_terminal() {
            warn!("{}", e);
        }
    });

    // Ctrl-C 取消上传
    let cancel_handle = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中断信号，正在取消上传...");
            cancel_handle.cancel();
        }
    });

    engine.init().await?;

    match engine.wait().await {
        Ok(url) => {
            info!("上传完成");
            println!("{}", url);
            Ok(())
        }
        Err(e) => {
            error!("上传失败: {}", e);
            Err(e.into())
        }
    }
}
