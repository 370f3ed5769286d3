// 配置管理模块

use crate::uploader::splitter::{
    default_worker_count, SplitStrategy, DEFAULT_TIME_SLICE_BATCH_SIZE,
};
use crate::uploader::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 本地存储配置
    #[serde(default)]
    pub storage: StorageConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 分片哈希策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategyKind {
    /// 进程内并发计算，全部完成后一次性上报
    #[default]
    Sequential,
    /// 固定数量的 worker 线程
    WorkerPool,
    /// 分批计算，批间让出执行权
    TimeSlice,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节，默认 4MB）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 同时上传的分片数（默认 4）
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 分片哈希策略
    #[serde(default)]
    pub split_strategy: SplitStrategyKind,
    /// worker 池大小（默认为主机并行度，至少 4）
    #[serde(default)]
    pub worker_pool_size: Option<usize>,
    /// 时间切片每批分片数（默认 2）
    #[serde(default = "default_time_slice_batch_size")]
    pub time_slice_batch_size: usize,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_time_slice_batch_size() -> usize {
    DEFAULT_TIME_SLICE_BATCH_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            split_strategy: SplitStrategyKind::default(),
            worker_pool_size: None,
            time_slice_batch_size: default_time_slice_batch_size(),
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.concurrency == 0 {
            anyhow::bail!("并发数必须大于 0");
        }
        if self.worker_pool_size == Some(0) {
            anyhow::bail!("worker 池大小必须大于 0");
        }
        if self.time_slice_batch_size == 0 {
            anyhow::bail!("时间切片批大小必须大于 0");
        }
        Ok(())
    }

    /// 转换为分片器使用的策略
    pub fn split_strategy(&self) -> SplitStrategy {
        match self.split_strategy {
            SplitStrategyKind::Sequential => SplitStrategy::Sequential,
            SplitStrategyKind::WorkerPool => SplitStrategy::WorkerPool {
                workers: self.worker_pool_size.unwrap_or_else(default_worker_count),
            },
            SplitStrategyKind::TimeSlice => SplitStrategy::TimeSlice {
                batch_size: self.time_slice_batch_size,
            },
        }
    }
}

/// 本地存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 存储根目录
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
