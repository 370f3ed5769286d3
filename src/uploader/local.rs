// 本地文件系统存储
//
// 目录结构：
//   <root>/chunks/<分片指纹>                  按内容寻址的分片数据，跨会话去重
//   <root>/sessions/<token>/manifest.json    会话清单（文件信息 + 已收到的分片）
//   <root>/files/<整文件指纹>/<文件名>         合并后的文件
//
// 整文件指纹由存储端根据清单中的分片指纹按索引顺序重新计算，与客户端算法一致

use crate::uploader::chunk::Chunk;
use crate::uploader::fingerprint::{digest_bytes, whole_digest};
use crate::uploader::strategy::{FileMeta, FingerprintCheck, FingerprintKind, RequestStrategy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// 会话清单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub token: String,
    pub meta: FileMeta,
    pub created_at: DateTime<Local>,
    /// 已收到的分片: 索引 -> 指纹
    #[serde(default)]
    pub chunks: BTreeMap<usize, String>,
}

impl SessionManifest {
    /// 尚未收到的分片索引（升序）
    pub fn missing_indices(&self) -> Vec<usize> {
        (0..self.meta.chunk_count)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }
}

/// 本地文件系统请求策略
pub struct LocalStoreStrategy {
    root: PathBuf,
    chunk_dir: PathBuf,
    session_dir: PathBuf,
    file_dir: PathBuf,
    sessions: DashMap<String, Arc<Mutex<SessionManifest>>>,
}

impl LocalStoreStrategy {
    /// 打开（必要时创建）存储目录
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let chunk_dir = root.join("chunks");
        let session_dir = root.join("sessions");
        let file_dir = root.join("files");

        for dir in [&chunk_dir, &session_dir, &file_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .context(format!("创建存储目录失败: {:?}", dir))?;
        }

        let root = tokio::fs::canonicalize(&root)
            .await
            .context(format!("解析存储目录失败: {:?}", root))?;
        info!("本地存储已就绪: {:?}", root);

        Ok(Self {
            chunk_dir: root.join("chunks"),
            session_dir: root.join("sessions"),
            file_dir: root.join("files"),
            root,
            sessions: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_path(&self, fingerprint: &str) -> PathBuf {
        self.chunk_dir.join(fingerprint)
    }

    fn manifest_path(&self, token: &str) -> PathBuf {
        self.session_dir.join(token).join(MANIFEST_FILE)
    }

    /// 指纹只能是十六进制摘要，防止被拼成任意路径
    fn validate_fingerprint(fingerprint: &str) -> Result<()> {
        if fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("非法指纹: {:?}", fingerprint);
        }
        Ok(())
    }

    fn validate_token(token: &str) -> Result<()> {
        if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("非法会话 token: {:?}", token);
        }
        Ok(())
    }

    /// 获取会话（内存中没有时从清单恢复）
    async fn session(&self, token: &str) -> Result<Arc<Mutex<SessionManifest>>> {
        if let Some(session) = self.sessions.get(token) {
            return Ok(session.clone());
        }

        Self::validate_token(token)?;
        let path = self.manifest_path(token);
        let content = tokio::fs::read_to_string(&path)
            .await
            .context(format!("会话不存在: {}", token))?;
        let manifest: SessionManifest =
            serde_json::from_str(&content).context(format!("解析会话清单失败: {:?}", path))?;
        debug!("从清单恢复会话: {}, 已有 {} 个分片", token, manifest.chunks.len());

        let session = self
            .sessions
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(manifest)))
            .clone();
        Ok(session)
    }

    async fn persist(&self, manifest: &SessionManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.token);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("创建会话目录失败: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(manifest).context("序列化会话清单失败")?;
        write_atomic(&path, content.as_bytes()).await
    }

    async fn record_chunk(&self, token: &str, index: usize, fingerprint: &str) -> Result<()> {
        let session = self.session(token).await?;
        let mut manifest = session.lock().await;
        if index >= manifest.meta.chunk_count {
            anyhow::bail!(
                "分片索引越界: {} (共 {} 个分片)",
                index,
                manifest.meta.chunk_count
            );
        }
        manifest.chunks.insert(index, fingerprint.to_string());
        self.persist(&manifest).await
    }

    /// 已合并文件的地址
    async fn find_merged(&self, fingerprint: &str) -> Result<Option<String>> {
        let dir = self.file_dir.join(fingerprint);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(None);
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context(format!("读取目录失败: {:?}", dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_partial = path.extension().map(|ext| ext == "partial").unwrap_or(false);
            if entry.file_type().await?.is_file() && !is_partial {
                return Ok(Some(file_url(&path)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RequestStrategy for LocalStoreStrategy {
    async fn create_file(&self, meta: &FileMeta) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let manifest = SessionManifest {
            token: token.clone(),
            meta: meta.clone(),
            created_at: Local::now(),
            chunks: BTreeMap::new(),
        };
        self.persist(&manifest).await?;
        self.sessions
            .insert(token.clone(), Arc::new(Mutex::new(manifest)));

        info!(
            "创建上传会话: token={}, 文件={}, 大小={}, 分片数={}",
            token, meta.name, meta.size, meta.chunk_count
        );
        Ok(token)
    }

    async fn upload_chunk(&self, token: &str, chunk: &Chunk) -> Result<()> {
        let fingerprint = chunk
            .fingerprint()
            .context(format!("分片 #{} 尚未计算指纹", chunk.index))?
            .to_string();
        Self::validate_fingerprint(&fingerprint)?;

        let data = chunk.read_data().await?;
        let actual = digest_bytes(&data);
        if actual != fingerprint {
            anyhow::bail!(
                "分片 #{} 校验失败: 期望 {}, 实际 {}",
                chunk.index,
                fingerprint,
                actual
            );
        }

        let path = self.chunk_path(&fingerprint);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("分片 #{} 数据已存在，跳过写入", chunk.index);
        } else {
            write_atomic(&path, &data).await?;
        }

        self.record_chunk(token, chunk.index, &fingerprint).await?;
        debug!("分片 #{} 已存储: {} 字节", chunk.index, data.len());
        Ok(())
    }

    async fn merge_file(&self, token: &str) -> Result<String> {
        let session = self.session(token).await?;
        let manifest = session.lock().await;

        let missing = manifest.missing_indices();
        if !missing.is_empty() {
            anyhow::bail!("无法合并，缺少分片: {:?}", missing);
        }

        let digest = whole_digest(manifest.chunks.values().map(String::as_str));
        let target_dir = self.file_dir.join(&digest);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .context(format!("创建文件目录失败: {:?}", target_dir))?;

        let name = sanitize_file_name(&manifest.meta.name);
        let target = target_dir.join(&name);
        let partial = target_dir.join(format!("{}.partial", name));

        let mut output = tokio::fs::File::create(&partial)
            .await
            .context(format!("创建文件失败: {:?}", partial))?;
        let mut written = 0u64;
        for (index, fingerprint) in &manifest.chunks {
            let data = tokio::fs::read(self.chunk_path(fingerprint))
                .await
                .context(format!("读取分片 #{} 失败", index))?;
            output.write_all(&data).await?;
            written += data.len() as u64;
        }
        output.flush().await?;
        drop(output);

        if written != manifest.meta.size {
            let _ = tokio::fs::remove_file(&partial).await;
            anyhow::bail!(
                "合并后大小不符: 期望 {} 字节, 实际 {} 字节",
                manifest.meta.size,
                written
            );
        }

        tokio::fs::rename(&partial, &target)
            .await
            .context(format!("重命名文件失败: {:?}", target))?;

        let url = file_url(&target);
        info!("文件合并完成: token={}, 指纹={}, 地址={}", token, digest, url);
        Ok(url)
    }

    async fn check_fingerprint(
        &self,
        token: &str,
        fingerprint: &str,
        kind: FingerprintKind,
    ) -> Result<FingerprintCheck> {
        Self::validate_fingerprint(fingerprint)?;

        match kind {
            FingerprintKind::Chunk { index } => {
                let exists = tokio::fs::try_exists(self.chunk_path(fingerprint))
                    .await
                    .unwrap_or(false);
                if exists {
                    // 存储中已有相同内容，直接记入本会话
                    self.record_chunk(token, index, fingerprint).await?;
                    debug!("分片 #{} 命中去重: {}", index, fingerprint);
                    return Ok(FingerprintCheck::found(None));
                }
                Ok(FingerprintCheck::missing(Vec::new()))
            }
            FingerprintKind::File => {
                if let Some(url) = self.find_merged(fingerprint).await? {
                    info!("文件已存在，秒传成功: {}", url);
                    return Ok(FingerprintCheck::found(Some(url)));
                }

                let session = self.session(token).await?;
                let manifest = session.lock().await;
                let missing = manifest.missing_indices();
                if !missing.is_empty() {
                    warn!("会话 {} 缺少 {} 个分片: {:?}", token, missing.len(), missing);
                }
                Ok(FingerprintCheck::missing(missing))
            }
        }
    }
}

impl std::fmt::Debug for LocalStoreStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStoreStrategy")
            .field("root", &self.root)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// 先写临时文件再重命名
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data)
        .await
        .context(format!("写入文件失败: {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .context(format!("重命名文件失败: {:?}", path))?;
    Ok(())
}

fn sanitize_file_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match name.trim() {
        "" | "." | ".." => "unnamed".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
