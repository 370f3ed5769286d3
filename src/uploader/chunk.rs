// 上传分片模型
//
// 分片规则：
// - 分片大小 S，文件大小 N，分片数量 = ceil(N / S)
// - chunks[i] 覆盖 [i*S, min(N, (i+1)*S))，分片之间无空隙、无重叠
// - 分片只引用源文件的字节区间，不复制数据；需要时再读取
// - 分片指纹只写一次，由分片器在上报之前写入

use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// 默认上传分片大小: 4MB
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 不可变的字节源（待上传的文件）
///
/// 读取是阻塞的：异步上下文通过 [`Chunk::read_data`] 在阻塞线程池中读取，
/// 哈希 worker 线程直接调用
pub trait ByteSource: Send + Sync {
    /// 文件名（用于创建上传会话）
    fn name(&self) -> &str;

    /// 文件总大小
    fn size(&self) -> u64;

    /// 读取指定字节区间
    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 本地文件
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
}

impl LocalFile {
    /// 打开本地文件（只读取元数据）
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata =
            std::fs::metadata(&path).context(format!("无法获取文件元数据: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path,
            name,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path).context("打开上传文件失败")?;

        // 定位到分片起始位置
        file.seek(SeekFrom::Start(range.start))
            .context("文件定位失败")?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer)
            .context("读取分片数据失败")?;

        Ok(buffer)
    }
}

/// 内存字节源
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let start = range.start as usize;
        let end = range.end as usize;
        let slice = self
            .data
            .get(start..end)
            .context(format!("读取区间越界: {}..{}", start, end))?;
        Ok(slice.to_vec())
    }
}

/// 上传分片
///
/// 克隆共享同一个指纹单元，分片器写入后所有持有者可见
#[derive(Clone)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围（左闭右开）
    pub range: Range<u64>,
    source: Arc<dyn ByteSource>,
    fingerprint: Arc<OnceLock<String>>,
}

impl Chunk {
    pub fn new(source: Arc<dyn ByteSource>, index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            source,
            fingerprint: Arc::new(OnceLock::new()),
        }
    }

    pub fn start(&self) -> u64 {
        self.range.start
    }

    pub fn end(&self) -> u64 {
        self.range.end
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 分片指纹（尚未计算时为 None）
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.get().map(String::as_str)
    }

    /// 是否已计算指纹
    pub fn is_hashed(&self) -> bool {
        self.fingerprint.get().is_some()
    }

    /// 写入指纹，只能写一次
    pub(crate) fn set_fingerprint(&self, fingerprint: String) -> Result<()> {
        self.fingerprint
            .set(fingerprint)
            .map_err(|_| anyhow::anyhow!("分片 #{} 的指纹已写入", self.index))
    }

    /// 同步读取分片数据（worker 线程使用）
    pub fn read_data_blocking(&self) -> Result<Vec<u8>> {
        self.source.read_range(self.range.clone())
    }

    /// 读取分片数据
    ///
    /// 在阻塞线程池中执行文件 I/O
    pub async fn read_data(&self) -> Result<Vec<u8>> {
        let source = self.source.clone();
        let range = self.range.clone();
        let index = self.index;

        let data = tokio::task::spawn_blocking(move || source.read_range(range))
            .await
            .context("读取分片任务执行失败")??;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            index,
            self.range.start,
            self.range.end.saturating_sub(1),
            data.len()
        );

        Ok(data)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("range", &self.range)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// 计算分片数量: ceil(N / S)
pub fn chunk_count(total_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size) as usize
}

/// 按分片大小切分字节源
///
/// 分片大小为 0 时返回错误
pub fn plan_chunks(source: &Arc<dyn ByteSource>, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        anyhow::bail!("分片大小必须大于 0");
    }

    let total_size = source.size();
    let count = chunk_count(total_size, chunk_size);
    let chunks: Vec<Chunk> = (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            let end = std::cmp::min(total_size, start + chunk_size);
            Chunk::new(source.clone(), index, start..end)
        })
        .collect();

    info!(
        "切分文件: name={}, 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        source.name(),
        total_size,
        chunk_size,
        chunks.len()
    );

    Ok(chunks)
}
