// 请求策略
//
// 上传引擎与服务端之间的唯一边界，由调用方实现（HTTP、本地存储、测试桩等）。
// 引擎不做任何重试，重试策略属于具体实现

use crate::uploader::chunk::Chunk;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 创建上传会话时提交的文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// 文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 分片数量
    pub chunk_count: usize,
}

/// 指纹校验的对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FingerprintKind {
    /// 整个文件
    File,
    /// 单个分片
    Chunk { index: usize },
}

/// 指纹校验结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintCheck {
    /// 服务端是否已有该内容
    pub exists: bool,
    /// 服务端仍缺少的分片索引（升序，仅整文件校验时有意义）
    #[serde(default)]
    pub missing_indices: Vec<usize>,
    /// 已存在文件的访问地址
    #[serde(default)]
    pub url: Option<String>,
}

impl FingerprintCheck {
    /// 服务端已有
    pub fn found(url: Option<String>) -> Self {
        Self {
            exists: true,
            missing_indices: Vec::new(),
            url,
        }
    }

    /// 服务端没有，且缺少指定分片
    pub fn missing(indices: Vec<usize>) -> Self {
        Self {
            exists: false,
            missing_indices: indices,
            url: None,
        }
    }
}

/// 远端接口
#[async_trait]
pub trait RequestStrategy: Send + Sync {
    /// 注册上传会话，返回会话 token
    async fn create_file(&self, meta: &FileMeta) -> Result<String>;

    /// 传输一个分片的数据
    async fn upload_chunk(&self, token: &str, chunk: &Chunk) -> Result<()>;

    /// 请求服务端合并所有分片，返回文件地址
    async fn merge_file(&self, token: &str) -> Result<String>;

    /// 按指纹查询服务端是否已有该分片或文件
    async fn check_fingerprint(
        &self,
        token: &str,
        fingerprint: &str,
        kind: FingerprintKind,
    ) -> Result<FingerprintCheck>;
}
