// 指纹计算
//
// 分片指纹：分片完整内容的 MD5（不抽样）
// 整文件指纹：按分片索引升序拼接各分片指纹字符串后的 MD5，
// 不是原始文件字节的 MD5；服务端按同样规则计算，两端结果必须一致

use md5::Context as Md5Context;
use std::collections::BTreeMap;

/// 计算一段字节的指纹
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Md5Context::new();
    hasher.consume(data);
    format!("{:x}", hasher.compute())
}

/// 按索引顺序拼接分片指纹计算整文件指纹
pub fn whole_digest<'a, I>(chunk_fingerprints: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Md5Context::new();
    for fingerprint in chunk_fingerprints {
        hasher.consume(fingerprint.as_bytes());
    }
    format!("{:x}", hasher.compute())
}

/// 整文件指纹累加器
///
/// 分片可能乱序完成（worker 池、时间切片），累加器缓存提前到达的指纹，
/// 只有当前一个索引已到达时才把后续指纹依次喂给 MD5，
/// 保证结果与完成顺序无关
pub struct OrderedDigest {
    hasher: Md5Context,
    /// 提前到达、尚不能消费的指纹
    buffered: BTreeMap<usize, String>,
    /// 下一个应消费的索引
    next_index: usize,
    total: usize,
}

impl OrderedDigest {
    pub fn new(total: usize) -> Self {
        Self {
            hasher: Md5Context::new(),
            buffered: BTreeMap::new(),
            next_index: 0,
            total,
        }
    }

    /// 喂入一个分片指纹
    ///
    /// 重复或越界的索引会被忽略，返回 false
    pub fn push(&mut self, index: usize, fingerprint: &str) -> bool {
        if index < self.next_index || index >= self.total || self.buffered.contains_key(&index) {
            return false;
        }
        self.buffered.insert(index, fingerprint.to_string());

        while let Some(fingerprint) = self.buffered.remove(&self.next_index) {
            self.hasher.consume(fingerprint.as_bytes());
            self.next_index += 1;
        }
        true
    }

    /// 已按顺序消费的分片数
    pub fn consumed(&self) -> usize {
        self.next_index
    }

    /// 是否所有分片都已消费
    pub fn is_complete(&self) -> bool {
        self.next_index == self.total
    }

    /// 完成计算；仍有分片缺失时返回 None
    pub fn finalize(self) -> Option<String> {
        if !self.is_complete() {
            return None;
        }
        Some(format!("{:x}", self.hasher.compute()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(digest_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digest_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_whole_digest_is_digest_of_concatenation() {
        let fps = ["aa", "bb", "cc"];
        assert_eq!(whole_digest(fps), digest_bytes(b"aabbcc"));
    }

    #[test]
    fn test_ordered_digest_independent_of_arrival_order() {
        let fps: Vec<String> = (0..6).map(|i| digest_bytes(&[i as u8])).collect();
        let expected = whole_digest(fps.iter().map(String::as_str));

        let mut in_order = OrderedDigest::new(6);
        for (i, fp) in fps.iter().enumerate() {
            in_order.push(i, fp);
        }
        assert_eq!(in_order.finalize().as_deref(), Some(expected.as_str()));

        let mut shuffled = OrderedDigest::new(6);
        for i in [3, 5, 0, 4, 2, 1] {
            shuffled.push(i, &fps[i]);
        }
        assert_eq!(shuffled.finalize().as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_ordered_digest_buffers_until_gap_filled() {
        let mut acc = OrderedDigest::new(3);
        acc.push(2, "c");
        acc.push(1, "b");
        assert_eq!(acc.consumed(), 0);
        acc.push(0, "a");
        assert_eq!(acc.consumed(), 3);
        assert!(acc.is_complete());
    }

    #[test]
    fn test_ordered_digest_rejects_duplicates() {
        let mut acc = OrderedDigest::new(2);
        assert!(acc.push(0, "a"));
        assert!(!acc.push(0, "a"));
        assert!(!acc.push(5, "x"));
        assert!(acc.finalize().is_none());
    }

    #[test]
    fn test_empty_file_digest() {
        let acc = OrderedDigest::new(0);
        assert_eq!(acc.finalize().as_deref(), Some(digest_bytes(b"").as_str()));
    }
}
