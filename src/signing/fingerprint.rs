//! 设备指纹
//!
//! 浏览器端由音频/canvas/UA 等生成，服务端只把它当作标识，
//! 因此这里用 32 字节随机 hex 代替。同一进程内保持不变。

use rand::RngCore;

/// 设备指纹
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    /// 随机生成（64 个 hex 字符）
    pub fn generate() -> Self {
        Self(random_hex(32))
    }

    /// 使用配置中的指纹，未配置或为空时随机生成
    pub fn from_config(configured: Option<&str>) -> Self {
        match configured.map(str::trim) {
            Some(fp) if !fp.is_empty() => Self(fp.to_string()),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 生成 `len` 字节随机数的 hex 表示
pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
