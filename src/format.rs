//! 样本格式和格式转换
//!
//! 环形缓冲区里存的是原始 little-endian 字节，转换按字节区域进行：
//! - 16-bit PCM ↔ 32-bit float，双向
//! - 同格式直通（memcpy）
//!
//! 其它任何组合都是硬错误，会话在打开时和每次转换时都会拒绝。

use std::fmt;

/// 样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit 有符号整数 PCM（little-endian）
    I16,
    /// 24-bit packed 有符号整数 PCM（little-endian，3 字节/样本）
    I24,
    /// 32-bit 有符号整数 PCM（little-endian）
    I32,
    /// 32-bit IEEE float（little-endian，标称范围 [-1.0, 1.0)）
    F32,
}

impl SampleFormat {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 => 4,
            Self::F32 => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I16 => write!(f, "i16"),
            Self::I24 => write!(f, "i24"),
            Self::I32 => write!(f, "i32"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// 不支持的格式组合
///
/// 携带两端格式，供上层拼装诊断信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnsupportedConversion {
    pub from: SampleFormat,
    pub to: SampleFormat,
}

impl fmt::Display for UnsupportedConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported sample conversion: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for UnsupportedConversion {}

/// 检查格式组合是否受支持
///
/// 支持：同格式直通、i16 ↔ f32。其余组合（24/32-bit 整数的交叉转换）
/// 不在转换路径上，在会话打开时就拒绝
#[inline]
pub fn is_conversion_supported(from: SampleFormat, to: SampleFormat) -> bool {
    from == to
        || matches!(
            (from, to),
            (SampleFormat::I16, SampleFormat::F32) | (SampleFormat::F32, SampleFormat::I16)
        )
}

/// 按字节区域转换样本
///
/// 转换 min(src 样本数, dst 样本数) 个样本，返回实际转换的样本数。
/// 输入输出都是 little-endian 原始字节。
pub fn convert_samples(
    src: &[u8],
    from: SampleFormat,
    dst: &mut [u8],
    to: SampleFormat,
) -> Result<usize, UnsupportedConversion> {
    let count = (src.len() / from.bytes_per_sample()).min(dst.len() / to.bytes_per_sample());

    match (from, to) {
        _ if from == to => {
            let bytes = count * from.bytes_per_sample();
            dst[..bytes].copy_from_slice(&src[..bytes]);
        }
        (SampleFormat::I16, SampleFormat::F32) => {
            for i in 0..count {
                let s = i16::from_le_bytes([src[i * 2], src[i * 2 + 1]]);
                // 除以 32768：所有 i16 值都能被 f32 精确表示
                let f = s as f32 / 32768.0;
                dst[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
            }
        }
        (SampleFormat::F32, SampleFormat::I16) => {
            for i in 0..count {
                let f = f32::from_le_bytes([
                    src[i * 4],
                    src[i * 4 + 1],
                    src[i * 4 + 2],
                    src[i * 4 + 3],
                ]);
                // 饱和到 i16 范围，最近舍入
                let scaled = (f * 32768.0).clamp(-32768.0, 32767.0);
                let v = scaled.round() as i16;
                dst[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
        }
        _ => return Err(UnsupportedConversion { from, to }),
    }

    Ok(count)
}
