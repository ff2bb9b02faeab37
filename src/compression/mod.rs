//! slab 数据区压缩/解压（LZ4 / None）
//!
//! 整个 slab 数据区作为一个 LZ4 block 压缩；解压直接写进调用方提供的池化缓冲区。

use crate::common::{EngineError, Result};
use crate::field_type::CompressionType;

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| EngineError::Compression(e.to_string())),
    }
}

/// 解压到 `out`，返回写入的字节数
pub fn decompress_into(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
    out:              &mut [u8],
) -> Result<usize> {
    if out.len() < uncompressed_len {
        return Err(EngineError::Compression(format!(
            "output buffer too small: {} < {uncompressed_len}", out.len()
        )));
    }
    match codec {
        CompressionType::None => {
            if data.len() != uncompressed_len {
                return Err(EngineError::ShortRead { expected: uncompressed_len, actual: data.len() });
            }
            out[..uncompressed_len].copy_from_slice(data);
            Ok(uncompressed_len)
        }
        CompressionType::Lz4 => {
            let n = lz4::block::decompress_to_buffer(
                data,
                Some(uncompressed_len as i32),
                &mut out[..uncompressed_len],
            )
            .map_err(|e| EngineError::Compression(e.to_string()))?;
            if n != uncompressed_len {
                return Err(EngineError::ShortRead { expected: uncompressed_len, actual: n });
            }
            Ok(n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_restores_payload() {
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let packed = compress(&payload, CompressionType::Lz4).unwrap();
        assert!(packed.len() < payload.len());

        let mut out = vec![0u8; payload.len() + 16];
        let n = decompress_into(&packed, CompressionType::Lz4, payload.len(), &mut out).unwrap();
        assert_eq!(&out[..n], &payload[..]);
    }

    #[test]
    fn plain_length_must_match() {
        let mut out = vec![0u8; 8];
        assert!(decompress_into(&[1, 2, 3], CompressionType::None, 4, &mut out).is_err());
        assert_eq!(decompress_into(&[1, 2, 3, 4], CompressionType::None, 4, &mut out).unwrap(), 4);
    }
}
