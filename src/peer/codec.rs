use crate::config::DescriptorFormat;
use crate::error::CodecError;
use crate::peer::types::{Descriptor, DescriptorPayload};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

// Ограничиваем размер распаковываемых данных до 256 KiB (защита от zip-bomb)
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

pub fn enc(p: &DescriptorPayload, format: DescriptorFormat) -> Result<String, CodecError> {
    match format {
        DescriptorFormat::Json => Ok(serde_json::to_string(&p.sdp)?),
        DescriptorFormat::Compact => {
            // 1. JSON -> bytes
            let json = serde_json::to_vec(p)?;

            // 2. GZIP сжатие
            let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
            gz.write_all(&json)?;
            let compressed = gz.finish()?;

            // 3. base64
            Ok(general_purpose::STANDARD.encode(compressed))
        }
    }
}

/// Принимает и сжатый конверт, и «голый» JSON браузера.
pub fn dec(s: &str) -> Result<DescriptorPayload, CodecError> {
    let s = s.trim();

    let payload = if s.starts_with('{') {
        let sdp: Descriptor = serde_json::from_str(s)?;
        DescriptorPayload {
            sdp,
            id: String::new(),
            ts: 0,
        }
    } else {
        // 1. base64 -> bytes (вставленный текст часто переносится по строкам)
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let compressed = general_purpose::STANDARD.decode(cleaned)?;

        // 2. gunzip с ограничением размера
        let gz = GzDecoder::new(&compressed[..]);
        let mut json = Vec::new();
        let mut limited_reader = gz.take(MAX_DECOMPRESSED_SIZE + 1);
        limited_reader.read_to_end(&mut json)?;
        if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(CodecError::TooLarge(MAX_DECOMPRESSED_SIZE));
        }

        // 3. JSON -> struct
        serde_json::from_slice(&json)?
    };

    if payload.sdp.sdp.trim().is_empty() {
        return Err(CodecError::EmptySdp);
    }
    Ok(payload)
}
