//! Body inspection: bounded buffering, binary sniffing, charset decoding.

use crate::FetchError;

/// Bytes inspected for binary signatures.
pub const SNIFF_LEN: usize = 512;

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF", "PDF"),
    (b"PK\x03\x04", "ZIP/Office"),
    (b"\x89PNG", "PNG"),
    (b"\xff\xd8\xff", "JPEG"),
    (b"\x7fELF", "ELF"),
];

/// Reject `head` if it starts with a known binary magic number or contains a
/// null byte within the first [`SNIFF_LEN`] bytes.
pub fn sniff_binary(head: &[u8]) -> Result<(), FetchError> {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if let Some((_, kind)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Err(FetchError::BinaryContent(kind));
    }
    if head.contains(&0) {
        return Err(FetchError::BinaryContent("null byte"));
    }
    Ok(())
}

/// Accumulates body chunks and fails the moment the ceiling is crossed.
#[derive(Debug)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    limit: u64,
    sniffed: bool,
}

impl CappedBuffer {
    pub fn new(limit: u64) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            sniffed: false,
        }
    }

    /// Append a chunk. Sniffs as soon as [`SNIFF_LEN`] bytes are available.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        if self.buf.len() as u64 + chunk.len() as u64 > self.limit {
            return Err(FetchError::SizeExceeded { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);
        if !self.sniffed && self.buf.len() >= SNIFF_LEN {
            sniff_binary(&self.buf)?;
            self.sniffed = true;
        }
        Ok(())
    }

    /// Final sniff for short bodies, then the raw bytes.
    pub fn finish(self) -> Result<Vec<u8>, FetchError> {
        if !self.sniffed {
            sniff_binary(&self.buf)?;
        }
        Ok(self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Strict decode with the declared charset (UTF-8 when none is declared).
pub fn decode(bytes: Vec<u8>, charset: Option<&str>) -> Result<String, FetchError> {
    let charset = charset.unwrap_or("utf-8");
    match charset {
        "utf-8" | "utf8" => String::from_utf8(bytes).map_err(|e| FetchError::Decode {
            charset: charset.to_string(),
            reason: e.to_string(),
        }),
        "us-ascii" | "ascii" => {
            if let Some(pos) = bytes.iter().position(|b| !b.is_ascii()) {
                return Err(FetchError::Decode {
                    charset: charset.to_string(),
                    reason: format!("non-ascii byte at offset {pos}"),
                });
            }
            String::from_utf8(bytes).map_err(|e| FetchError::Decode {
                charset: charset.to_string(),
                reason: e.to_string(),
            })
        }
        "iso-8859-1" | "latin1" | "latin-1" => Ok(bytes.into_iter().map(char::from).collect()),
        other => Err(FetchError::UnsupportedCharset(other.to_string())),
    }
}
