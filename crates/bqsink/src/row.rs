//! Persisted row framing
//!
//! Between `format_batch` and `deliver` rows live in a host-owned buffer.
//! Each row is one length-prefixed frame (4-byte big-endian length, then the
//! JSON of `{json, insertId?}`), so buffers can be concatenated freely and
//! decoded without any outer envelope.

use crate::error::{Result, SinkError};
use bqsink_common::types::InsertRow;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest single row frame accepted when decoding
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Accumulates framed rows for one host chunk
#[derive(Debug, Default)]
pub struct RowWriter {
    buf: BytesMut,
    rows: usize,
}

impl RowWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: &InsertRow) -> Result<()> {
        let payload = serde_json::to_vec(row)?;
        codec()
            .encode(Bytes::from(payload), &mut self.buf)
            .map_err(|e| SinkError::codec(format!("failed to frame row: {}", e)))?;
        self.rows += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Frame a slice of rows into one buffer
pub fn encode_rows(rows: &[InsertRow]) -> Result<Vec<u8>> {
    let mut writer = RowWriter::new();
    for row in rows {
        writer.push(row)?;
    }
    Ok(writer.into_bytes())
}

/// Decode every frame of a buffer, in order
pub fn decode_rows(data: &[u8]) -> Result<Vec<InsertRow>> {
    let mut codec = codec();
    let mut src = BytesMut::from(data);
    let mut rows = Vec::new();

    while let Some(frame) = codec
        .decode(&mut src)
        .map_err(|e| SinkError::codec(format!("failed to read row frame: {}", e)))?
    {
        rows.push(serde_json::from_slice(&frame)?);
    }

    if !src.is_empty() {
        return Err(SinkError::codec(format!(
            "buffer ends with a truncated row frame ({} trailing bytes)",
            src.len()
        )));
    }

    Ok(rows)
}
