//! Newline-delimited values.

use std::path::Path;

use async_trait::async_trait;
use helix_core::SinkRecord;
use helix_wal::Storage;

use super::{FileAppender, RecordFormat, RecordWriter};
use crate::error::SinkResult;

/// One record value per line. Keys and metadata are not written.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormat;

impl TextFormat {
    /// Splits file content back into values.
    #[must_use]
    pub fn decode_lines(data: &[u8]) -> Vec<&[u8]> {
        let data = data.strip_suffix(b"\n").unwrap_or(data);
        if data.is_empty() {
            return Vec::new();
        }
        data.split(|b| *b == b'\n').collect()
    }
}

#[async_trait]
impl RecordFormat for TextFormat {
    fn extension(&self) -> &str {
        ".txt"
    }

    async fn open(&self, storage: &dyn Storage, path: &Path) -> SinkResult<Box<dyn RecordWriter>> {
        let file = FileAppender::create(storage, path).await?;
        Ok(Box::new(TextWriter { file }))
    }
}

struct TextWriter {
    file: FileAppender,
}

#[async_trait]
impl RecordWriter for TextWriter {
    async fn append(&mut self, record: &SinkRecord) -> SinkResult<()> {
        let mut line = Vec::with_capacity(record.value.len() + 1);
        line.extend_from_slice(&record.value);
        line.push(b'\n');
        self.file.write(&line).await
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.file.sync().await
    }

    fn bytes_written(&self) -> u64 {
        self.file.position
    }
}
