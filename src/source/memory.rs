//! In-memory byte source

use async_trait::async_trait;
use bytes::Bytes;

use super::{check_range, ByteRangeSource};
use crate::error::Result;

/// Byte source over a shared buffer; reads are zero-copy slices
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteRangeSource for MemorySource {
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        check_range(offset, size, self.data.len() as u64)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + size as usize))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
