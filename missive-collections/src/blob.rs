/*
 * Chunked per-user file storage.
 *
 * A blob is one metadata row plus a run of fixed-size chunks, all keyed
 * under the owner, so a lookup with the wrong owner can only miss.
 * Uploads declared as base64 go through a streaming decoder that carries
 * partial quads across chunk boundaries.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use missive_user::storage::{ArcKvStore, KvStore, StorageError};

pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub cid: Option<String>,
    pub chunks: u32,
}

#[derive(Clone, Debug)]
pub struct BlobUpload {
    pub filename: String,
    pub content_type: String,
    /// `None` for raw bytes, `Some("base64")` for encoded content.
    /// Anything else is rejected.
    pub encoding: Option<String>,
    pub content: Vec<u8>,
    pub cid: Option<String>,
}

/// Incremental base64 decoder: decodes whole quads as they arrive and
/// carries the remainder to the next feed.
#[derive(Default)]
pub struct Base64Decoder {
    carry: Vec<u8>,
}

impl Base64Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<u8>, BlobError> {
        self.carry
            .extend(input.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let whole = self.carry.len() - self.carry.len() % 4;
        let ready = self.carry[..whole].to_vec();
        self.carry.drain(..whole);
        STANDARD.decode(&ready).or(Err(BlobError::InvalidBase64))
    }

    pub fn finish(self) -> Result<Vec<u8>, BlobError> {
        if self.carry.is_empty() {
            return Ok(vec![]);
        }
        STANDARD_NO_PAD
            .decode(&self.carry)
            .or(Err(BlobError::InvalidBase64))
    }
}

fn meta_key(owner: &str, id: &str) -> String {
    format!("blob:{}:{}", owner, id)
}

fn chunk_key(owner: &str, id: &str, n: u32) -> String {
    format!("blob:{}:{}:chunk:{:06}", owner, id, n)
}

#[derive(Clone)]
pub struct BlobFacade {
    kv: ArcKvStore,
    chunk_size: usize,
}

impl BlobFacade {
    pub fn new(kv: ArcKvStore) -> Self {
        Self {
            kv,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[cfg(test)]
    fn with_chunk_size(kv: ArcKvStore, chunk_size: usize) -> Self {
        Self { kv, chunk_size }
    }

    /// Begin a streaming upload. Used directly by the JMAP upload endpoint
    /// which feeds body frames as they arrive.
    pub fn writer(&self, owner: &str, encoding: Option<&str>) -> Result<BlobWriter, BlobError> {
        let decoder = match encoding {
            None => None,
            Some(enc) if enc.eq_ignore_ascii_case("base64") => Some(Base64Decoder::new()),
            Some(other) => return Err(BlobError::UnsupportedEncoding(other.to_string())),
        };
        Ok(BlobWriter {
            kv: self.kv.clone(),
            chunk_size: self.chunk_size,
            owner: owner.to_string(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            decoder,
            pending: Vec::new(),
            chunks: 0,
            size: 0,
        })
    }

    pub async fn add(&self, owner: &str, upload: BlobUpload) -> Result<BlobMeta, BlobError> {
        let mut writer = self.writer(owner, upload.encoding.as_deref())?;
        writer.push(&upload.content).await?;
        writer
            .finish(&upload.filename, &upload.content_type, upload.cid)
            .await
    }

    pub async fn get(&self, owner: &str, id: &str) -> Result<(BlobMeta, Vec<u8>), BlobError> {
        let meta = self.meta(owner, id).await?;
        let mut bytes = Vec::with_capacity(meta.size as usize);
        for n in 0..meta.chunks {
            let chunk = self
                .kv
                .blob_get(&chunk_key(owner, id, n))
                .await
                .or(Err(BlobError::NotFound))?;
            bytes.extend_from_slice(&chunk);
        }
        Ok((meta, bytes))
    }

    pub async fn meta(&self, owner: &str, id: &str) -> Result<BlobMeta, BlobError> {
        let raw = self
            .kv
            .row_get(&meta_key(owner, id))
            .await?
            .ok_or(BlobError::NotFound)?;
        serde_json::from_slice(&raw).or(Err(BlobError::NotFound))
    }

    /// Delete metadata first so concurrent lookups miss immediately, then
    /// reap the chunks.
    pub async fn delete(&self, owner: &str, id: &str) -> Result<(), BlobError> {
        let meta = self.meta(owner, id).await?;
        self.kv.row_del(&meta_key(owner, id)).await?;
        for n in 0..meta.chunks {
            self.kv.blob_rm(&chunk_key(owner, id, n)).await?;
        }
        Ok(())
    }
}

pub struct BlobWriter {
    kv: ArcKvStore,
    chunk_size: usize,
    owner: String,
    id: String,
    decoder: Option<Base64Decoder>,
    pending: Vec<u8>,
    chunks: u32,
    size: u64,
}

impl BlobWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn push(&mut self, input: &[u8]) -> Result<(), BlobError> {
        match &mut self.decoder {
            Some(decoder) => {
                let decoded = decoder.feed(input)?;
                self.pending.extend_from_slice(&decoded);
            }
            None => self.pending.extend_from_slice(input),
        }
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<u8> = self.pending.drain(..self.chunk_size).collect();
            self.write_chunk(chunk).await?;
        }
        Ok(())
    }

    pub async fn finish(
        mut self,
        filename: &str,
        content_type: &str,
        cid: Option<String>,
    ) -> Result<BlobMeta, BlobError> {
        if let Some(decoder) = self.decoder.take() {
            let tail = decoder.finish()?;
            self.pending.extend_from_slice(&tail);
        }
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.write_chunk(chunk).await?;
        }
        let meta = BlobMeta {
            id: self.id.clone(),
            owner: self.owner.clone(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size: self.size,
            cid,
            chunks: self.chunks,
        };
        let raw = serde_json::to_vec(&meta).or(Err(BlobError::Storage(StorageError::Internal)))?;
        self.kv.row_put(&meta_key(&self.owner, &self.id), raw).await?;
        tracing::debug!(owner = %self.owner, id = %self.id, size = self.size, chunks = self.chunks, "blob stored");
        Ok(meta)
    }

    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<(), BlobError> {
        self.size += chunk.len() as u64;
        self.kv
            .blob_put(&chunk_key(&self.owner, &self.id, self.chunks), chunk)
            .await?;
        self.chunks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missive_user::storage::MemKv;
    use std::sync::Arc;

    fn facade() -> BlobFacade {
        BlobFacade::new(Arc::new(MemKv::new()))
    }

    #[tokio::test]
    async fn raw_roundtrip() {
        let facade = facade();
        let meta = facade
            .add("alice", BlobUpload {
                filename: "cat.png".to_string(),
                content_type: "image/png".to_string(),
                encoding: None,
                content: vec![7u8; 1000],
                cid: None,
            })
            .await
            .unwrap();
        assert_eq!(meta.size, 1000);

        let (got_meta, bytes) = facade.get("alice", &meta.id).await.unwrap();
        assert_eq!(got_meta, meta);
        assert_eq!(bytes, vec![7u8; 1000]);
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let facade = facade();
        let meta = facade
            .add("alice", BlobUpload {
                filename: "secret.txt".to_string(),
                content_type: "text/plain".to_string(),
                encoding: None,
                content: b"ssh".to_vec(),
                cid: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            facade.get("mallory", &meta.id).await,
            Err(BlobError::NotFound)
        ));
        assert!(matches!(
            facade.delete("mallory", &meta.id).await,
            Err(BlobError::NotFound)
        ));
        assert!(facade.get("alice", &meta.id).await.is_ok());
    }

    #[tokio::test]
    async fn base64_decodes_across_push_boundaries() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let encoded = STANDARD.encode(&payload);

        let facade = facade();
        let mut writer = facade.writer("alice", Some("base64")).unwrap();
        // feed in awkward slices that split base64 quads
        for piece in encoded.as_bytes().chunks(7) {
            writer.push(piece).await.unwrap();
        }
        let meta = writer
            .finish("blob.bin", "application/octet-stream", None)
            .await
            .unwrap();
        assert_eq!(meta.size, 1000);

        let (_, bytes) = facade.get("alice", &meta.id).await.unwrap();
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn large_content_is_chunked() {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let facade = BlobFacade::with_chunk_size(kv, 256);
        let content = vec![1u8; 1000];
        let meta = facade
            .add("alice", BlobUpload {
                filename: "big".to_string(),
                content_type: "application/octet-stream".to_string(),
                encoding: None,
                content: content.clone(),
                cid: Some("cid:1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(meta.chunks, 4);
        assert_eq!(meta.cid.as_deref(), Some("cid:1"));

        let (_, bytes) = facade.get("alice", &meta.id).await.unwrap();
        assert_eq!(bytes, content);

        facade.delete("alice", &meta.id).await.unwrap();
        assert!(matches!(
            facade.get("alice", &meta.id).await,
            Err(BlobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_encoding_and_bad_base64() {
        let facade = facade();
        assert!(matches!(
            facade
                .add("alice", BlobUpload {
                    filename: "x".to_string(),
                    content_type: "text/plain".to_string(),
                    encoding: Some("uuencode".to_string()),
                    content: vec![],
                    cid: None,
                })
                .await,
            Err(BlobError::UnsupportedEncoding(_))
        ));

        assert!(matches!(
            facade
                .add("alice", BlobUpload {
                    filename: "x".to_string(),
                    content_type: "text/plain".to_string(),
                    encoding: Some("base64".to_string()),
                    content: b"@@@@".to_vec(),
                    cid: None,
                })
                .await,
            Err(BlobError::InvalidBase64)
        ));
    }
}
