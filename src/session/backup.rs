//! Backup operations
//!
//! Chunked export of a domain's raw documents plus the import side
//! (`upload`, `clean`). A `BackupOps` is bound to one pipeline instance; the
//! session replaces it when the workspace pipeline is rebuilt.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{Doc, DocInfo, Domain, Ref};
use crate::pipeline::{Pipeline, PipelineContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    pub idx: u64,
    pub docs: Vec<DocInfo>,
    pub finished: bool,
}

struct ChunkCursor {
    domain: Domain,
    pending: std::vec::IntoIter<DocInfo>,
}

pub struct BackupOps {
    pipeline_instance: u64,
    context: Arc<PipelineContext>,
    chunk_docs: usize,
    chunks: HashMap<u64, ChunkCursor>,
    next_idx: u64,
}

impl BackupOps {
    pub fn new(pipeline: &Pipeline, chunk_docs: usize) -> Self {
        Self {
            pipeline_instance: pipeline.instance_id(),
            context: Arc::clone(pipeline.context()),
            chunk_docs: chunk_docs.max(1),
            chunks: HashMap::new(),
            next_idx: 1,
        }
    }

    pub fn pipeline_instance(&self) -> u64 {
        self.pipeline_instance
    }

    pub fn open_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Start a new export (`idx` = None) or continue an open one.
    pub fn load_chunk(&mut self, domain: &str, idx: Option<u64>) -> Result<DocChunk> {
        let idx = match idx {
            Some(idx) => idx,
            None => {
                let infos = self.context.adapter(domain).raw_doc_infos(domain)?;
                let idx = self.next_idx;
                self.next_idx += 1;
                debug!(domain, idx, docs = infos.len(), "backup chunk opened");
                self.chunks.insert(
                    idx,
                    ChunkCursor {
                        domain: domain.to_string(),
                        pending: infos.into_iter(),
                    },
                );
                idx
            }
        };

        let cursor = self.chunks.get_mut(&idx).ok_or(SyncError::UnknownChunk(idx))?;
        if cursor.domain != domain {
            return Err(SyncError::UnknownChunk(idx));
        }
        let docs: Vec<DocInfo> = cursor.pending.by_ref().take(self.chunk_docs).collect();
        let finished = cursor.pending.len() == 0;
        Ok(DocChunk { idx, docs, finished })
    }

    pub fn close_chunk(&mut self, idx: u64) -> Result<()> {
        self.chunks
            .remove(&idx)
            .map(|_| ())
            .ok_or(SyncError::UnknownChunk(idx))
    }

    pub fn domain_hash(&self, domain: &str) -> Result<String> {
        self.context.adapter(domain).domain_hash(domain)
    }

    pub fn load_docs(&self, domain: &str, ids: &[Ref]) -> Result<Vec<Doc>> {
        self.context.adapter(domain).load_docs(domain, ids)
    }

    pub fn upload(&self, domain: &str, docs: Vec<Doc>) -> Result<()> {
        self.context.adapter(domain).upload(domain, docs)
    }

    pub fn clean(&self, domain: &str, ids: &[Ref]) -> Result<()> {
        self.context.adapter(domain).clean(domain, ids)
    }
}

#[cfg(test)]
mod backup_tests {
    use super::*;
    use crate::model::core_model;
    use crate::storage::{AdapterRegistry, MemoryAdapter};

    fn pipeline_with_docs(n: usize) -> Pipeline {
        let adapter = Arc::new(MemoryAdapter::new());
        let docs = (0..n).map(|i| Doc::new(&format!("d{:03}", i), "c", "s")).collect();
        crate::storage::StoreAdapter::upload(adapter.as_ref(), "blob", docs).unwrap();
        let context = Arc::new(PipelineContext::new("ws", core_model(), AdapterRegistry::new(adapter)));
        Pipeline::new(context, Vec::new())
    }

    #[test]
    fn test_chunked_export() {
        let pipeline = pipeline_with_docs(5);
        let mut ops = BackupOps::new(&pipeline, 2);

        let first = ops.load_chunk("blob", None).unwrap();
        assert_eq!(first.docs.len(), 2);
        assert!(!first.finished);

        let second = ops.load_chunk("blob", Some(first.idx)).unwrap();
        assert_eq!(second.docs[0].id, "d002");
        let third = ops.load_chunk("blob", Some(first.idx)).unwrap();
        assert_eq!(third.docs.len(), 1);
        assert!(third.finished);

        ops.close_chunk(first.idx).unwrap();
        assert!(matches!(ops.load_chunk("blob", Some(first.idx)), Err(SyncError::UnknownChunk(_))));
        assert_eq!(ops.open_chunks(), 0);
    }

    #[test]
    fn test_upload_clean_and_hash() {
        let pipeline = pipeline_with_docs(1);
        let ops = BackupOps::new(&pipeline, 10);
        let before = ops.domain_hash("blob").unwrap();

        ops.upload("blob", vec![Doc::new("x", "c", "s")]).unwrap();
        assert_eq!(ops.load_docs("blob", &["x".to_string()]).unwrap().len(), 1);
        ops.clean("blob", &["x".to_string()]).unwrap();
        assert_eq!(ops.domain_hash("blob").unwrap(), before);
        assert_eq!(ops.pipeline_instance(), pipeline.instance_id());
    }
}
