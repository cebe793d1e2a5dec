//! File-backed stand-in for the instance KVS.
//!
//! Dotted keys map onto a directory tree under the broker rundir
//! (`job.0000.0004.b200.0000.eventlog` lives at
//! `<root>/job/0000/0004/b200/0000/eventlog`).  The real content store
//! is an external collaborator; this keeps restart recovery and the
//! detail lookups working on a single node.

use std::path::PathBuf;

use async_trait::async_trait;

use canopy_core::rpc::{InfoLookup, Kvs, KvsDirEntry};
use canopy_core::{Error, JobId};

pub struct FileKvs {
    root: PathBuf,
}

impl FileKvs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in key.split('.') {
            path.push(part);
        }
        path
    }
}

#[async_trait]
impl Kvs for FileKvs {
    async fn lookup(&self, key: &str) -> Result<String, Error> {
        let path = self.path_for(key);
        tokio::fs::read_to_string(&path).await.map_err(|err| {
            Error::new(
                Error::from(err).class(),
                format!("kvs lookup {key}: {}", path.display()),
            )
        })
    }

    async fn readdir(&self, key: &str) -> Result<Vec<KvsDirEntry>, Error> {
        let path = self.path_for(key);
        let mut dir = tokio::fs::read_dir(&path).await.map_err(|err| {
            Error::new(
                Error::from(err).class(),
                format!("kvs readdir {key}: {}", path.display()),
            )
        })?;
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(KvsDirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        Ok(entries)
    }
}

/// Jobspec and R lookups served straight from the KVS job directory.
pub struct KvsInfoLookup {
    kvs: FileKvs,
}

impl KvsInfoLookup {
    pub fn new(root: PathBuf) -> Self {
        Self {
            kvs: FileKvs::new(root),
        }
    }
}

#[async_trait]
impl InfoLookup for KvsInfoLookup {
    async fn jobspec(&self, id: JobId) -> Result<String, Error> {
        self.kvs
            .lookup(&format!("job.{}.jobspec", id.encode_dothex()))
            .await
    }

    async fn resource_set(&self, id: JobId) -> Result<String, Error> {
        self.kvs
            .lookup(&format!("job.{}.R", id.encode_dothex()))
            .await
    }
}
