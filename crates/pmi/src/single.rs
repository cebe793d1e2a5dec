use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use canopy_core::{Error, Errno};

use crate::pm::{PmInfo, ProcessManager};

/// Process manager for a standalone size-1 instance: the bulletin board
/// is a local map and the barrier is a no-op.
#[derive(Debug, Default)]
pub struct SinglePm {
    name: String,
    kvs: Mutex<HashMap<String, String>>,
}

impl SinglePm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kvs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessManager for SinglePm {
    fn describe(&self) -> &str {
        "single"
    }

    async fn initialize(&self) -> Result<PmInfo, Error> {
        Ok(PmInfo {
            rank: 0,
            size: 1,
            name: self.name.clone(),
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.kvs
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str, _rank_hint: Option<u32>) -> Result<String, Error> {
        self.kvs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(Errno::NotFound, format!("key {key} is not set")))
    }

    async fn barrier(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn finalize(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn abort(&self, msg: &str) -> Result<(), Error> {
        Err(Error::io(format!("single: abort: {msg}")))
    }
}
