use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;

use canopy_core::{Errno, Error};

use crate::pm::{PmInfo, ProcessManager};

/// Bulletin board shared by the participants of an in-process instance.
/// One [`LocalPm`] per simulated broker, all attached to one board.
#[derive(Debug)]
pub struct LocalBoard {
    size: u32,
    name: String,
    kvs: Mutex<HashMap<String, String>>,
    barrier: Barrier,
    aborted: Mutex<Option<String>>,
    next_rank: AtomicU32,
}

impl LocalBoard {
    pub fn new(size: u32, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            size,
            name: name.into(),
            kvs: Mutex::new(HashMap::new()),
            barrier: Barrier::new(size as usize),
            aborted: Mutex::new(None),
            next_rank: AtomicU32::new(0),
        })
    }

    /// Attach the next participant.  Ranks are assigned in attach order.
    pub fn attach(self: &Arc<Self>) -> LocalPm {
        let rank = self.next_rank.fetch_add(1, Ordering::SeqCst);
        assert!(rank < self.size, "more participants than board size");
        LocalPm {
            board: self.clone(),
            rank,
        }
    }

    fn check_aborted(&self) -> Result<(), Error> {
        if let Some(msg) = self.aborted.lock().unwrap().as_ref() {
            return Err(Error::io(format!("instance aborted: {msg}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LocalPm {
    board: Arc<LocalBoard>,
    rank: u32,
}

#[async_trait]
impl ProcessManager for LocalPm {
    fn describe(&self) -> &str {
        "local"
    }

    async fn initialize(&self) -> Result<PmInfo, Error> {
        Ok(PmInfo {
            rank: self.rank,
            size: self.board.size,
            name: self.board.name.clone(),
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.board.check_aborted()?;
        self.board
            .kvs
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str, _rank_hint: Option<u32>) -> Result<String, Error> {
        self.board.check_aborted()?;
        self.board
            .kvs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(Errno::NotFound, format!("key {key} is not set")))
    }

    async fn barrier(&self) -> Result<(), Error> {
        self.board.check_aborted()?;
        self.board.barrier.wait().await;
        self.board.check_aborted()?;
        Ok(())
    }

    async fn finalize(&self) -> Result<(), Error> {
        self.board.check_aborted()
    }

    async fn abort(&self, msg: &str) -> Result<(), Error> {
        let mut aborted = self.board.aborted.lock().unwrap();
        if aborted.is_none() {
            *aborted = Some(format!("rank {}: {}", self.rank, msg));
        }
        Ok(())
    }
}
