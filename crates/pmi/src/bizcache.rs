use std::sync::{Arc, Mutex};

use canopy_core::{Errno, Error};

use crate::bizcard::Bizcard;
use crate::pm::ProcessManager;

/// Business cards are fetched one by one from the process manager.  To
/// avoid fetching the same card more than once in different parts of
/// wireup, keep a simple per-rank cache.
pub struct Bizcache {
    pm: Arc<dyn ProcessManager>,
    cards: Mutex<Vec<Option<Arc<Bizcard>>>>,
}

impl Bizcache {
    pub fn new(pm: Arc<dyn ProcessManager>, size: u32) -> Self {
        Self {
            pm,
            cards: Mutex::new(vec![None; size as usize]),
        }
    }

    pub fn size(&self) -> u32 {
        self.cards.lock().unwrap().len() as u32
    }

    /// Publish a business card to the process manager under the decimal
    /// rank as key.
    pub async fn put(&self, rank: u32, bc: &Bizcard) -> Result<(), Error> {
        self.pm
            .put(&rank.to_string(), &bc.encode())
            .await
            .map_err(|err| {
                Error::new(
                    err.class(),
                    format!("{}: put {}: {}", self.pm.describe(), rank, err),
                )
            })
    }

    /// Return the card for `rank`, filling the cache entry by fetching
    /// from the process manager if missing.
    pub async fn get(&self, rank: u32) -> Result<Arc<Bizcard>, Error> {
        {
            let cards = self.cards.lock().unwrap();
            match cards.get(rank as usize) {
                Some(Some(bc)) => return Ok(bc.clone()),
                Some(None) => {}
                None => {
                    return Err(Error::new(
                        Errno::Invalid,
                        format!("rank {rank} is out of range"),
                    ));
                }
            }
        }
        let val = self
            .pm
            .get(&rank.to_string(), Some(rank))
            .await
            .map_err(|err| {
                Error::new(
                    err.class(),
                    format!("{}: get {}: {}", self.pm.describe(), rank, err),
                )
            })?;
        let bc = Arc::new(Bizcard::decode(&val).map_err(|err| {
            Error::new(
                err.class(),
                format!("error decoding rank {rank} business card: {err}"),
            )
        })?);
        self.cards.lock().unwrap()[rank as usize] = Some(bc.clone());
        Ok(bc)
    }
}
