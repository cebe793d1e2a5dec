use canopy_core::Error;
use canopy_idset::IdSet;

/// Tree shape of the overlay, selected by a URI from the `kary` family.
///
/// `kary:N` is the complete N-ary tree in rank order; `kary:0` is the
/// degenerate flat tree where rank 0 parents everyone.
#[derive(Debug, Clone)]
pub struct Topology {
    fanout: u32,
    size: u32,
}

impl Topology {
    pub fn create(uri: &str, size: u32) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::invalid("topology size must be nonzero"));
        }
        let fanout = match uri.split_once(':') {
            Some(("kary", arg)) => arg
                .parse::<u32>()
                .map_err(|_| Error::invalid(format!("malformed topology uri '{uri}'")))?,
            _ => return Err(Error::invalid(format!("unknown topology '{uri}'"))),
        };
        Ok(Self { fanout, size })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Upstream peer, `None` for rank 0.
    pub fn parent(&self, rank: u32) -> Option<u32> {
        if rank == 0 || rank >= self.size {
            return None;
        }
        if self.fanout == 0 {
            return Some(0);
        }
        Some((rank - 1) / self.fanout)
    }

    /// Downstream peers in ascending rank order.
    pub fn children(&self, rank: u32) -> Vec<u32> {
        if rank >= self.size {
            return Vec::new();
        }
        if self.fanout == 0 {
            return if rank == 0 {
                (1..self.size).collect()
            } else {
                Vec::new()
            };
        }
        let first = rank as u64 * self.fanout as u64 + 1;
        (first..first + self.fanout as u64)
            .take_while(|&r| r < self.size as u64)
            .map(|r| r as u32)
            .collect()
    }

    /// Ranks whose loss severs the tree: every rank with children.
    pub fn internal_ranks(&self) -> IdSet {
        let mut ids = IdSet::new();
        for rank in 0..self.size {
            if !self.children(rank).is_empty() || rank == 0 {
                // rank 0 is always critical, even in a size-1 instance
                let _ = ids.set(rank);
            }
        }
        ids
    }
}
