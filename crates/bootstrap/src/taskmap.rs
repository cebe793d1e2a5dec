use canopy_core::Error;

/// How broker ranks cluster onto physical nodes.
///
/// Encoded as a JSON array of `[nodeid, nnodes, ppn, reps]` blocks.  The
/// usual one-broker-per-node layout of an N-node instance is
/// `[[0,N,1,1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMap {
    blocks: Vec<[u32; 4]>,
}

impl TaskMap {
    pub fn decode(s: &str) -> Result<Self, Error> {
        let blocks: Vec<[u32; 4]> = serde_json::from_str(s)
            .map_err(|err| Error::invalid(format!("malformed task map '{s}': {err}")))?;
        for block in &blocks {
            let [_, nnodes, ppn, reps] = *block;
            if nnodes == 0 || ppn == 0 || reps == 0 {
                return Err(Error::invalid(format!("malformed task map '{s}'")));
            }
        }
        Ok(Self { blocks })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(&self.blocks).unwrap_or_default()
    }

    /// One-broker-per-node layout for `size` nodes.
    pub fn contiguous(size: u32) -> Self {
        Self {
            blocks: vec![[0, size, 1, 1]],
        }
    }

    /// Node hosting task (broker rank) `task`, or `None` when the map
    /// does not cover it.
    pub fn nodeid(&self, task: u32) -> Option<u32> {
        let mut next = 0u64;
        for [nodeid, nnodes, ppn, reps] in &self.blocks {
            let span = *nnodes as u64 * *ppn as u64 * *reps as u64;
            if (task as u64) < next + span {
                let offset = task as u64 - next;
                let per_rep = *nnodes as u64 * *ppn as u64;
                let within = offset % per_rep;
                return Some(*nodeid + (within / *ppn as u64) as u32);
            }
            next += span;
        }
        None
    }

    /// Count how many of `ranks` share a node with `rank`.
    pub fn clique_count(&self, rank: u32, ranks: &[u32]) -> usize {
        match self.nodeid(rank) {
            Some(nid) => ranks
                .iter()
                .filter(|&&r| self.nodeid(r) == Some(nid))
                .count(),
            None => 0,
        }
    }
}
