//! Per-rank bootstrap service.
//!
//! Wireup publishes and resolves business cards through these entry
//! points; each backs onto the rank's own process manager connection.
//! The finalize step derives the `hostlist` and `broker.critical-ranks`
//! attributes and releases the process manager.

use std::sync::{Arc, Mutex};

use canopy_core::attrs::AttrDict;
use canopy_core::{Errno, Error};
use canopy_idset::IdSet;
use canopy_pmi::{Bizcache, Bizcard, PmInfo, ProcessManager};

use crate::taskmap::TaskMap;

pub struct Bootstrap {
    pm: Arc<dyn ProcessManager>,
    cache: Bizcache,
    attrs: Arc<Mutex<AttrDict>>,
    info: PmInfo,
    hostname: String,
    finalized: Mutex<bool>,
}

impl Bootstrap {
    pub async fn create(
        pm: Arc<dyn ProcessManager>,
        attrs: Arc<Mutex<AttrDict>>,
        hostname: impl Into<String>,
    ) -> Result<Self, Error> {
        let info = pm.initialize().await.map_err(|err| {
            Error::new(
                err.class(),
                format!("{}: initialize: {err}", pm.describe()),
            )
        })?;
        let cache = Bizcache::new(pm.clone(), info.size);
        let boot = Self {
            pm,
            cache,
            attrs,
            info,
            hostname: hostname.into(),
            finalized: Mutex::new(false),
        };
        boot.setattrs_early().await?;
        Ok(boot)
    }

    /// Attributes knowable before any exchange: instance identity and
    /// the broker-to-node mapping.
    async fn setattrs_early(&self) -> Result<(), Error> {
        let instance_level = self
            .pm
            .get("instance-level", None)
            .await
            .unwrap_or_else(|_| "0".to_string());
        let mapping = if self.info.size == 1 || self.pm.describe() == "config" {
            Some(TaskMap::contiguous(self.info.size).encode())
        } else {
            match self.pm.get("PMI_process_mapping", None).await {
                // re-encode to validate
                Ok(val) => Some(TaskMap::decode(&val)?.encode()),
                Err(_) => None,
            }
        };

        let mut attrs = self.attrs.lock().unwrap();
        attrs.ensure("instance-level", instance_level)?;
        if !self.info.name.is_empty() {
            attrs.ensure("jobid", &self.info.name)?;
        }
        if let Some(mapping) = mapping {
            attrs.ensure("broker.mapping", mapping)?;
        }
        Ok(())
    }

    pub fn info(&self) -> &PmInfo {
        &self.info
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn method(&self) -> &str {
        self.pm.describe()
    }

    pub fn attrs(&self) -> &Arc<Mutex<AttrDict>> {
        &self.attrs
    }

    pub fn attr_get(&self, key: &str) -> Option<String> {
        self.attrs.lock().unwrap().get(key).map(str::to_string)
    }

    pub(crate) async fn abort(&self, msg: &str) {
        let _ = self.pm.abort(msg).await;
    }

    /// Publish this broker's business card.
    pub async fn iam(&self, bc: &Bizcard) -> Result<(), Error> {
        self.cache.put(self.info.rank, bc).await
    }

    /// Collective rendezvous: every rank's card is published before any
    /// rank returns from the barrier.
    pub async fn barrier(&self) -> Result<(), Error> {
        self.pm.barrier().await.map_err(|err| {
            Error::new(err.class(), format!("{}: barrier: {err}", self.pm.describe()))
        })
    }

    /// Fetch one peer's card.
    pub async fn whois_rank(&self, rank: u32) -> Result<Arc<Bizcard>, Error> {
        self.cache.get(rank).await
    }

    /// Fetch the cards of `ranks`, streamed back in ascending rank
    /// order.
    pub async fn whois(&self, ranks: &IdSet) -> Result<Vec<(u32, Arc<Bizcard>)>, Error> {
        let mut out = Vec::new();
        for rank in ranks.iter() {
            let bc = self.cache.get(rank).await.map_err(|err| {
                Error::new(
                    err.class(),
                    format!("error fetching bizcard for rank {rank}: {err}"),
                )
            })?;
            out.push((rank, bc));
        }
        Ok(out)
    }

    fn setattr_hostlist(&self, hosts: Vec<String>) -> Result<(), Error> {
        let mut attrs = self.attrs.lock().unwrap();
        if attrs.get("hostlist").is_none() {
            let hostlist = if self.info.size == 1 {
                self.hostname.clone()
            } else {
                crate::hostlist::encode_hostlist(&hosts)
            };
            attrs.set("hostlist", hostlist)?;
        }
        attrs.mark_immutable("hostlist")
    }

    fn setattr_critical_ranks(&self, default_value: Option<&str>) -> Result<(), Error> {
        let mut attrs = self.attrs.lock().unwrap();
        let crit = match attrs.get("broker.critical-ranks") {
            Some(crit) => {
                let ids = IdSet::decode(crit).map_err(|_| {
                    Error::invalid(format!("invalid value for broker.critical-ranks='{crit}'"))
                })?;
                match ids.last() {
                    Some(last) if last < self.info.size => crit.to_string(),
                    _ => {
                        return Err(Error::invalid(format!(
                            "invalid value for broker.critical-ranks='{crit}'"
                        )));
                    }
                }
            }
            None => match default_value {
                Some(crit) => crit.to_string(),
                None => format!("0-{}", self.info.size - 1),
            },
        };
        attrs.set("broker.critical-ranks", crit)?;
        attrs.mark_immutable("broker.critical-ranks")
    }

    /// End the bootstrap session.  `default_critical_ranks` is the
    /// topology-aware set applied when the attribute was not set
    /// explicitly.  Idempotent.
    pub async fn finalize(&self, default_critical_ranks: Option<&str>) -> Result<(), Error> {
        if *self.finalized.lock().unwrap() {
            return Ok(());
        }
        let hosts = if self.attr_get("hostlist").is_none() && self.info.size > 1 {
            let mut hosts = Vec::with_capacity(self.info.size as usize);
            for rank in 0..self.info.size {
                hosts.push(self.cache.get(rank).await?.hostname().to_string());
            }
            hosts
        } else {
            Vec::new()
        };
        self.setattr_hostlist(hosts)?;
        self.setattr_critical_ranks(default_critical_ranks)?;
        {
            let mut attrs = self.attrs.lock().unwrap();
            for key in ["instance-level", "jobid", "broker.mapping", "tbon.endpoint"] {
                let _ = attrs.mark_immutable(key);
            }
        }
        self.pm.finalize().await.map_err(|err| {
            Error::new(
                err.class(),
                format!("{}: finalize: {err}", self.pm.describe()),
            )
        })?;
        *self.finalized.lock().unwrap() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_pmi::SinglePm;

    fn attrs() -> Arc<Mutex<AttrDict>> {
        Arc::new(Mutex::new(AttrDict::new()))
    }

    #[tokio::test]
    async fn single_rank_lifecycle() {
        let pm = Arc::new(SinglePm::new("fABC"));
        let attrs = attrs();
        let boot = Bootstrap::create(pm, attrs.clone(), "node0").await.unwrap();
        assert_eq!(boot.info().size, 1);
        assert_eq!(boot.attr_get("jobid").as_deref(), Some("fABC"));
        assert_eq!(boot.attr_get("instance-level").as_deref(), Some("0"));
        assert_eq!(boot.attr_get("broker.mapping").as_deref(), Some("[[0,1,1,1]]"));

        let mut bc = Bizcard::new("node0");
        bc.set_pubkey("KEY");
        boot.iam(&bc).await.unwrap();
        boot.barrier().await.unwrap();
        assert_eq!(boot.whois_rank(0).await.unwrap().pubkey(), Some("KEY"));

        boot.finalize(None).await.unwrap();
        boot.finalize(None).await.unwrap(); // idempotent
        assert_eq!(boot.attr_get("hostlist").as_deref(), Some("node0"));
        assert_eq!(boot.attr_get("broker.critical-ranks").as_deref(), Some("0-0"));
    }

    #[tokio::test]
    async fn configured_critical_ranks_are_validated() {
        let pm = Arc::new(SinglePm::new(""));
        let attrs = attrs();
        attrs
            .lock()
            .unwrap()
            .set("broker.critical-ranks", "0-3")
            .unwrap();
        let boot = Bootstrap::create(pm, attrs, "node0").await.unwrap();
        let mut bc = Bizcard::new("node0");
        bc.set_pubkey("KEY");
        boot.iam(&bc).await.unwrap();
        // rank 3 does not exist in a size-1 instance
        let err = boot.finalize(None).await.unwrap_err();
        assert_eq!(err.class(), Errno::Invalid);
    }
}
