//! Five-phase tree wireup: topology selection, local bind, card
//! publication, neighbor resolution, finalize.

use std::path::PathBuf;

use tracing::{debug, warn};

use canopy_core::Error;
use canopy_idset::{IdSet, RANGE};

use crate::overlay::Overlay;
use crate::service::Bootstrap;
use crate::taskmap::TaskMap;
use crate::topology::Topology;

const DEFAULT_TOPO: &str = "kary:2";
const DEFAULT_INTERFACE_HINT: &str = "default-route";

fn get_prefer_tcp(boot: &Bootstrap) -> bool {
    match boot.attr_get("tbon.prefertcp") {
        Some(val) => val != "0",
        None => false,
    }
}

/// Assemble this broker into the tree.  Any failure aborts the whole
/// instance through the process manager; a partially wired instance is
/// not recoverable.
pub async fn wireup(boot: &Bootstrap, overlay: &mut Overlay) -> Result<(), Error> {
    match wireup_inner(boot, overlay).await {
        Ok(()) => Ok(()),
        Err(err) => {
            boot.abort(&err.to_string()).await;
            Err(err)
        }
    }
}

async fn wireup_inner(boot: &Bootstrap, overlay: &mut Overlay) -> Result<(), Error> {
    let rank = boot.info().rank;
    let size = boot.info().size;

    {
        let mut attrs = boot.attrs().lock().unwrap();
        attrs.ensure("tbon.topo", DEFAULT_TOPO)?;
        attrs.ensure("tbon.interface-hint", DEFAULT_INTERFACE_HINT)?;
    }
    let topo_uri = boot.attr_get("tbon.topo").unwrap_or_default();
    let topo = Topology::create(&topo_uri, size)
        .map_err(|err| Error::new(err.class(), format!("error creating topology: {err}")))?;
    let crit = topo
        .internal_ranks()
        .encode(RANGE)
        .map_err(|_| Error::invalid("error encoding critical ranks"))?;

    // A size-1 instance has no peers, so skip the exchange.
    if size == 1 {
        return boot.finalize(Some(&crit)).await;
    }

    let recovery_mode = boot.attr_get("broker.recovery-mode").is_some();
    overlay.set_ipv6(std::env::var_os("FLUX_IPADDR_V6").is_some() || recovery_mode);

    let children = topo.children(rank);
    let taskmap = match boot.attr_get("broker.mapping") {
        Some(mapping) => Some(TaskMap::decode(&mapping)?),
        None => None,
    };
    let prefer_tcp = get_prefer_tcp(boot);

    // Bind a listener when there are downstream peers.  Depending on
    // the locality of the children, use tcp://, ipc://, or both.
    if !children.is_empty() && !recovery_mode {
        let nlocal = taskmap
            .as_ref()
            .map(|map| map.clique_count(rank, &children))
            .unwrap_or(0);
        let want_ipc = !prefer_tcp && nlocal > 0;
        let want_tcp = prefer_tcp || nlocal < children.len();

        if want_tcp {
            let hint = boot
                .attr_get("tbon.interface-hint")
                .unwrap_or_else(|| DEFAULT_INTERFACE_HINT.to_string());
            let ip = crate::ipaddr::primary_addr(&hint, overlay.ipv6())?;
            let uri = overlay.bind_tcp(ip).await?;
            debug!(rank, %uri, "bound");
        }
        if want_ipc {
            let rundir = boot
                .attr_get("rundir")
                .ok_or_else(|| Error::invalid("rundir attribute is not set"))?;
            let path = PathBuf::from(rundir).join(format!("tbon-{rank}"));
            let uri = overlay.bind_ipc(&path).await?;
            debug!(rank, %uri, "bound");
        }
    }

    // Publish this broker's card, then rendezvous so every rank's card
    // is available before any rank starts fetching.
    let bc = overlay.bizcard(boot.hostname());
    boot.iam(&bc).await?;
    if let Some(uri) = bc.uri_first() {
        boot.attrs().lock().unwrap().set("tbon.endpoint", uri)?;
    }
    boot.barrier().await?;

    // Resolve the parent's card: pick its ipc:// URI when the parent is
    // on this node and tcp is not forced, record its public key.
    if let Some(parent_rank) = topo.parent(rank) {
        let bc = boot.whois_rank(parent_rank).await?;
        let on_node = taskmap
            .as_ref()
            .map(|map| map.clique_count(rank, &[parent_rank]) == 1)
            .unwrap_or(false);
        let mut uri = None;
        if !prefer_tcp && on_node {
            uri = bc.uri_find(Some("ipc://"));
        }
        let uri = uri
            .or_else(|| bc.uri_find(None))
            .ok_or_else(|| Error::invalid(format!("rank {parent_rank} bound no uri")))?;
        overlay.set_parent_uri(uri)?;
        let pubkey = bc
            .pubkey()
            .ok_or_else(|| Error::invalid(format!("rank {parent_rank} has no pubkey")))?;
        overlay.set_parent_pubkey(pubkey)?;
    }

    // Authorize each child's key under the child's rank as name.
    if !children.is_empty() {
        let mut ids = IdSet::new();
        for child in &children {
            ids.set(*child)
                .map_err(|_| Error::invalid("error building child rank set"))?;
        }
        for (child_rank, bc) in boot.whois(&ids).await? {
            let pubkey = bc
                .pubkey()
                .ok_or_else(|| Error::invalid(format!("rank {child_rank} has no pubkey")))?;
            overlay.authorize(&child_rank.to_string(), pubkey)?;
        }
    }

    // One more rendezvous before connects commence, ensuring every
    // parent has authorized its children.
    boot.barrier().await?;

    if let Err(err) = boot.finalize(Some(&crit)).await {
        warn!(rank, %err, "bootstrap finalize failed");
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use canopy_core::attrs::AttrDict;
    use canopy_pmi::{LocalBoard, ProcessManager};

    use super::*;
    use crate::service::Bootstrap;

    async fn boot_one(
        pm: Arc<dyn ProcessManager>,
        rundir: &std::path::Path,
        hostname: &str,
        size: u32,
    ) -> (Bootstrap, Overlay) {
        let attrs = Arc::new(Mutex::new(AttrDict::new()));
        {
            let mut a = attrs.lock().unwrap();
            a.set("tbon.topo", "kary:2").unwrap();
            a.set("rundir", rundir.display().to_string()).unwrap();
            // all brokers share one node so wireup binds ipc only
            a.set("broker.mapping", format!("[[0,1,{size},1]]")).unwrap();
        }
        let boot = Bootstrap::create(pm, attrs, hostname).await.unwrap();
        let mut overlay = Overlay::new().unwrap();
        wireup(&boot, &mut overlay).await.unwrap();
        (boot, overlay)
    }

    #[tokio::test]
    async fn three_rank_tree_is_fully_wired() {
        let size = 3u32;
        let dir = std::env::temp_dir().join(format!("canopy-wireup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let board = LocalBoard::new(size, "fTEST");
        let mut tasks = Vec::new();
        for rank in 0..size {
            let pm = board.attach();
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                let (boot, overlay) = boot_one(Arc::new(pm), &dir, "node0", size).await;
                (rank, boot, overlay)
            }));
        }

        let mut overlays = Vec::new();
        for task in tasks {
            overlays.push(task.await.unwrap());
        }
        overlays.sort_by_key(|(rank, _, _)| *rank);

        // rank 0 parents 1 and 2; every non-root holds a parent uri and
        // pubkey; rank 0 holds a pubkey per child
        let (_, boot0, overlay0) = &overlays[0];
        assert_eq!(overlay0.parent_uri(), None);
        assert_eq!(overlay0.authorized_count(), 2);
        for (rank, _, overlay) in &overlays[1..] {
            let uri = overlay.parent_uri().expect("parent uri");
            assert!(uri.starts_with("ipc://"), "expected ipc uri, got {uri}");
            let pubkey = overlay.parent_pubkey().expect("parent pubkey");
            assert_eq!(
                overlay0.authorized_pubkey(&rank.to_string()),
                Some(overlay.pubkey()),
                "child {rank} key authorized at parent"
            );
            assert_eq!(pubkey, overlay0.pubkey());
        }

        assert_eq!(boot0.attr_get("broker.critical-ranks").as_deref(), Some("0"));
        assert_eq!(boot0.attr_get("hostlist").as_deref(), Some("node0"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn recovery_mode_binds_nothing() {
        let board = LocalBoard::new(1, "");
        let pm = board.attach();
        let attrs = Arc::new(Mutex::new(AttrDict::new()));
        attrs
            .lock()
            .unwrap()
            .set("broker.recovery-mode", "1")
            .unwrap();
        let boot = Bootstrap::create(Arc::new(pm), attrs, "node0").await.unwrap();
        let mut overlay = Overlay::new().unwrap();
        wireup(&boot, &mut overlay).await.unwrap();
        assert!(overlay.bind_uris().is_empty());
        assert_eq!(overlay.parent_uri(), None);
    }
}
