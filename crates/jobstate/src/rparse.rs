//! Extract rank/node details from an R (resource set) object.
//!
//! Only the fields the views render are read: the union of `R_lite`
//! rank sets, the rendered nodelist, and the expiration.  Defects are
//! non-fatal for the owning job.

use std::sync::Arc;

use serde_json::Value;

use canopy_core::{Error, JobId};
use canopy_idset::{BRACKETS, IdSet, RANGE};

#[derive(Debug, Clone)]
pub struct ResourceInfo {
    /// Allocated broker ranks, ranged with brackets (`"[0-1]"`).
    pub ranks: String,
    pub rank_ids: IdSet,
    pub nnodes: i32,
    pub nodelist: Option<String>,
    pub expiration: f64,
    pub value: Arc<Value>,
}

pub fn parse(id: JobId, s: &str) -> Result<ResourceInfo, Error> {
    let r: Value = serde_json::from_str(s)
        .map_err(|err| Error::invalid(format!("job {id} invalid R: {err}")))?;

    let mut rank_ids = IdSet::new();
    let rlite = r
        .pointer("/execution/R_lite")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::invalid(format!("job {id} R has no R_lite")))?;
    for entry in rlite {
        let ranks = entry
            .get("rank")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid(format!("job {id} R_lite entry has no rank")))?;
        let ids = IdSet::decode(ranks)
            .map_err(|err| Error::invalid(format!("job {id} R_lite ranks: {err}")))?;
        rank_ids
            .add(&ids)
            .map_err(|_| Error::invalid(format!("job {id} R_lite ranks out of range")))?;
    }

    let nodelist = r
        .pointer("/execution/nodelist")
        .and_then(Value::as_array)
        .map(|hosts| {
            hosts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        });
    let expiration = r
        .pointer("/execution/expiration")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let ranks = rank_ids
        .encode(BRACKETS | RANGE)
        .map_err(|_| Error::invalid(format!("job {id} error encoding ranks")))?;
    Ok(ResourceInfo {
        ranks,
        nnodes: rank_ids.count() as i32,
        rank_ids,
        nodelist,
        expiration,
        value: Arc::new(r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic() {
        let r = json!({
            "version": 1,
            "execution": {
                "R_lite": [{"rank": "0-1", "children": {"core": "0-3"}}],
                "nodelist": ["node[0-1]"],
                "expiration": 1234.5,
            }
        })
        .to_string();
        let info = parse(JobId(1), &r).unwrap();
        assert_eq!(info.ranks, "[0-1]");
        assert_eq!(info.nnodes, 2);
        assert_eq!(info.nodelist.as_deref(), Some("node[0-1]"));
        assert_eq!(info.expiration, 1234.5);
    }

    #[test]
    fn multiple_rlite_entries_union() {
        let r = json!({
            "execution": {
                "R_lite": [
                    {"rank": "0", "children": {}},
                    {"rank": "2-3", "children": {}},
                ],
            }
        })
        .to_string();
        let info = parse(JobId(1), &r).unwrap();
        assert_eq!(info.ranks, "[0,2-3]");
        assert_eq!(info.nnodes, 3);
        assert_eq!(info.nodelist, None);
        assert_eq!(info.expiration, 0.0);
    }

    #[test]
    fn single_rank_has_no_brackets() {
        let r = json!({"execution": {"R_lite": [{"rank": "5"}]}}).to_string();
        let info = parse(JobId(1), &r).unwrap();
        assert_eq!(info.ranks, "5");
        assert_eq!(info.nnodes, 1);
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse(JobId(1), "nope").is_err());
        assert!(parse(JobId(1), "{}").is_err());
        let r = json!({"execution": {"R_lite": [{"rank": "x"}]}}).to_string();
        assert!(parse(JobId(1), &r).is_err());
    }
}
