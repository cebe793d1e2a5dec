//! Compact rendering of per-rank hostname lists.
//!
//! Hosts sharing a prefix with numeric suffixes collapse to
//! `prefix[lo-hi,...]` using the idset encoder; everything else is
//! emitted verbatim.  Suffixes with leading zeros are kept verbatim so
//! `node001` never turns into `node1`.

use canopy_idset::{BRACKETS, IdSet, RANGE};

fn split_suffix(host: &str) -> (&str, Option<&str>) {
    let digits = host.len() - host.bytes().rev().take_while(u8::is_ascii_digit).count();
    if digits == host.len() {
        (host, None)
    } else {
        (&host[..digits], Some(&host[digits..]))
    }
}

/// Render `hosts` (in rank order) compactly, preserving first-appearance
/// order of distinct prefixes.
pub fn encode_hostlist(hosts: &[String]) -> String {
    let mut groups: Vec<(String, IdSet, bool)> = Vec::new(); // (prefix, ids, plain)
    for host in hosts {
        let (prefix, suffix) = split_suffix(host);
        match suffix {
            // leading zeros would not round-trip through an idset
            Some(digits) if !(digits.len() > 1 && digits.starts_with('0')) => {
                let id: u32 = match digits.parse() {
                    Ok(id) => id,
                    Err(_) => {
                        groups.push((host.clone(), IdSet::new(), true));
                        continue;
                    }
                };
                if let Some((_, ids, _)) = groups
                    .iter_mut()
                    .find(|(p, _, plain)| !plain && p == prefix)
                {
                    let _ = ids.set(id);
                } else {
                    let mut ids = IdSet::new();
                    let _ = ids.set(id);
                    groups.push((prefix.to_string(), ids, false));
                }
            }
            _ => groups.push((host.clone(), IdSet::new(), true)),
        }
    }
    let mut parts = Vec::new();
    for (prefix, ids, plain) in groups {
        if plain {
            parts.push(prefix);
        } else {
            let encoded = ids.encode(RANGE | BRACKETS).unwrap_or_default();
            parts.push(format!("{prefix}{encoded}"));
        }
    }
    parts.join(",")
}
