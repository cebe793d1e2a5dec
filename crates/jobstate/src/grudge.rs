use std::collections::HashSet;

use canopy_core::{Errno, Error};

/// A set that only allows a value to be inserted once, even after it has
/// been removed.  Used for job dependencies so that a satisfied
/// dependency cannot come back.
#[derive(Debug, Clone, Default)]
pub struct GrudgeSet {
    live: Vec<String>,
    used: HashSet<String>,
}

impl GrudgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `val`.  Fails with `Exists` if the value has ever been in the
    /// set, live or removed.
    pub fn add(&mut self, val: &str) -> Result<(), Error> {
        if self.used.contains(val) {
            return Err(Error::new(Errno::Exists, format!("'{val}' was already added")));
        }
        self.used.insert(val.to_string());
        self.live.push(val.to_string());
        Ok(())
    }

    /// Remove `val`.  Fails with `NotFound` when not a live member.
    pub fn remove(&mut self, val: &str) -> Result<(), Error> {
        match self.live.iter().position(|v| v == val) {
            Some(pos) => {
                self.live.remove(pos);
                Ok(())
            }
            None => Err(Error::notfound(format!("'{val}' is not in the set"))),
        }
    }

    pub fn contains(&self, val: &str) -> bool {
        self.live.iter().any(|v| v == val)
    }

    /// True if `val` is or ever was a member.
    pub fn used(&self, val: &str) -> bool {
        self.used.contains(val)
    }

    /// Live member count.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Count of every value ever added.
    pub fn used_len(&self) -> usize {
        self.used.len()
    }

    /// Live members in insertion order.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.live
                .iter()
                .map(|v| serde_json::Value::String(v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_a_grudge() {
        let mut deps = GrudgeSet::new();
        deps.add("after:f1").unwrap();
        deps.add("singleton").unwrap();
        assert_eq!(deps.add("after:f1").unwrap_err().class(), Errno::Exists);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.used_len(), 2);

        deps.remove("after:f1").unwrap();
        assert_eq!(deps.len(), 1);
        assert!(!deps.contains("after:f1"));
        assert!(deps.used("after:f1"));

        // removal does not forgive
        assert_eq!(deps.add("after:f1").unwrap_err().class(), Errno::Exists);
        assert_eq!(deps.used_len(), 2);
    }

    #[test]
    fn remove_missing_is_notfound() {
        let mut deps = GrudgeSet::new();
        assert_eq!(deps.remove("nope").unwrap_err().class(), Errno::NotFound);
    }

    #[test]
    fn json_preserves_insertion_order() {
        let mut deps = GrudgeSet::new();
        deps.add("b").unwrap();
        deps.add("a").unwrap();
        assert_eq!(deps.to_json(), serde_json::json!(["b", "a"]));
    }
}
