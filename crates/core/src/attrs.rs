//! Broker attribute dictionary.
//!
//! Attributes are string key/value pairs describing the instance
//! (`rank`, `size`, `rundir`, `tbon.topo`, ...).  Once sealed at the end
//! of bootstrap, immutable attributes reject updates.

use std::collections::BTreeMap;

use crate::errno::Error;

#[derive(Debug, Clone)]
struct Attr {
    value: String,
    immutable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AttrDict {
    attrs: BTreeMap<String, Attr>,
}

impl AttrDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|a| a.value.as_str())
    }

    /// Set `key`, replacing any mutable prior value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), Error> {
        if let Some(attr) = self.attrs.get(key) {
            if attr.immutable {
                return Err(Error::permission(format!("attribute {key} is immutable")));
            }
        }
        self.attrs.insert(
            key.to_string(),
            Attr {
                value: value.into(),
                immutable: false,
            },
        );
        Ok(())
    }

    /// Set `key` to `default` only if currently unset.
    pub fn ensure(&mut self, key: &str, default: impl Into<String>) -> Result<(), Error> {
        if self.get(key).is_none() {
            self.set(key, default)?;
        }
        Ok(())
    }

    pub fn mark_immutable(&mut self, key: &str) -> Result<(), Error> {
        match self.attrs.get_mut(key) {
            Some(attr) => {
                attr.immutable = true;
                Ok(())
            }
            None => Err(Error::notfound(format!("attribute {key} is not set"))),
        }
    }

    /// Freeze every current attribute.
    pub fn seal(&mut self) {
        for attr in self.attrs.values_mut() {
            attr.immutable = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, a)| (k.as_str(), a.value.as_str()))
    }
}
