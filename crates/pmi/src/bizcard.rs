use serde::{Deserialize, Serialize};

use canopy_core::Error;

/// A broker's calling card: hostname, optional overlay public key, and
/// the URIs it bound for its children (possibly none, for a leaf).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bizcard {
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pubkey: Option<String>,
    uri: Vec<String>,
}

impl Bizcard {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            host: hostname.into(),
            pubkey: None,
            uri: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.host
    }

    pub fn set_pubkey(&mut self, pubkey: impl Into<String>) {
        self.pubkey = Some(pubkey.into());
    }

    pub fn pubkey(&self) -> Option<&str> {
        self.pubkey.as_deref()
    }

    /// Append a bind URI.  The URI must carry a scheme.
    pub fn uri_append(&mut self, uri: &str) -> Result<(), Error> {
        if !uri.contains("://") {
            return Err(Error::invalid(format!("uri '{uri}' has no scheme")));
        }
        self.uri.push(uri.to_string());
        Ok(())
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.uri.iter().map(String::as_str)
    }

    pub fn uri_first(&self) -> Option<&str> {
        self.uri.first().map(String::as_str)
    }

    /// First URI matching `scheme` (a prefix like `"ipc://"`), or the
    /// first URI at all when `scheme` is `None`.
    pub fn uri_find(&self, scheme: Option<&str>) -> Option<&str> {
        match scheme {
            Some(prefix) => self.uris().find(|uri| uri.starts_with(prefix)),
            None => self.uri_first(),
        }
    }

    pub fn encode(&self) -> String {
        // serialization of a plain struct cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s)
            .map_err(|err| Error::invalid(format!("bizcard decode error: {err}")))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_json(v: &serde_json::Value) -> Result<Self, Error> {
        serde_json::from_value(v.clone())
            .map_err(|err| Error::invalid(format!("bizcard decode error: {err}")))
    }
}
