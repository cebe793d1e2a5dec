//! Overlay endpoint state assembled during wireup.
//!
//! The overlay owns the listeners it binds, the broker keypair, and the
//! peer credentials learned from business cards.  Connect-side socket
//! traffic belongs to the transport; after wireup the bound listeners
//! are handed over via [`Overlay::take_listeners`].

use std::collections::HashMap;
use std::io::Read as _;
use std::net::IpAddr;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::net::{TcpListener, UnixListener};

use canopy_core::{Errno, Error};
use canopy_pmi::Bizcard;

fn generate_pubkey() -> Result<String, Error> {
    let mut key = [0u8; 32];
    let mut urandom = std::fs::File::open("/dev/urandom").map_err(Error::from)?;
    urandom.read_exact(&mut key).map_err(Error::from)?;
    Ok(B64.encode(key))
}

#[derive(Debug, Default)]
pub struct Listeners {
    pub tcp: Option<TcpListener>,
    pub ipc: Option<UnixListener>,
}

#[derive(Debug)]
pub struct Overlay {
    pubkey: String,
    ipv6: bool,
    bind_uris: Vec<String>,
    listeners: Listeners,
    parent_uri: Option<String>,
    parent_pubkey: Option<String>,
    authorized: HashMap<String, String>,
}

impl Overlay {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            pubkey: generate_pubkey()?,
            ipv6: false,
            bind_uris: Vec::new(),
            listeners: Listeners::default(),
            parent_uri: None,
            parent_pubkey: None,
            authorized: HashMap::new(),
        })
    }

    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    pub fn set_ipv6(&mut self, on: bool) {
        self.ipv6 = on;
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    /// Bind a tcp listener on a wildcard port and record the resolved
    /// URI.
    pub async fn bind_tcp(&mut self, ip: IpAddr) -> Result<String, Error> {
        let listener = TcpListener::bind((ip, 0))
            .await
            .map_err(|err| Error::io(format!("bind tcp://{ip}:*: {err}")))?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let uri = match addr.ip() {
            IpAddr::V4(ip) => format!("tcp://{}:{}", ip, addr.port()),
            IpAddr::V6(ip) => format!("tcp://[{}]:{}", ip, addr.port()),
        };
        self.listeners.tcp = Some(listener);
        self.bind_uris.push(uri.clone());
        Ok(uri)
    }

    /// Bind a unix-domain listener at `path` and record its ipc:// URI.
    pub async fn bind_ipc(&mut self, path: &Path) -> Result<String, Error> {
        // a previous unclean shutdown may have left the socket file
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::from(err)),
        }
        let listener = UnixListener::bind(path)
            .map_err(|err| Error::io(format!("bind ipc://{}: {err}", path.display())))?;
        let uri = format!("ipc://{}", path.display());
        self.listeners.ipc = Some(listener);
        self.bind_uris.push(uri.clone());
        Ok(uri)
    }

    pub fn bind_uris(&self) -> &[String] {
        &self.bind_uris
    }

    /// The card this broker publishes: hostname, public key, bind URIs.
    pub fn bizcard(&self, hostname: &str) -> Bizcard {
        let mut bc = Bizcard::new(hostname);
        bc.set_pubkey(&self.pubkey);
        for uri in &self.bind_uris {
            // bind_tcp/bind_ipc only record well-formed URIs
            let _ = bc.uri_append(uri);
        }
        bc
    }

    pub fn set_parent_uri(&mut self, uri: &str) -> Result<(), Error> {
        if !uri.contains("://") {
            return Err(Error::invalid(format!("parent uri '{uri}' has no scheme")));
        }
        self.parent_uri = Some(uri.to_string());
        Ok(())
    }

    pub fn parent_uri(&self) -> Option<&str> {
        self.parent_uri.as_deref()
    }

    pub fn set_parent_pubkey(&mut self, pubkey: &str) -> Result<(), Error> {
        if pubkey.is_empty() {
            return Err(Error::invalid("parent pubkey is empty"));
        }
        self.parent_pubkey = Some(pubkey.to_string());
        Ok(())
    }

    pub fn parent_pubkey(&self) -> Option<&str> {
        self.parent_pubkey.as_deref()
    }

    /// Allow a downstream peer to connect with `pubkey`, under `name`
    /// (the child's decimal rank).
    pub fn authorize(&mut self, name: &str, pubkey: &str) -> Result<(), Error> {
        if pubkey.is_empty() {
            return Err(Error::invalid(format!("empty pubkey for peer {name}")));
        }
        if self.authorized.contains_key(name) {
            return Err(Error::new(
                Errno::Exists,
                format!("peer {name} is already authorized"),
            ));
        }
        self.authorized.insert(name.to_string(), pubkey.to_string());
        Ok(())
    }

    pub fn authorized_pubkey(&self, name: &str) -> Option<&str> {
        self.authorized.get(name).map(String::as_str)
    }

    pub fn authorized_count(&self) -> usize {
        self.authorized.len()
    }

    /// Hand the bound listeners to the transport.
    pub fn take_listeners(&mut self) -> Listeners {
        std::mem::take(&mut self.listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_card() {
        let mut overlay = Overlay::new().unwrap();
        let uri = overlay
            .bind_tcp(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert!(uri.starts_with("tcp://127.0.0.1:"));

        let dir = std::env::temp_dir().join(format!("canopy-overlay-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ipc = overlay.bind_ipc(&dir.join("tbon-0")).await.unwrap();
        assert!(ipc.starts_with("ipc://"));

        let bc = overlay.bizcard("node0");
        assert_eq!(bc.hostname(), "node0");
        assert_eq!(bc.pubkey(), Some(overlay.pubkey()));
        assert_eq!(bc.uris().count(), 2);
        assert_eq!(bc.uri_find(Some("ipc://")), Some(ipc.as_str()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn authorize_is_once_per_peer() {
        let mut overlay = Overlay::new().unwrap();
        overlay.authorize("1", "KEY1").unwrap();
        assert_eq!(overlay.authorized_pubkey("1"), Some("KEY1"));
        assert_eq!(
            overlay.authorize("1", "KEY2").unwrap_err().class(),
            Errno::Exists
        );
        assert!(overlay.authorize("2", "").is_err());
    }

    #[test]
    fn distinct_keys_per_overlay() {
        let a = Overlay::new().unwrap();
        let b = Overlay::new().unwrap();
        assert_ne!(a.pubkey(), b.pubkey());
    }
}
