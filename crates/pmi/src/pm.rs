use async_trait::async_trait;

use canopy_core::Error;

/// Identity handed to a broker by its process manager.
#[derive(Debug, Clone)]
pub struct PmInfo {
    pub rank: u32,
    pub size: u32,
    /// Instance name (the enclosing job id when launched by a parent
    /// instance).
    pub name: String,
}

/// The process-manager bulletin board every broker is launched with.
///
/// `put`/`get` exchange small strings; `barrier` is the only collective.
/// Implementations must tolerate `get` for keys published by other ranks
/// only after a barrier has separated the put from the get.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Short method name for diagnostics ("single", "local", ...).
    fn describe(&self) -> &str;

    async fn initialize(&self) -> Result<PmInfo, Error>;
    async fn put(&self, key: &str, value: &str) -> Result<(), Error>;
    /// `rank_hint` names the rank that published the key, when known.
    async fn get(&self, key: &str, rank_hint: Option<u32>) -> Result<String, Error>;
    async fn barrier(&self) -> Result<(), Error>;
    async fn finalize(&self) -> Result<(), Error>;
    /// Declare the instance unbootable; peers see failure at the next
    /// collective.
    async fn abort(&self, msg: &str) -> Result<(), Error>;
}
