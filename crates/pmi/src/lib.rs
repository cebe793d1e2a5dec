//! Process-manager abstraction and business cards.
//!
//! During bootstrap the brokers only have the launching process manager
//! in common: a bulletin board with put/get/barrier semantics.  Each
//! broker publishes a business card (hostname, public key, bind URIs)
//! under its rank and fetches the cards of its tree neighbors through a
//! rank-indexed cache.

mod bizcache;
mod bizcard;
mod local;
mod pm;
mod single;

pub use bizcache::Bizcache;
pub use bizcard::Bizcard;
pub use local::{LocalBoard, LocalPm};
pub use pm::{PmInfo, ProcessManager};
pub use single::SinglePm;
