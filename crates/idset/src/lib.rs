//! Sorted sets of non-negative integers with a compact textual form.
//!
//! An [`IdSet`] holds ids in `[0, universe)` where the universe is a power
//! of two that grows on demand.  Mutation and ordered queries are
//! O(log m) in the universe bit width, backed by a layered bitmap
//! (see [`veb`]).  The textual codec collapses consecutive runs
//! (`"2,3,4,8"` encodes as `"2-4,8"` in ranged form).

mod decode;
mod encode;
mod set;
mod veb;

pub use set::{IdSet, IdSetIter, INVALID_ID};

/// Allow the universe to grow when an out-of-range id is set.
pub const AUTOGROW: u32 = 1;
/// Encode non-singleton sets wrapped in brackets.
pub const BRACKETS: u32 = 2;
/// Encode consecutive runs as `lo-hi` ranges.
pub const RANGE: u32 = 4;
/// Start with every id in `[0, universe)` as a member.
pub const INITFULL: u32 = 8;
/// Skip count bookkeeping on mutation; `count()` pays by iterating.
pub const COUNT_LAZY: u32 = 16;
/// `alloc()` resumes scanning after the last allocated id.
pub const ALLOC_RR: u32 = 32;

pub(crate) const CREATE_FLAGS: u32 = AUTOGROW | INITFULL | COUNT_LAZY | ALLOC_RR;
pub(crate) const ENCODE_FLAGS: u32 = BRACKETS | RANGE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdSetError {
    #[error("invalid argument")]
    Invalid,
    #[error("id is already present")]
    Exists,
    #[error("{0}")]
    Decode(String),
}

pub(crate) fn validate_flags(flags: u32, allowed: u32) -> Result<(), IdSetError> {
    if flags & allowed != flags {
        return Err(IdSetError::Invalid);
    }
    Ok(())
}
