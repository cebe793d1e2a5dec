use std::fmt::Write as _;

use crate::set::IdSet;
use crate::{BRACKETS, ENCODE_FLAGS, IdSetError, RANGE, validate_flags};

fn push_range(out: &mut String, lo: u32, hi: u32) {
    if !out.is_empty() && !out.ends_with('[') {
        out.push(',');
    }
    if lo == hi {
        let _ = write!(out, "{lo}");
    } else {
        let _ = write!(out, "{lo}-{hi}");
    }
}

fn encode_ranged(set: &IdSet, out: &mut String) -> usize {
    let mut count = 0;
    let mut run: Option<(u32, u32)> = None;
    for id in set.iter() {
        count += 1;
        match run {
            Some((lo, hi)) if id == hi + 1 => run = Some((lo, id)),
            Some((lo, hi)) => {
                push_range(out, lo, hi);
                run = Some((id, id));
            }
            None => run = Some((id, id)),
        }
    }
    if let Some((lo, hi)) = run {
        push_range(out, lo, hi);
    }
    count
}

fn encode_simple(set: &IdSet, out: &mut String) -> usize {
    let mut count = 0;
    for id in set.iter() {
        push_range(out, id, id);
        count += 1;
    }
    count
}

impl IdSet {
    /// Encode to the textual form.  `flags` may include [`crate::RANGE`]
    /// (collapse consecutive runs to `lo-hi`) and [`crate::BRACKETS`]
    /// (wrap non-singleton sets in brackets).  The empty set encodes to
    /// an empty string.
    pub fn encode(&self, flags: u32) -> Result<String, IdSetError> {
        validate_flags(flags, ENCODE_FLAGS)?;
        let mut out = String::new();
        if flags & BRACKETS != 0 {
            out.push('[');
        }
        let count = if flags & RANGE != 0 {
            encode_ranged(self, &mut out)
        } else {
            encode_simple(self, &mut out)
        };
        if flags & BRACKETS != 0 {
            if count > 1 {
                out.push(']');
            } else {
                // no brackets around singletons or the empty set
                out.remove(0);
            }
        }
        Ok(out)
    }
}
