use crate::veb::Veb;
use crate::{
    ALLOC_RR, AUTOGROW, COUNT_LAZY, CREATE_FLAGS, IdSetError, INITFULL, validate_flags,
};

/// Sentinel marking an unusable id.  Ids at or above this value are
/// rejected by every mutating operation.
pub const INVALID_ID: u32 = u32::MAX - 1;

const DEFAULT_SIZE: usize = 32;

pub(crate) fn valid_id(id: u32) -> bool {
    id < INVALID_ID
}

/// An internally sorted set of non-negative integers.
#[derive(Debug, Clone)]
pub struct IdSet {
    veb: Veb,
    flags: u32,
    count: usize,
    alloc_rr_last: Option<u32>,
}

impl Default for IdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSet {
    /// An empty set of the default universe size, growable.
    pub fn new() -> Self {
        Self::with_flags(0, AUTOGROW).unwrap()
    }

    /// Create a set with an initial universe size (0 selects a default)
    /// and creation flags, a subset of
    /// `AUTOGROW | INITFULL | COUNT_LAZY | ALLOC_RR`.
    pub fn with_flags(size: usize, flags: u32) -> Result<Self, IdSetError> {
        validate_flags(flags, CREATE_FLAGS)?;
        let size = if size == 0 { DEFAULT_SIZE } else { size };
        let full = flags & INITFULL != 0;
        let veb = Veb::new(size, full);
        let count = if full { veb.universe() } else { 0 };
        Ok(Self {
            veb,
            flags,
            count,
            alloc_rr_last: None,
        })
    }

    pub fn universe_size(&self) -> usize {
        self.veb.universe()
    }

    fn grow(&mut self, size: usize) -> Result<(), IdSetError> {
        if size <= self.universe_size() {
            return Ok(());
        }
        if self.flags & AUTOGROW == 0 {
            return Err(IdSetError::Invalid);
        }
        let old = self.universe_size();
        let fill = self.flags & INITFULL != 0;
        self.veb.grow(size, fill);
        if fill {
            self.count += self.universe_size() - old;
        }
        Ok(())
    }

    /// Constant-time check that `id` is definitely not a member.  A false
    /// result is indeterminate.  Saves a log-universe probe when ids are
    /// appended in order, as the decoder does.
    fn nonmember_fast(&self, id: usize) -> bool {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => id < first as usize || id > last as usize,
            _ => true,
        }
    }

    fn put(&mut self, id: usize) {
        if self.flags & COUNT_LAZY != 0 || self.nonmember_fast(id) || !self.veb.test(id) {
            self.count += 1;
            self.veb.put(id);
        }
    }

    fn put_nocheck(&mut self, id: usize) {
        self.count += 1;
        self.veb.put(id);
    }

    fn del(&mut self, id: usize) {
        if self.flags & COUNT_LAZY != 0 || (!self.nonmember_fast(id) && self.veb.test(id)) {
            // the count is garbage under COUNT_LAZY; keep it from wrapping
            self.count = self.count.saturating_sub(1);
            self.veb.del(id);
        }
    }

    fn del_nocheck(&mut self, id: usize) {
        self.count = self.count.saturating_sub(1);
        self.veb.del(id);
    }

    /// Add `id` to the set, growing the universe when AUTOGROW allows.
    /// On an INITFULL set, setting an out-of-range id is a successful
    /// no-op rather than a reason to grow.
    pub fn set(&mut self, id: u32) -> Result<(), IdSetError> {
        if !valid_id(id) {
            return Err(IdSetError::Invalid);
        }
        let id = id as usize;
        if id >= self.universe_size() {
            if self.flags & INITFULL != 0 {
                return Ok(());
            }
            self.grow(id + 1)?;
            self.put_nocheck(id);
        } else {
            self.put(id);
        }
        Ok(())
    }

    /// Add the closed range `[lo, hi]`; a reversed range is normalized.
    pub fn range_set(&mut self, lo: u32, hi: u32) -> Result<(), IdSetError> {
        if !valid_id(lo) || !valid_id(hi) {
            return Err(IdSetError::Invalid);
        }
        let (lo, hi) = if hi < lo { (hi, lo) } else { (lo, hi) };
        let old_size = self.universe_size();
        if self.flags & INITFULL == 0 {
            self.grow(hi as usize + 1)?;
        }
        for id in lo..=hi {
            let id = id as usize;
            if id >= old_size {
                if self.flags & INITFULL != 0 {
                    return Ok(());
                }
                self.put_nocheck(id);
            } else {
                self.put(id);
            }
        }
        Ok(())
    }

    /// Remove `id`.  Removing a non-member is not an error.
    pub fn clear(&mut self, id: u32) -> Result<(), IdSetError> {
        if !valid_id(id) {
            return Err(IdSetError::Invalid);
        }
        let id = id as usize;
        if id >= self.universe_size() {
            if self.flags & INITFULL == 0 {
                return Ok(());
            }
            self.grow(id + 1)?;
            self.del_nocheck(id);
        } else {
            self.del(id);
        }
        Ok(())
    }

    /// Remove the closed range `[lo, hi]`; a reversed range is normalized.
    pub fn range_clear(&mut self, lo: u32, hi: u32) -> Result<(), IdSetError> {
        if !valid_id(lo) || !valid_id(hi) {
            return Err(IdSetError::Invalid);
        }
        let (lo, hi) = if hi < lo { (hi, lo) } else { (lo, hi) };
        let old_size = self.universe_size();
        if self.flags & INITFULL != 0 {
            self.grow(hi as usize + 1)?;
        }
        for id in lo..=hi {
            let id = id as usize;
            if id >= old_size {
                if self.flags & INITFULL == 0 {
                    return Ok(());
                }
                self.del_nocheck(id);
            } else {
                self.del(id);
            }
        }
        Ok(())
    }

    /// Membership test; false for invalid or out-of-range ids.
    pub fn test(&self, id: u32) -> bool {
        valid_id(id) && self.veb.test(id as usize)
    }

    pub fn first(&self) -> Option<u32> {
        self.veb.succ(0).map(|id| id as u32)
    }

    pub fn next(&self, id: u32) -> Option<u32> {
        self.veb.succ(id as usize + 1).map(|id| id as u32)
    }

    pub fn last(&self) -> Option<u32> {
        self.veb
            .pred(self.universe_size() - 1)
            .map(|id| id as u32)
    }

    pub fn prev(&self, id: u32) -> Option<u32> {
        if id == 0 {
            return None;
        }
        self.veb.pred(id as usize - 1).map(|id| id as u32)
    }

    /// Number of members.  Under COUNT_LAZY the maintained count is not
    /// trusted and the set is iterated instead.
    pub fn count(&self) -> usize {
        if self.flags & COUNT_LAZY == 0 {
            return self.count;
        }
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }

    pub fn iter(&self) -> IdSetIter<'_> {
        IdSetIter {
            set: self,
            next: self.first(),
        }
    }

    fn copy_with_flags(&self, flags: u32) -> IdSet {
        let mut cpy = self.clone();
        if self.flags & COUNT_LAZY != 0 && flags & COUNT_LAZY == 0 {
            cpy.count = self.iter().count();
        }
        cpy.flags = flags;
        cpy
    }

    /// Add every member of `other` to `self`.
    pub fn add(&mut self, other: &IdSet) -> Result<(), IdSetError> {
        for id in other.iter() {
            self.set(id)?;
        }
        Ok(())
    }

    /// Remove every member of `other` from `self`.
    pub fn subtract(&mut self, other: &IdSet) -> Result<(), IdSetError> {
        for id in other.iter() {
            self.clear(id)?;
        }
        Ok(())
    }

    pub fn union(&self, other: &IdSet) -> Result<IdSet, IdSetError> {
        let mut result = self.copy_with_flags(AUTOGROW);
        result.add(other)?;
        Ok(result)
    }

    pub fn difference(&self, other: &IdSet) -> Result<IdSet, IdSetError> {
        let mut result = self.copy_with_flags(self.flags);
        result.subtract(other)?;
        Ok(result)
    }

    pub fn intersect(&self, other: &IdSet) -> Result<IdSet, IdSetError> {
        // Start from the smaller set when counts are cheap.
        let (a, b) = if self.flags & COUNT_LAZY == 0
            && other.flags & COUNT_LAZY == 0
            && other.count() < self.count()
        {
            (other, self)
        } else {
            (self, other)
        };
        let mut result = a.copy_with_flags(a.flags);
        for id in a.iter() {
            if !b.test(id) {
                result.clear(id)?;
            }
        }
        Ok(result)
    }

    pub fn has_intersection(&self, other: &IdSet) -> bool {
        let (a, b) = if self.flags & COUNT_LAZY == 0
            && other.flags & COUNT_LAZY == 0
            && self.count() < other.count()
        {
            (other, self)
        } else {
            (self, other)
        };
        b.iter().any(|id| a.test(id))
    }

    pub fn equal(&self, other: &IdSet) -> bool {
        let mut count_checked = false;
        if self.flags & COUNT_LAZY == 0 && other.flags & COUNT_LAZY == 0 {
            if self.count() != other.count() {
                return false;
            }
            count_checked = true;
        }
        for id in self.iter() {
            if !other.test(id) {
                return false;
            }
        }
        if count_checked {
            return true;
        }
        for id in other.iter() {
            if !self.test(id) {
                return false;
            }
        }
        true
    }

    /// Pop the smallest free id of an INITFULL set, growing the universe
    /// when exhausted.  With ALLOC_RR, scanning resumes after the id
    /// returned by the previous call.
    pub fn alloc(&mut self) -> Result<u32, IdSetError> {
        if self.flags & INITFULL == 0 {
            return Err(IdSetError::Invalid);
        }
        let mut id = None;
        if self.flags & ALLOC_RR != 0 {
            if let Some(last) = self.alloc_rr_last {
                id = self.next(last);
            }
        }
        if id.is_none() {
            id = self.first();
        }
        let id = match id {
            Some(id) => id,
            None => {
                let next = self.universe_size();
                self.grow(next + 1)?;
                next as u32
            }
        };
        // id is known to be a member at this point
        self.del_nocheck(id as usize);
        if self.flags & ALLOC_RR != 0 {
            self.alloc_rr_last = Some(id);
        }
        Ok(id)
    }

    /// Return an id to an INITFULL set, ignoring invalid or out-of-range
    /// ids.  Does not catch double-frees; see [`IdSet::free_check`].
    pub fn free(&mut self, id: u32) {
        if self.flags & INITFULL == 0 || !valid_id(id) {
            return;
        }
        let id = id as usize;
        if id >= self.universe_size() {
            return;
        }
        self.put(id);
    }

    /// Like [`IdSet::free`] but fails with `Exists` if the id is already
    /// in the set.
    pub fn free_check(&mut self, id: u32) -> Result<(), IdSetError> {
        if self.flags & INITFULL == 0
            || !valid_id(id)
            || id as usize >= self.universe_size()
        {
            return Err(IdSetError::Invalid);
        }
        if self.test(id) {
            return Err(IdSetError::Exists);
        }
        self.put_nocheck(id as usize);
        Ok(())
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl std::fmt::Display for IdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.encode(crate::RANGE) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

pub struct IdSetIter<'a> {
    set: &'a IdSet,
    next: Option<u32>,
}

impl Iterator for IdSetIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let id = self.next?;
        self.next = self.set.next(id);
        Some(id)
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = IdSet::new();
        for id in iter {
            // out-of-range ids cannot occur: the set is growable
            let _ = set.set(id);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ALLOC_RR, COUNT_LAZY, INITFULL};

    #[test]
    fn create_rejects_unknown_flags() {
        assert_eq!(IdSet::with_flags(0, 0x1000).unwrap_err(), IdSetError::Invalid);
        assert_eq!(
            IdSet::with_flags(0, crate::BRACKETS).unwrap_err(),
            IdSetError::Invalid
        );
    }

    #[test]
    fn set_clear_test() {
        let mut ids = IdSet::with_flags(64, 0).unwrap();
        ids.set(3).unwrap();
        ids.set(3).unwrap();
        assert!(ids.test(3));
        assert_eq!(ids.count(), 1);
        assert!(!ids.test(4));
        assert!(!ids.test(INVALID_ID));
        assert_eq!(ids.set(u32::MAX).unwrap_err(), IdSetError::Invalid);

        ids.clear(3).unwrap();
        ids.clear(3).unwrap();
        assert_eq!(ids.count(), 0);
        // out of range clear is a no-op on a non-INITFULL set
        ids.clear(1 << 20).unwrap();
    }

    #[test]
    fn autogrow() {
        let mut fixed = IdSet::with_flags(64, 0).unwrap();
        assert_eq!(fixed.set(64).unwrap_err(), IdSetError::Invalid);

        let mut ids = IdSet::with_flags(64, AUTOGROW).unwrap();
        ids.set(4000).unwrap();
        assert!(ids.universe_size() >= 4001);
        assert!(ids.test(4000));
        assert_eq!(ids.count(), 1);
    }

    #[test]
    fn ordered_iteration() {
        let mut ids = IdSet::new();
        ids.range_set(10, 7).unwrap(); // reversed, normalized
        ids.set(100).unwrap();
        let v: Vec<u32> = ids.iter().collect();
        assert_eq!(v, vec![7, 8, 9, 10, 100]);
        assert_eq!(ids.first(), Some(7));
        assert_eq!(ids.last(), Some(100));
        assert_eq!(ids.next(10), Some(100));
        assert_eq!(ids.prev(100), Some(10));
        assert_eq!(ids.prev(7), None);
    }

    #[test]
    fn initfull_starts_full() {
        let ids = IdSet::with_flags(128, INITFULL).unwrap();
        assert_eq!(ids.count(), 128);
        assert!(ids.test(0));
        assert!(ids.test(127));
        assert!(!ids.test(128));
    }

    #[test]
    fn initfull_out_of_range_rules() {
        let mut ids = IdSet::with_flags(64, INITFULL | AUTOGROW).unwrap();
        // set out of range is a no-op, not a grow
        ids.set(100).unwrap();
        assert_eq!(ids.universe_size(), 64);
        // clear out of range grows so the id stays absent afterwards
        ids.clear(100).unwrap();
        assert!(ids.universe_size() > 100);
        assert!(!ids.test(100));
        assert!(ids.test(99));
    }

    #[test]
    fn count_lazy_pays_on_read() {
        let mut ids = IdSet::with_flags(64, COUNT_LAZY).unwrap();
        ids.set(1).unwrap();
        ids.set(1).unwrap();
        ids.set(2).unwrap();
        ids.clear(5).unwrap();
        assert_eq!(ids.count(), 2);
    }

    #[test]
    fn set_algebra_laws() {
        let a: IdSet = [1u32, 2, 3, 10, 11].into_iter().collect();
        let b: IdSet = [3u32, 4, 10, 20].into_iter().collect();

        let u = a.union(&b).unwrap();
        let i = a.intersect(&b).unwrap();
        let d = a.difference(&b).unwrap();

        for id in a.iter() {
            assert!(u.test(id));
        }
        for id in b.iter() {
            assert!(u.test(id));
        }
        for id in i.iter() {
            assert!(a.test(id) && b.test(id));
        }
        for id in d.iter() {
            assert!(!b.test(id));
        }
        assert_eq!(u.count() + i.count(), a.count() + b.count());
        assert!(a.has_intersection(&b));

        let disjoint: IdSet = [100u32, 101].into_iter().collect();
        assert!(!a.has_intersection(&disjoint));
    }

    #[test]
    fn equality() {
        let a: IdSet = [1u32, 5, 9].into_iter().collect();
        let b: IdSet = [1u32, 5, 9].into_iter().collect();
        let c: IdSet = [1u32, 5].into_iter().collect();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut lazy = IdSet::with_flags(64, COUNT_LAZY).unwrap();
        for id in [1u32, 5, 9] {
            lazy.set(id).unwrap();
        }
        assert!(a.equal(&lazy));
        assert!(lazy.equal(&a));
    }

    #[test]
    fn alloc_and_free() {
        let mut pool = IdSet::with_flags(4, INITFULL | AUTOGROW).unwrap();
        let a = pool.alloc().unwrap();
        assert_eq!(a, 0);
        assert!(!pool.test(a));
        let b = pool.alloc().unwrap();
        assert_eq!(b, 1);
        pool.free(a);
        assert_eq!(pool.alloc().unwrap(), 0);

        pool.free(b);
        pool.free_check(0).unwrap();
        assert_eq!(pool.free_check(0).unwrap_err(), IdSetError::Exists);
    }

    #[test]
    fn alloc_grows_when_exhausted() {
        let mut pool = IdSet::with_flags(64, INITFULL | AUTOGROW).unwrap();
        for want in 0..200u32 {
            assert_eq!(pool.alloc().unwrap(), want);
        }
    }

    #[test]
    fn alloc_round_robin() {
        let mut pool = IdSet::with_flags(64, INITFULL | AUTOGROW | ALLOC_RR).unwrap();
        assert_eq!(pool.alloc().unwrap(), 0);
        assert_eq!(pool.alloc().unwrap(), 1);
        pool.free(0);
        // round-robin continues past the freed id
        assert_eq!(pool.alloc().unwrap(), 2);
    }
}
