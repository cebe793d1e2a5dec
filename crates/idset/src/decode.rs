use crate::set::{IdSet, valid_id};
use crate::{AUTOGROW, IdSetError};

/// Parse one decimal number with the decoder's strictness: base 10 only,
/// no sign, no leading zeros.
fn parse_number(s: &str) -> Result<u32, IdSetError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdSetError::Decode(format!("error parsing range '{s}'")));
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(IdSetError::Decode(format!(
            "leading zero in element '{s}'"
        )));
    }
    let n: u32 = s
        .parse()
        .map_err(|_| IdSetError::Decode(format!("element '{s}' is out of range")))?;
    if !valid_id(n) {
        return Err(IdSetError::Decode(format!("element '{s}' is out of range")));
    }
    Ok(n)
}

/// Parse a single element: `N` or `LO-HI` with `LO <= HI`.
fn parse_range(s: &str) -> Result<(u32, u32), IdSetError> {
    match s.split_once('-') {
        None => {
            let n = parse_number(s)?;
            Ok((n, n))
        }
        Some((lo, hi)) => {
            let lo = parse_number(lo)?;
            let hi = parse_number(hi)?;
            if hi < lo {
                return Err(IdSetError::Decode(format!(
                    "range '{s}' is descending"
                )));
            }
            Ok((lo, hi))
        }
    }
}

/// Strip at most one outer bracket pair; any bracket remaining after
/// that is an error.
fn trim_brackets(s: &str) -> Result<&str, IdSetError> {
    let trimmed = if s.len() >= 2 && s.starts_with('[') && s.ends_with(']') {
        &s[1..s.len() - 1]
    } else {
        s
    };
    if trimmed.contains('[') || trimmed.contains(']') {
        return Err(IdSetError::Decode(
            "mismatched or nested brackets".to_string(),
        ));
    }
    Ok(trimmed)
}

impl IdSet {
    /// Decode the textual form.  Elements must ascend; overlapping or
    /// duplicate elements are rejected.  The empty string decodes to the
    /// empty set.
    pub fn decode(s: &str) -> Result<IdSet, IdSetError> {
        let body = trim_brackets(s)?;
        let mut set = IdSet::with_flags(0, AUTOGROW)?;
        let mut maxid: Option<u32> = None;
        for tok in body.split(',').filter(|tok| !tok.is_empty()) {
            let (lo, hi) = parse_range(tok)?;
            if let Some(max) = maxid {
                if lo <= max {
                    return Err(IdSetError::Decode(format!(
                        "range '{tok}' is out of order"
                    )));
                }
            }
            set.range_set(lo, hi)?;
            maxid = Some(hi);
        }
        Ok(set)
    }
}

impl std::str::FromStr for IdSet {
    type Err = IdSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IdSet::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RANGE;

    #[test]
    fn basic_forms() {
        let set = IdSet::decode("1,2,3,7-9,12").unwrap();
        let v: Vec<u32> = set.iter().collect();
        assert_eq!(v, vec![1, 2, 3, 7, 8, 9, 12]);
        assert_eq!(set.encode(RANGE).unwrap(), "1-3,7-9,12");

        assert_eq!(IdSet::decode("").unwrap().count(), 0);
        assert_eq!(IdSet::decode("[2-4]").unwrap().count(), 3);
        assert_eq!(IdSet::decode("0").unwrap().first(), Some(0));
        // a singleton range is accepted
        assert_eq!(IdSet::decode("5-5").unwrap().count(), 1);
    }

    #[test]
    fn round_trip() {
        for s in ["", "0", "0-1048575", "3,6-9,42,100-200", "1,3,5,7,9"] {
            let set = IdSet::decode(s).unwrap();
            assert_eq!(
                IdSet::decode(&set.encode(RANGE).unwrap()).unwrap(),
                set,
                "ranged round trip of {s:?}"
            );
            assert_eq!(
                IdSet::decode(&set.encode(0).unwrap()).unwrap(),
                set,
                "simple round trip of {s:?}"
            );
        }
    }

    #[test]
    fn rejects_malformed() {
        for s in [
            "x", "1,x", "1-", "-5", "4-2", "1,1", "2,1", "1-5,3", "01", "0x1",
            "1.5", "[1,2", "1,2]", "[[1,2]]", "[1,[2]]", " 1", "+1",
        ] {
            assert!(IdSet::decode(s).is_err(), "expected {s:?} to be rejected");
        }
    }

    #[test]
    fn rejects_out_of_range_ids() {
        assert!(IdSet::decode(&format!("{}", u32::MAX)).is_err());
        assert!(IdSet::decode(&format!("{}", u32::MAX - 1)).is_err());
        assert!(IdSet::decode("4294967296").is_err());
    }
}
