//! `Range` request header handling for single byte ranges.
//!
//! Accepted forms are `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`.
//! Positions in the header are inclusive; resolved windows are half-open.

use std::fmt;

/// A syntactically valid single range, not yet checked against an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`
    Bounded { first: u64, last: u64 },
    /// `bytes=a-`
    From { first: u64 },
    /// `bytes=-n`, the final `n` bytes.
    Suffix { len: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeError {
    /// Not a `bytes=` range or not parseable.
    Malformed,
    /// More than one comma-separated range.
    MultipleRanges,
    /// Well formed but outside the object.
    Unsatisfiable,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed Range header"),
            Self::MultipleRanges => f.write_str("multiple ranges are not supported"),
            Self::Unsatisfiable => f.write_str("range is not satisfiable"),
        }
    }
}

/// Half-open byte window `[start, end)` inside an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `Content-Range` value, e.g. `bytes 2-5/10`.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end.saturating_sub(1), total)
    }
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// Parse a `Range` header value like `bytes=0-1048575`.
pub fn parse_range_header(value: &str) -> Result<RangeSpec, RangeError> {
    let value = value.trim();
    let (unit, set) = value.split_once('=').ok_or(RangeError::Malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Malformed);
    }
    if set.contains(',') {
        return Err(RangeError::MultipleRanges);
    }

    let (first, last) = set.trim().split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());
    let parse = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RangeError::Malformed);
        }
        s.parse::<u64>().map_err(|_| RangeError::Malformed)
    };

    match (first.is_empty(), last.is_empty()) {
        (true, true) => Err(RangeError::Malformed),
        (true, false) => Ok(RangeSpec::Suffix { len: parse(last)? }),
        (false, true) => Ok(RangeSpec::From {
            first: parse(first)?,
        }),
        (false, false) => {
            let (first, last) = (parse(first)?, parse(last)?);
            if last < first {
                return Err(RangeError::Malformed);
            }
            Ok(RangeSpec::Bounded { first, last })
        }
    }
}

impl RangeSpec {
    /// Resolve against an object of `total` bytes.
    ///
    /// A last position past the end is clamped; a first position at or past
    /// the end, an empty suffix, or any range on an empty object is
    /// unsatisfiable.
    pub fn resolve(&self, total: u64) -> Result<ByteWindow, RangeError> {
        match *self {
            RangeSpec::Bounded { first, last } => {
                if first >= total {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(ByteWindow {
                    start: first,
                    end: last.saturating_add(1).min(total),
                })
            }
            RangeSpec::From { first } => {
                if first >= total {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(ByteWindow {
                    start: first,
                    end: total,
                })
            }
            RangeSpec::Suffix { len } => {
                if len == 0 || total == 0 {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(ByteWindow {
                    start: total.saturating_sub(len),
                    end: total,
                })
            }
        }
    }
}
