//! HTTP byte-range parsing (RFC 2616 §14.35, plus `If-Range`).
//!
//! Grounded on `ParseRange` in `fastpath.c`: a hand-rolled digit-by-digit
//! scanner rather than a combinator parser, because the original's error
//! policy is unusual enough (malformed syntax silently degrades to "serve
//! the whole file", only an unsatisfiable range produces 416) that it's
//! easier to track state explicitly than to bolt that policy onto a generic
//! parser combinator.

use std::time::SystemTime;

/// `NS_CONN_MAXBUFS / 3` in the original; that constant isn't itself in the
/// retrieved source, so this is a concrete standalone choice: enough ranges
/// for any normal request, still bounded so a client can't force an
/// unbounded iovec array.
pub const MAX_RANGES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOffset {
    pub start: u64,
    pub end: u64,
}

impl RangeOffset {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    /// No `Range` header, or the header was present but unparseable —
    /// serve the whole entity.
    None,
    /// One or more ranges accepted.
    Ok,
    /// Every requested range started at or past the end of the file.
    Unsatisfiable,
}

#[derive(Debug, Clone)]
pub struct RangeSet {
    pub status: RangeStatus,
    pub offsets: Vec<RangeOffset>,
}

impl RangeSet {
    fn whole_file() -> Self {
        RangeSet { status: RangeStatus::None, offsets: Vec::new() }
    }

    fn unsatisfiable() -> Self {
        RangeSet { status: RangeStatus::Unsatisfiable, offsets: Vec::new() }
    }
}

enum SpecResult {
    Accepted(RangeOffset),
    /// Syntactically fine but `start >= file_size`.
    TooFar,
    /// Couldn't parse as a range spec at all.
    Malformed,
}

/// Parses one `N-M` / `N-` / `-K` spec against `file_size`. A spec that
/// starts at or past the end of the file is reported as `TooFar` rather
/// than dropped silently, so the caller can tell "every spec missed" (416)
/// apart from "header wasn't a range at all" (200, whole file) — the same
/// distinction the original draws between `Ns_ConnReturnStatus(416)` and
/// falling through to a normal response.
fn parse_one_spec(spec: &str, file_size: u64) -> SpecResult {
    let spec = spec.trim();
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return SpecResult::Malformed;
    };

    if start_str.is_empty() {
        // "-K": last K bytes. K == 0 yields start == file_size, which falls
        // through to the same "past the end" rejection as any other spec.
        let Ok(suffix_len) = end_str.parse::<u64>() else {
            return SpecResult::Malformed;
        };
        let start = file_size.saturating_sub(suffix_len);
        if start >= file_size {
            return SpecResult::TooFar;
        }
        return SpecResult::Accepted(RangeOffset { start, end: file_size.saturating_sub(1) });
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return SpecResult::Malformed;
    };
    if start >= file_size {
        return SpecResult::TooFar;
    }

    let end: u64 = if end_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        let Ok(raw_end) = end_str.parse::<u64>() else {
            return SpecResult::Malformed;
        };
        raw_end.min(file_size.saturating_sub(1))
    };

    if end < start {
        return SpecResult::Malformed;
    }

    SpecResult::Accepted(RangeOffset { start, end })
}

/// Folds a newly parsed range into the accepted list, coalescing it into
/// the previous entry when they touch or overlap. The adjacency test
/// mirrors the original's `thisPtr->start > prevPtr->end + 1` /
/// `thisPtr->end < prevPtr->start - 1` pair; `saturating_sub` reproduces
/// its behavior when `prev.start == 0` (the original's unsigned subtraction
/// wraps there, which in practice means "never treat this as separate").
fn accumulate(accepted: &mut Vec<RangeOffset>, next: RangeOffset) {
    if let Some(prev) = accepted.last_mut() {
        let separate = next.start > prev.end + 1 || next.end < prev.start.saturating_sub(1);
        if !separate {
            prev.start = prev.start.min(next.start);
            prev.end = prev.end.max(next.end);
            return;
        }
    }
    accepted.push(next);
}

/// Parses a `Range` header against `file_size` / `file_mtime`, honoring an
/// optional `If-Range` validator. `if_range_time` is `None` when the header
/// was absent or wasn't a valid HTTP-date (treated as "no If-Range").
///
/// Tie-break deliberately kept from the original: the comparison is
/// `file_mtime > if_range_time` (strictly greater). Equal timestamps honor
/// the `Range` header rather than falling back to the whole file.
pub fn parse_range(
    header: Option<&str>,
    if_range_time: Option<SystemTime>,
    file_size: u64,
    file_mtime: SystemTime,
) -> RangeSet {
    let Some(header) = header else {
        return RangeSet::whole_file();
    };

    if let Some(validator) = if_range_time {
        if file_mtime > validator {
            return RangeSet::whole_file();
        }
    }

    let Some(spec_list) = header.strip_prefix("bytes=") else {
        return RangeSet::whole_file();
    };

    if file_size == 0 {
        return RangeSet::whole_file();
    }

    let mut accepted = Vec::new();
    let mut any_spec = false;

    for raw_spec in spec_list.split(',') {
        let raw_spec = raw_spec.trim();
        if raw_spec.is_empty() {
            continue;
        }
        any_spec = true;

        match parse_one_spec(raw_spec, file_size) {
            SpecResult::Accepted(offset) => {
                if accepted.len() < MAX_RANGES - 1 {
                    accumulate(&mut accepted, offset);
                }
            }
            // One spec past the end of the file aborts the whole reply,
            // discarding anything already accepted — matches the original
            // bailing out of its accumulation loop the instant it sees one.
            SpecResult::TooFar => return RangeSet::unsatisfiable(),
            SpecResult::Malformed => {}
        }
    }

    if !any_spec {
        return RangeSet::whole_file();
    }

    if accepted.is_empty() {
        return RangeSet::whole_file();
    }

    RangeSet { status: RangeStatus::Ok, offsets: accepted }
}
