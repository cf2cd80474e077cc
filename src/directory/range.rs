//! Range-retrieval completion.
//!
//! Large multi-valued attributes arrive chunked: the server answers a
//! request for `member` with `member;range=0-999`, and the remainder must
//! be fetched explicitly until a chunk ending in `*` arrives. Records are
//! completed here, on the feed side, before they reach the store.

use super::{DirectoryClient, FeedError, RawObject};

/// A parsed `attr;range=low-high` name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangedAttr {
    pub base: String,
    pub start: u32,
    /// `None` for the final `low-*` chunk.
    pub end: Option<u32>,
}

/// Parse the range suffix, if any.
pub fn parse_range_suffix(name: &str) -> Option<RangedAttr> {
    let (base, options) = name.split_once(';')?;
    let range = options
        .split(';')
        .find_map(|opt| opt.strip_prefix("range="))?;
    let (low, high) = range.split_once('-')?;
    let start: u32 = low.parse().ok()?;
    let end = if high == "*" {
        None
    } else {
        Some(high.parse().ok()?)
    };
    Some(RangedAttr {
        base: base.to_string(),
        start,
        end,
    })
}

/// Fold every range-chunked attribute of `obj` into its full value list,
/// fetching the remaining chunks from `client`.
pub fn complete_ranged(obj: &mut RawObject, client: &dyn DirectoryClient) -> Result<(), FeedError> {
    let ranged: Vec<(String, RangedAttr)> = obj
        .attr_names()
        .filter_map(|name| parse_range_suffix(name).map(|r| (name.to_string(), r)))
        .collect();

    for (wire_name, first) in ranged {
        let mut values = obj.remove(&wire_name).unwrap_or_default();
        let mut next = first.end.map(|e| e + 1);
        while let Some(start) = next {
            let chunk = client.fetch_ranged(&obj.dn, &first.base, start)?;
            values.extend(chunk.values);
            next = chunk.end.map(|e| e + 1);
        }
        obj.set(&first.base, values);
    }
    Ok(())
}
