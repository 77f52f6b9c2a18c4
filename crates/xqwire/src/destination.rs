//! Destination URL handling.
//!
//! An endpoint is identified by its normalized destination URL: scheme and
//! authority lowercased, and an empty path written as `/`. The client and the
//! server may spell the same page differently, so both sides of every
//! comparison go through [`normalize_destination`].

use crate::error::Error;
use crate::error::Result;

const SCHEMES: [&str; 2] = ["https://", "http://"];

fn scheme_len(url: &str) -> Option<usize> {
    SCHEMES
        .iter()
        .find(|scheme| url.get(..scheme.len()).is_some_and(|p| p.eq_ignore_ascii_case(scheme)))
        .map(|scheme| scheme.len())
}

/// Splits `scheme://authority/rest` into `(scheme://authority, /rest)`.
///
/// Only `http` and `https` destinations are accepted. The origin is returned
/// lowercased; the path is returned as written and may be empty.
pub fn split_destination(url: &str) -> Result<(String, String)> {
    let bad = || Error::BadDestination(url.to_string());
    let scheme = scheme_len(url).ok_or_else(bad)?;

    let rest = &url[scheme..];
    let authority_len = rest.find(|c: char| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
    if authority_len == 0 {
        return Err(bad());
    }
    let (origin, path) = url.split_at(scheme + authority_len);
    Ok((origin.to_ascii_lowercase(), path.to_string()))
}

/// The origin part of a destination URL.
pub fn origin_of(url: &str) -> Result<String> {
    split_destination(url).map(|(origin, _)| origin)
}

/// The canonical spelling of a destination URL.
pub fn normalize_destination(url: &str) -> Result<String> {
    let (origin, path) = split_destination(url)?;
    if path.starts_with('/') {
        Ok(origin + &path)
    } else {
        Ok(format!("{}/{}", origin, path))
    }
}
