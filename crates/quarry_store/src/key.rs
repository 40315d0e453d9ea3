//! Repository key encoding.
//!
//! A key is the URL-safe wire and on-disk form of (vcsType, clone URL):
//! `<vcsType>/<scheme>/<userinfo@host>/<cleaned path without leading slash>`.
//! One function encodes, one decodes; `decode(encode(x)) == x` modulo path
//! cleanup. The key doubles as the clone directory path relative to the
//! storage root, so path cleanup also rejects anything that would escape it.

use crate::StoreError;

/// Minimum `/`-separated parts of a well-formed key: vcs, scheme, host and
/// at least one path segment.
pub const MIN_KEY_PARTS: usize = 4;

/// Encode (vcsType, cloneURL) into a repository key.
pub fn encode_key(vcs: &str, clone_url: &str) -> Result<String, StoreError> {
    validate_vcs(vcs)?;
    let (scheme, userinfo, host, path) = split_url(clone_url)?;
    let path = clean_path(&path)?;
    match userinfo {
        Some(userinfo) => Ok(format!("{vcs}/{scheme}/{userinfo}@{host}/{path}")),
        None => Ok(format!("{vcs}/{scheme}/{host}/{path}")),
    }
}

/// Decode a repository key back into (vcsType, cloneURL).
pub fn decode_key(key: &str) -> Result<(String, String), StoreError> {
    let key = key.trim_matches('/');
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < MIN_KEY_PARTS || parts.iter().any(|part| part.is_empty()) {
        return Err(StoreError::InvalidKey(format!(
            "{key:?}: expected at least {MIN_KEY_PARTS} segments"
        )));
    }
    let vcs = parts[0];
    validate_vcs(vcs)?;
    let scheme = parts[1];
    let hostpart = parts[2];
    if scheme.is_empty() || hostpart.is_empty() || hostpart.ends_with('@') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let host = hostpart.rsplit('@').next().unwrap_or_default();
    if host.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let path = clean_path(&parts[3..].join("/"))?;
    Ok((vcs.to_string(), format!("{scheme}://{hostpart}/{path}")))
}

fn validate_vcs(vcs: &str) -> Result<(), StoreError> {
    if vcs.is_empty() || !vcs.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(StoreError::UnsupportedVcs(vcs.to_string()));
    }
    Ok(())
}

/// Split a clone URL into (scheme, userinfo, host, path).
fn split_url(clone_url: &str) -> Result<(String, Option<String>, String, String), StoreError> {
    let Some((scheme, rest)) = clone_url.split_once("://") else {
        return Err(StoreError::InvalidKey(format!(
            "{clone_url:?}: missing scheme"
        )));
    };
    if scheme.is_empty()
        || !scheme
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
    {
        return Err(StoreError::InvalidKey(format!(
            "{clone_url:?}: bad scheme"
        )));
    }
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path.to_string()),
        None => (rest, String::new()),
    };
    let (userinfo, host) = match authority.rsplit_once('@') {
        Some((userinfo, host)) if !userinfo.is_empty() => {
            (Some(userinfo.to_string()), host.to_string())
        }
        Some((_, host)) => (None, host.to_string()),
        None => (None, authority.to_string()),
    };
    if host.is_empty() {
        return Err(StoreError::InvalidKey(format!(
            "{clone_url:?}: missing host"
        )));
    }
    Ok((scheme.to_string(), userinfo, host, path))
}

/// Drop empty and `.` segments and reject `..`, which would escape the
/// storage root. The cleaned path must keep at least one segment.
fn clean_path(path: &str) -> Result<String, StoreError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(StoreError::InvalidKey(format!(
                    "{path:?}: path escapes storage root"
                )))
            }
            segment => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(StoreError::InvalidKey(format!("{path:?}: empty path")));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_produces_the_wire_form() {
        assert_eq!(
            encode_key("git", "http://example.com/a/b").expect("encode"),
            "git/http/example.com/a/b"
        );
        assert_eq!(
            encode_key("hg", "https://alice@code.example.com/repo").expect("encode"),
            "hg/https/alice@code.example.com/repo"
        );
    }

    #[test]
    fn encode_cleans_paths() {
        assert_eq!(
            encode_key("git", "http://example.com//a/./b/").expect("encode"),
            "git/http/example.com/a/b"
        );
    }

    #[test]
    fn encode_rejects_invalid_inputs() {
        for (vcs, url) in [
            ("", "http://example.com/a"),
            ("g1t", "http://example.com/a"),
            ("git", "example.com/a"),
            ("git", "http:///a"),
            ("git", "http://example.com"),
            ("git", "http://example.com/.."),
            ("git", "http://example.com/a/../../etc"),
        ] {
            assert!(encode_key(vcs, url).is_err(), "{vcs} {url}");
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let key = encode_key("git", "http://alice@example.com/a/b").expect("encode");
        let (vcs, url) = decode_key(&key).expect("decode");
        assert_eq!(vcs, "git");
        assert_eq!(url, "http://alice@example.com/a/b");
    }

    #[test]
    fn decode_rejects_short_or_malformed_keys() {
        for key in [
            "",
            "git",
            "git/http",
            "git/http/example.com",
            "git//example.com/a",
            "git/http/@/a",
            "git/http/example.com/../a",
        ] {
            assert!(decode_key(key).is_err(), "{key:?}");
        }
    }

    #[test]
    fn decode_tolerates_surrounding_slashes() {
        let (vcs, url) = decode_key("/git/http/example.com/a/").expect("decode");
        assert_eq!(vcs, "git");
        assert_eq!(url, "http://example.com/a");
    }

    proptest! {
        #[test]
        fn round_trip_for_valid_inputs(
            vcs in "[a-z]{1,8}",
            scheme in prop::sample::select(vec!["http", "https", "git", "ssh"]),
            userinfo in prop::option::of("[a-z0-9]{1,8}"),
            host in "[a-z][a-z0-9.-]{0,15}",
            segments in prop::collection::vec("[a-zA-Z0-9_.-]{1,12}", 1..5),
        ) {
            prop_assume!(segments.iter().all(|seg| seg != "." && seg != ".."));
            let authority = match &userinfo {
                Some(userinfo) => format!("{userinfo}@{host}"),
                None => host.clone(),
            };
            let url = format!("{scheme}://{authority}/{}", segments.join("/"));
            let key = encode_key(&vcs, &url).expect("encode");
            let (decoded_vcs, decoded_url) = decode_key(&key).expect("decode");
            prop_assert_eq!(decoded_vcs, vcs);
            prop_assert_eq!(decoded_url, url);
        }
    }
}
