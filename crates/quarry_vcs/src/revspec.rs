use crate::VcsError;

/// Minimum hex length treated as an abbreviated commit id rather than a
/// branch or tag name.
const MIN_ABBREV_ID_LEN: usize = 4;

/// A parsed revision specifier.
///
/// Classification is purely syntactic; resolution decides what the token
/// actually names. A hex-shaped token that matches no commit falls back to
/// name lookup, so a branch called `cafe` still resolves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevSpec {
    /// The newest revision of the repository.
    Tip,
    /// The empty revision before all history.
    Null,
    /// A numeric revision index, oldest commit first.
    FileRevision(u64),
    /// A full or abbreviated commit id. Abbreviations matching more than
    /// one commit are an error.
    CommitId(String),
    /// A branch or tag name.
    Name(String),
}

impl RevSpec {
    pub fn parse(token: &str) -> Result<RevSpec, VcsError> {
        if token.is_empty() {
            return Err(VcsError::InvalidRevSpec(String::from("empty revision")));
        }
        if token == "tip" {
            return Ok(RevSpec::Tip);
        }
        if token == "null" {
            return Ok(RevSpec::Null);
        }
        if token.bytes().all(|b| b.is_ascii_digit()) {
            let number = token
                .parse::<u64>()
                .map_err(|_| VcsError::InvalidRevSpec(token.to_string()))?;
            return Ok(RevSpec::FileRevision(number));
        }
        if token.len() >= MIN_ABBREV_ID_LEN && crate::commit_id_is_valid(token) {
            return Ok(RevSpec::CommitId(token.to_string()));
        }
        Ok(RevSpec::Name(token.to_string()))
    }
}

/// A `base:head` revision range. An empty base defaults to revision `0`, an
/// empty head to `tip`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevRange {
    pub base: RevSpec,
    pub head: RevSpec,
}

impl RevRange {
    pub fn parse(token: &str) -> Result<RevRange, VcsError> {
        let Some((base, head)) = token.split_once(':') else {
            return Err(VcsError::InvalidRevSpec(format!("not a range: {token}")));
        };
        let base = if base.is_empty() {
            RevSpec::FileRevision(0)
        } else {
            RevSpec::parse(base)?
        };
        let head = if head.is_empty() {
            RevSpec::Tip
        } else {
            RevSpec::parse(head)?
        };
        Ok(RevRange { base, head })
    }
}

/// Whether `token` is a range rather than a single specifier.
pub fn is_range(token: &str) -> bool {
    token.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_classify_by_shape() {
        assert_eq!(RevSpec::parse("tip").expect("parse"), RevSpec::Tip);
        assert_eq!(RevSpec::parse("null").expect("parse"), RevSpec::Null);
        assert_eq!(
            RevSpec::parse("42").expect("parse"),
            RevSpec::FileRevision(42)
        );
        assert_eq!(
            RevSpec::parse("cafe42").expect("parse"),
            RevSpec::CommitId(String::from("cafe42"))
        );
        assert_eq!(
            RevSpec::parse("main").expect("parse"),
            RevSpec::Name(String::from("main"))
        );
        // Too short for an abbreviation, even though it is hex.
        assert_eq!(
            RevSpec::parse("abc").expect("parse"),
            RevSpec::Name(String::from("abc"))
        );
    }

    #[test]
    fn empty_specs_are_rejected() {
        let err = RevSpec::parse("").expect_err("empty");
        assert!(matches!(err, VcsError::InvalidRevSpec(_)), "got {err:?}");
    }

    #[test]
    fn range_defaults_fill_base_and_head() {
        assert_eq!(
            RevRange::parse(":").expect("parse"),
            RevRange {
                base: RevSpec::FileRevision(0),
                head: RevSpec::Tip,
            }
        );
        assert_eq!(
            RevRange::parse("12:").expect("parse"),
            RevRange {
                base: RevSpec::FileRevision(12),
                head: RevSpec::Tip,
            }
        );
        assert_eq!(
            RevRange::parse(":main").expect("parse"),
            RevRange {
                base: RevSpec::FileRevision(0),
                head: RevSpec::Name(String::from("main")),
            }
        );
    }

    #[test]
    fn single_specs_are_not_ranges() {
        assert!(!is_range("tip"));
        assert!(is_range("1:tip"));
        let err = RevRange::parse("tip").expect_err("not a range");
        assert!(matches!(err, VcsError::InvalidRevSpec(_)), "got {err:?}");
    }
}
