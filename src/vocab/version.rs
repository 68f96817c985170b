use std::cmp::Ordering;

use crate::prelude::*;

// A version is an opaque, totally ordered value. Tokenized on '.', '-', '_'
// and letter/digit boundaries; numeric tokens compare numerically and
// alphabetic tokens are pre-release markers comparing lexicographically. At
// any position a pre-release marker sorts before "the version ends here",
// which in turn sorts before any numeric token, so 1.0a1 < 1.0 < 1.0.1.
// Trailing zero tokens are stripped (also right before a pre-release
// marker), so 1.0 == 1 and 1.0a1 == 1a1.

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Segment {
    // Variant order matters: Pre < Num via the derived Ord.
    Pre(String),
    Num(u64),
}

#[derive(Debug, Clone, DeserializeFromStr, SerializeDisplay, Derivative)]
#[derivative(Hash, PartialEq, Eq)]
pub struct Version {
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    as_given: String,
    key: Vec<Segment>,
}

impl Version {
    pub fn as_given(&self) -> &str {
        &self.as_given
    }

    fn push_stripped(key: &mut Vec<Segment>, segment: Segment) {
        if matches!(segment, Segment::Pre(_)) {
            while matches!(key.last(), Some(Segment::Num(0))) {
                key.pop();
            }
        }
        key.push(segment);
    }
}

impl TryFrom<&str> for Version {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let as_given = value.trim();
        let invalid = || {
            eyre::Report::from(IpkgError::InvalidInput {
                what: "version",
                input: value.into(),
            })
        };
        if as_given.is_empty() {
            return Err(invalid());
        }
        let mut key = Vec::new();
        let mut token = String::new();
        for c in as_given.chars() {
            let boundary = match (token.chars().last(), c) {
                (_, '.' | '-' | '_') => true,
                (Some(prev), c) => {
                    prev.is_ascii_digit() != c.is_ascii_digit()
                }
                (None, _) => false,
            };
            if boundary && !token.is_empty() {
                Version::push_stripped(&mut key, parse_token(&token).ok_or_else(invalid)?);
                token.clear();
            }
            match c {
                '.' | '-' | '_' => (),
                c if c.is_ascii_alphanumeric() => token.push(c.to_ascii_lowercase()),
                _ => return Err(invalid()),
            }
        }
        if !token.is_empty() {
            Version::push_stripped(&mut key, parse_token(&token).ok_or_else(invalid)?);
        }
        while matches!(key.last(), Some(Segment::Num(0))) {
            key.pop();
        }
        Ok(Version {
            as_given: as_given.into(),
            key,
        })
    }
}

fn parse_token(token: &str) -> Option<Segment> {
    if token.chars().all(|c| c.is_ascii_digit()) {
        // Absurdly long numeric tokens are rejected rather than silently
        // truncated.
        token.parse().ok().map(Segment::Num)
    } else {
        Some(Segment::Pre(token.into()))
    }
}

try_from_str_boilerplate!(Version);

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_given)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..self.key.len().max(other.key.len()) {
            let ord = match (self.key.get(i), other.key.get(i)) {
                (Some(a), Some(b)) => a.cmp(b),
                // the longer version wins iff its tail is a release segment
                (Some(Segment::Num(_)), None) => Ordering::Greater,
                (Some(Segment::Pre(_)), None) => Ordering::Less,
                (None, Some(Segment::Num(_))) => Ordering::Less,
                (None, Some(Segment::Pre(_))) => Ordering::Greater,
                (None, None) => unreachable!(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        s.try_into().unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.0") < v("2.0"));
        assert!(v("1.9") < v("1.10"));
        assert!(v("1.0") < v("1.0.1"));
        assert!(v("1.0a42") < v("1.0"));
        assert!(v("1.0a1") < v("1.0b1"));
        assert!(v("1.0a1") < v("1.0a2"));
        assert!(v("2") > v("1.5"));
        assert!(v("10.8.4") > v("10.8"));
    }

    #[test]
    fn test_equality_is_structural() {
        assert_eq!(v("1.0"), v("1"));
        assert_eq!(v("1.0.0"), v("1"));
        assert_eq!(v("1.0a1"), v("1a1"));
        assert_eq!(v("1.0-a1"), v("1.0a1"));
        assert_ne!(v("1.0"), v("1.0.1"));
        // display keeps the original spelling anyway
        assert_eq!(v("1.0").to_string(), "1.0");
    }

    #[test]
    fn test_hash_follows_equality() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        fn h<T: Hash>(t: &T) -> u64 {
            let mut s = DefaultHasher::new();
            t.hash(&mut s);
            s.finish()
        }

        assert_eq!(h(&v("1.0")), h(&v("1.0.0")));
        assert_ne!(h(&v("1.0")), h(&v("1.0.1")));
    }

    #[test]
    fn test_invalid() {
        for bad in ["", "  ", "1.0 beta", "1/2", "99999999999999999999999"] {
            assert!(TryInto::<Version>::try_into(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_serde() {
        let direct: Version = "1.2.3".try_into().unwrap();
        let via_serde: Version = serde_json::from_str(r#""1.2.3""#).unwrap();
        assert_eq!(direct, via_serde);
        assert_eq!(serde_json::to_string(&direct).unwrap(), r#""1.2.3""#);
    }
}
