use crate::prelude::*;

use super::reqparse;

/// Something a requirement can be matched against: anything carrying a
/// `(platform, name, version)` triple. Implemented by recipes, package
/// metadata, and the solver's node objects.
pub trait Candidate {
    fn name(&self) -> &PackageName;
    fn version(&self) -> &Version;
    fn platform(&self) -> &Platform;
}

/// A parsed requirement: platform, name, extras, and a canonical version
/// constraint.
///
/// Equality and hashing are on the canonical form, which always includes
/// the resolved platform. In particular `"foo"` parsed on an
/// `osx-10.8.4-x86_64` host is *not* equal to `"any:foo"`: the omitted
/// platform is substituted at construction time, and equality sees the
/// substituted value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Requirement {
    platform: Platform,
    name: PackageName,
    extras: BTreeSet<String>,
    constraint: VersionConstraint,
}

impl Requirement {
    pub fn parse(input: &str, default_platform: &Platform) -> Result<Requirement> {
        let parsed = reqparse::requirement(input)?;
        Requirement::build(
            parsed
                .platform
                .unwrap_or_else(|| default_platform.clone()),
            parsed.name,
            parsed.extras,
            parsed.constraints,
        )
        .wrap_err_with(|| format!("in requirement {:?}", input))
    }

    pub fn build(
        platform: Platform,
        name: PackageName,
        extras: Vec<String>,
        constraints: Vec<Constraint>,
    ) -> Result<Requirement> {
        Ok(Requirement {
            platform,
            name,
            extras: extras.into_iter().collect(),
            constraint: VersionConstraint::new(constraints)?,
        })
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn extras(&self) -> &BTreeSet<String> {
        &self.extras
    }

    pub fn constraint(&self) -> &VersionConstraint {
        &self.constraint
    }

    /// Merge two requirements for the same `(name, platform)`: extras are
    /// unioned, constraints are concatenated and re-canonicalized.
    pub fn merge(&self, other: &Requirement) -> Result<Requirement> {
        if self.name != other.name {
            return Err(IpkgError::InvalidInput {
                what: "requirement merge",
                input: format!("{} + {}", self, other),
            }
            .into());
        }
        if self.platform != other.platform {
            return Err(IpkgError::InvalidInput {
                what: "requirement merge (platform mismatch)",
                input: format!("{} + {}", self, other),
            }
            .into());
        }
        let constraint = self
            .constraint
            .merge(&other.constraint)
            .wrap_err_with(|| format!("cannot merge {} with {}", self, other))?;
        let mut extras = self.extras.clone();
        extras.extend(other.extras.iter().cloned());
        Ok(Requirement {
            platform: self.platform.clone(),
            name: self.name.clone(),
            extras,
            constraint,
        })
    }

    pub fn satisfied_by<C: Candidate + ?Sized>(&self, candidate: &C) -> bool {
        self.name == *candidate.name()
            && self.platform.is_compatible_with(candidate.platform())
            && self.constraint.satisfied_by(candidate.version())
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.name)?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(|e| e.as_str()).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        if !self.constraint.is_any() {
            write!(f, "{}", self.constraint)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Requirement {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Requirement::parse(value, Platform::current())
    }
}

try_from_str_boilerplate!(Requirement);

#[cfg(test)]
mod test {
    use super::*;

    struct Pkg {
        name: PackageName,
        version: Version,
        platform: Platform,
    }

    impl Pkg {
        fn new(name: &str, version: &str) -> Pkg {
            Pkg {
                name: name.try_into().unwrap(),
                version: version.try_into().unwrap(),
                platform: ANY_PLATFORM.clone(),
            }
        }
    }

    impl Candidate for Pkg {
        fn name(&self) -> &PackageName {
            &self.name
        }
        fn version(&self) -> &Version {
            &self.version
        }
        fn platform(&self) -> &Platform {
            &self.platform
        }
    }

    fn req(s: &str) -> Requirement {
        Requirement::parse(s, &ANY_PLATFORM).unwrap()
    }

    #[test]
    fn test_parse() {
        let r = req("foo >= 1.0, < 2");
        assert_eq!(r.name(), &"foo".try_into().unwrap());
        assert_eq!(r.constraint().to_string(), "<2,>=1.0");
        assert_eq!(r.to_string(), "any-any-any:foo<2,>=1.0");

        let r = req("osx-10.8.4-x86_64:bar[ssl, docs]==2");
        assert_eq!(r.platform().to_string(), "osx-10.8.4-x86_64");
        assert_eq!(r.to_string(), "osx-10.8.4-x86_64:bar[docs,ssl]==2");

        for bad in ["foo/bar > 42%", "foo ==", ">= 1.0", "foo[]"] {
            assert!(Requirement::parse(bad, &ANY_PLATFORM).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_default_platform_substitution() {
        let host = Platform::new("osx", "10.8.4", "x86_64");
        let r = Requirement::parse("foo", &host).unwrap();
        assert_eq!(r.platform(), &host);
        // requirement equality is on the canonical string, which includes
        // the substituted platform
        assert_ne!(r, Requirement::parse("any:foo", &host).unwrap());
        assert_eq!(r, Requirement::parse("osx-10.8.4-x86_64:foo", &ANY_PLATFORM).unwrap());
    }

    #[test]
    fn test_eq_and_hash_are_canonical() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        fn h<T: Hash>(t: &T) -> u64 {
            let mut s = DefaultHasher::new();
            t.hash(&mut s);
            s.finish()
        }

        assert_eq!(req("foo==1.0"), req("foo == 1.0"));
        assert_eq!(h(&req("foo >1,<2")), h(&req("foo>1 , <2")));
        assert_ne!(req("foo==1.0"), req("foo==1.1"));
    }

    #[test]
    fn test_satisfied_by() {
        let r = req("foo >= 1.0, < 2");
        assert!(r.satisfied_by(&Pkg::new("foo", "1.0")));
        assert!(!r.satisfied_by(&Pkg::new("foo", "2.0")));
        assert!(!r.satisfied_by(&Pkg::new("foo", "0.42")));
        assert!(!r.satisfied_by(&Pkg::new("bar", "1.0")));

        let mut incompatible = Pkg::new("foo", "1.0");
        incompatible.platform = Platform::new("osx", "10.8.4", "x86_64");
        let linux_only =
            Requirement::parse("linux-any-any:foo", &ANY_PLATFORM).unwrap();
        assert!(!linux_only.satisfied_by(&incompatible));
    }

    #[test]
    fn test_merge() {
        let merged = req("foo>1.1,>1").merge(&req("foo<3,<2")).unwrap();
        assert!(merged.satisfied_by(&Pkg::new("foo", "1.5")));
        assert!(!merged.satisfied_by(&Pkg::new("foo", "1")));
        assert!(!merged.satisfied_by(&Pkg::new("foo", "2")));

        let merged = req("foo[a]").merge(&req("foo[b]")).unwrap();
        assert_eq!(merged.to_string(), "any-any-any:foo[a,b]");

        assert!(req("foo").merge(&req("bar")).is_err());

        let err = req("foo>2").merge(&req("foo<1")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::ConflictingConstraint { .. })
        ));
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let (a, b, c) = (req("foo>1"), req("foo<3,!=2"), req("foo>=1.5"));
        let ab_c = a.merge(&b).unwrap().merge(&c).unwrap();
        let a_bc = a.merge(&b.merge(&c).unwrap()).unwrap();
        let ba_c = b.merge(&a).unwrap().merge(&c).unwrap();
        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c, ba_c);
    }
}
