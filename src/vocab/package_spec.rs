use crate::prelude::*;

/// `name[==version[:revision]]`, as accepted by `install`/`uninstall` and
/// used to key repository lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct PackageSpec {
    pub name: PackageName,
    pub version: Option<Version>,
    pub revision: Option<Revision>,
}

impl PackageSpec {
    pub fn matches(&self, candidate: &PackageMeta) -> bool {
        self.name == candidate.name
            && self
                .version
                .as_ref()
                .map(|v| v == &candidate.version)
                .unwrap_or(true)
            && self
                .revision
                .as_ref()
                .map(|r| r == &candidate.revision)
                .unwrap_or(true)
    }
}

impl Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, "=={}", version)?;
            if let Some(revision) = &self.revision {
                write!(f, ":{}", revision)?;
            }
        }
        Ok(())
    }
}

impl TryFrom<&str> for PackageSpec {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        static SPEC_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                r"(?x-u)^
                  (?P<name>[A-Za-z0-9][A-Za-z0-9._-]*?)
                  (?:
                    ==
                    (?P<version>[A-Za-z0-9._-]+?)
                    (?: : (?P<revision>[A-Za-z0-9]+) )?
                  )?
                  $",
            )
            .unwrap()
        });
        let invalid = || {
            eyre::Report::from(IpkgError::InvalidInput {
                what: "package spec",
                input: value.into(),
            })
        };
        let captures = SPEC_RE.captures(value.trim()).ok_or_else(invalid)?;
        Ok(PackageSpec {
            name: captures.name("name").unwrap().as_str().try_into()?,
            version: captures
                .name("version")
                .map(|m| m.as_str().try_into())
                .transpose()?,
            revision: captures
                .name("revision")
                .map(|m| m.as_str().try_into())
                .transpose()?,
        })
    }
}

try_from_str_boilerplate!(PackageSpec);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        let spec: PackageSpec = "foo".try_into().unwrap();
        assert_eq!(spec.name.as_given(), "foo");
        assert!(spec.version.is_none());
        assert!(spec.revision.is_none());

        let spec: PackageSpec = "foo==1.0".try_into().unwrap();
        assert_eq!(spec.version, Some("1.0".try_into().unwrap()));
        assert!(spec.revision.is_none());

        let spec: PackageSpec = "foo-bar==1.0:2".try_into().unwrap();
        assert_eq!(spec.name.as_given(), "foo-bar");
        assert_eq!(spec.revision, Some("2".try_into().unwrap()));
        assert_eq!(spec.to_string(), "foo-bar==1.0:2");

        for bad in ["", "foo==", "foo==1.0:", "foo>=1.0", "foo bar"] {
            let spec: Result<PackageSpec> = bad.try_into();
            assert!(spec.is_err(), "{bad:?}");
        }
    }
}
