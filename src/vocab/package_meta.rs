use std::cmp::Ordering;

use crate::prelude::*;
use crate::tree::PrefixPath;

/// A package revision: an integer-like token. Compared numerically when
/// both sides are numeric, otherwise lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Revision(String);

impl Revision {
    pub fn one() -> Revision {
        Revision("1".into())
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            // the string tiebreak keeps Ord consistent with Eq for
            // oddities like "01" vs "1"
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for Revision {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IpkgError::InvalidInput {
                what: "revision",
                input: value.into(),
            }
            .into());
        }
        Ok(Revision(value.into()))
    }
}

try_from_str_boilerplate!(Revision);

/// The manifest embedded in every artifact and mirrored per-package in the
/// environment meta document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: PackageName,
    pub version: Version,
    pub revision: Revision,
    pub platform: Platform,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    pub hostname: String,
    pub timestamp: f64,
    pub files: Vec<PrefixPath>,
    pub build_prefix: String,
    #[serde(default)]
    pub envvars: Option<IndexMap<String, String>>,
    /// Hex SHA-256 of the artifact bytes; set by the repository indexer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PackageMeta {
    /// `name-version-revision-osname-osrelease-arch.ipkg`
    pub fn filename(&self) -> String {
        format!(
            "{}-{}-{}-{}.ipkg",
            self.name, self.version, self.revision, self.platform
        )
    }

    /// `name==version:revision`
    pub fn spec_string(&self) -> String {
        format!("{}=={}:{}", self.name, self.version, self.revision)
    }

    pub fn same_release(&self, other: &PackageMeta) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.revision == other.revision
    }

    /// `files` must name prefix-relative paths, each exactly once.
    /// (Relativity and confinement are already guaranteed by the
    /// `PrefixPath` type; this checks the rest.)
    pub fn check_files(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for file in &self.files {
            if file.is_empty() {
                return Err(IpkgError::InvalidInput {
                    what: "package file list entry",
                    input: file.to_string(),
                }
                .into());
            }
            if !seen.insert(file) {
                return Err(IpkgError::InvalidInput {
                    what: "package file list (duplicate entry)",
                    input: file.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl Candidate for PackageMeta {
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
