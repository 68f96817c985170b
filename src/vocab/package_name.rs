use crate::prelude::*;

#[derive(Debug, Clone, DeserializeFromStr, SerializeDisplay, Derivative)]
#[derivative(Hash, PartialEq, Eq)]
pub struct PackageName {
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    as_given: String,
    normalized: String,
}

impl PackageName {
    pub fn as_given(&self) -> &str {
        &self.as_given
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl TryFrom<&str> for PackageName {
    type Error = eyre::Report;

    fn try_from(as_given: &str) -> Result<Self, Self::Error> {
        static NAME_VALIDATE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i-u)^[A-Z0-9][A-Z0-9._-]*$").unwrap());

        if !NAME_VALIDATE.is_match(as_given) {
            return Err(IpkgError::InvalidInput {
                what: "package name",
                input: as_given.into(),
            }
            .into());
        }

        let as_given = as_given.to_owned();
        let normalized = as_given.to_ascii_lowercase();

        Ok(PackageName {
            as_given,
            normalized,
        })
    }
}

try_from_str_boilerplate!(PackageName);

impl Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_given)
    }
}
