use crate::prelude::*;

/// A platform tag: `os_name-os_release-architecture`, where any component
/// may be the wildcard `any`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct Platform {
    os_name: String,
    os_release: String,
    architecture: String,
}

pub static ANY_PLATFORM: Lazy<Platform> = Lazy::new(|| Platform::new("any", "any", "any"));

impl Platform {
    pub fn new(os_name: &str, os_release: &str, architecture: &str) -> Platform {
        Platform {
            os_name: os_name.to_ascii_lowercase(),
            os_release: os_release.to_ascii_lowercase(),
            architecture: architecture.to_ascii_lowercase(),
        }
    }

    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    pub fn is_any(&self) -> bool {
        self == &*ANY_PLATFORM
    }

    /// Wildcard-aware matching: each component must either match exactly or
    /// be `any` on at least one side.
    pub fn is_compatible_with(&self, other: &Platform) -> bool {
        fn component(a: &str, b: &str) -> bool {
            a == "any" || b == "any" || a == b
        }
        component(&self.os_name, &other.os_name)
            && component(&self.os_release, &other.os_release)
            && component(&self.architecture, &other.architecture)
    }

    /// The platform of the running host. Detection runs once per process;
    /// everything downstream takes a `Platform` value explicitly.
    pub fn current() -> &'static Platform {
        static CURRENT: Lazy<Platform> = Lazy::new(|| {
            let os_name = match std::env::consts::OS {
                "macos" => "osx",
                other => other,
            };
            let os_release = std::process::Command::new("uname")
                .arg("-r")
                .output()
                .ok()
                .and_then(|out| String::from_utf8(out.stdout).ok())
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".into());
            Platform::new(os_name, &os_release, std::env::consts::ARCH)
        });
        &CURRENT
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.os_name, self.os_release, self.architecture
        )
    }
}

impl TryFrom<&str> for Platform {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("any") {
            return Ok(ANY_PLATFORM.clone());
        }
        let mut pieces = trimmed.split('-');
        match (pieces.next(), pieces.next(), pieces.next(), pieces.next()) {
            (Some(os_name), Some(os_release), Some(architecture), None)
                if !os_name.is_empty() && !os_release.is_empty() && !architecture.is_empty() =>
            {
                Ok(Platform::new(os_name, os_release, architecture))
            }
            _ => Err(IpkgError::InvalidInput {
                what: "platform",
                input: value.into(),
            }
            .into()),
        }
    }
}

try_from_str_boilerplate!(Platform);
