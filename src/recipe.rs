use std::fs;

use crate::fetch::FileRef;
use crate::prelude::*;

/// A declarative description of how to produce a package. Recipes are TOML
/// manifests; the build either runs the default configure/make/make-install
/// sequence or the explicit `install` argv lists, so there is no executable
/// code in a recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: PackageName,
    pub version: Version,
    pub revision: Revision,
    pub platform: Platform,
    pub homepage: Option<String>,
    pub dependencies: Vec<String>,
    pub sources: FileRef,
    pub patches: Vec<FileRef>,
    pub configure_args: Vec<String>,
    pub install: InstallSteps,
    pub envvars: Option<IndexMap<String, String>>,
    pub build_envvars: Option<IndexMap<String, String>>,
}

#[derive(Debug, Clone)]
pub enum InstallSteps {
    /// `./configure <configure_args>`, `make`, `make install`.
    Default,
    /// Explicit argv lists, run in order. Each element is `%(dir)s`-templated
    /// against the build environment's directory map.
    Commands(Vec<Vec<String>>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawRecipe {
    name: PackageName,
    version: Version,
    revision: Option<Revision>,
    platform: Option<Platform>,
    homepage: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    sources: RawFileRef,
    #[serde(default)]
    patches: Vec<RawFileRef>,
    configure_args: Option<Vec<String>>,
    install: Option<Vec<Vec<String>>>,
    envvars: Option<IndexMap<String, String>>,
    build_envvars: Option<IndexMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileRef {
    url: String,
    sha256: Option<String>,
    sha1: Option<String>,
    sha512: Option<String>,
}

impl RawFileRef {
    fn into_file_ref(self) -> Result<FileRef> {
        let mut hashes = Vec::new();
        if let Some(hex) = &self.sha256 {
            hashes.push(ContentHash::from_hex("sha256", hex)?);
        }
        if let Some(hex) = &self.sha1 {
            hashes.push(ContentHash::from_hex("sha1", hex)?);
        }
        if let Some(hex) = &self.sha512 {
            hashes.push(ContentHash::from_hex("sha512", hex)?);
        }
        if hashes.len() > 1 {
            bail!("more than one checksum given for {}", self.url);
        }
        Ok(FileRef::new(&self.url, hashes.pop()))
    }
}

impl Recipe {
    pub fn parse(text: &str, origin: &str) -> Result<Recipe> {
        let invalid = || IpkgError::InvalidInput {
            what: "recipe",
            input: origin.into(),
        };
        let document = text
            .parse::<toml_edit::Document>()
            .map_err(|e| eyre!(e))
            .wrap_err_with(invalid)?;
        let raw: RawRecipe = toml_edit::de::from_item(document.as_item().clone())
            .map_err(|e| eyre!(e))
            .wrap_err_with(invalid)?;
        let recipe = Recipe {
            name: raw.name,
            version: raw.version,
            revision: raw.revision.unwrap_or_else(Revision::one),
            platform: raw.platform.unwrap_or_else(|| ANY_PLATFORM.clone()),
            homepage: raw.homepage,
            dependencies: raw.dependencies,
            sources: raw.sources.into_file_ref()?,
            patches: raw
                .patches
                .into_iter()
                .map(RawFileRef::into_file_ref)
                .collect::<Result<Vec<_>>>()?,
            configure_args: raw
                .configure_args
                .unwrap_or_else(|| vec!["--prefix=%(prefix)s".into()]),
            install: match raw.install {
                None => InstallSteps::Default,
                Some(commands) => {
                    if commands.iter().any(|argv| argv.is_empty()) {
                        bail!("empty install command in {}", origin);
                    }
                    InstallSteps::Commands(commands)
                }
            },
            envvars: raw.envvars,
            build_envvars: raw.build_envvars,
        };
        Ok(recipe)
    }

    pub fn from_file(path: &Path) -> Result<Recipe> {
        context!("loading recipe {}", path.display());
        let text = fs::read_to_string(path).map_err(|_| IpkgError::NotFound {
            what: "recipe",
            name: path.display().to_string(),
        })?;
        Recipe::parse(&text, &path.display().to_string())
    }

    pub fn spec_string(&self) -> String {
        format!("{}=={}:{}", self.name, self.version, self.revision)
    }

    pub fn requirements(&self, platform: &Platform) -> Result<Vec<Requirement>> {
        self.dependencies
            .iter()
            .map(|dep| Requirement::parse(dep, platform))
            .collect()
    }
}

impl Candidate for Recipe {
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

impl Display for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.spec_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_full() {
        let recipe = Recipe::parse(
            indoc! {r#"
                name = "gdbm"
                version = "1.10"
                revision = "2"
                platform = "linux-any-x86_64"
                homepage = "http://www.gnu.org/software/gdbm/"
                dependencies = ["readline >=6"]
                configure-args = ["--prefix=%(prefix)s", "--mandir=%(man)s"]

                [sources]
                url = "http://ftpmirror.gnu.org/gdbm/gdbm-1.10.tar.gz"
                sha256 = "4bdd55147bd05d951e3254d2252851c1da3e013dbb1c0f0a9130eaad28cdb185"

                [[patches]]
                url = "file:///patches/gdbm-ndbm.patch"

                [envvars]
                GDBM_HOME = "%(prefix)s"

                [build-envvars]
                CFLAGS = "-O2"
            "#},
            "gdbm-1.10-2.toml",
        )
        .unwrap();

        assert_eq!(recipe.spec_string(), "gdbm==1.10:2");
        assert_eq!(recipe.platform.to_string(), "linux-any-x86_64");
        assert_eq!(recipe.dependencies, vec!["readline >=6"]);
        assert!(recipe.sources.hash.is_some());
        assert_eq!(recipe.patches.len(), 1);
        assert!(recipe.patches[0].hash.is_none());
        assert_eq!(recipe.configure_args.len(), 2);
        assert!(matches!(recipe.install, InstallSteps::Default));
        assert_eq!(recipe.envvars.unwrap()["GDBM_HOME"], "%(prefix)s");
    }

    #[test]
    fn test_parse_defaults_and_custom_install() {
        let recipe = Recipe::parse(
            indoc! {r#"
                name = "hello"
                version = "1.0"
                install = [
                    ["sh", "-c", "cp hello %(bin)s/hello"],
                ]

                [sources]
                url = "file:///sources/hello-1.0.tar.gz"
            "#},
            "hello-1.0-1.toml",
        )
        .unwrap();

        assert_eq!(recipe.revision, Revision::one());
        assert!(recipe.platform.is_any());
        assert_eq!(recipe.configure_args, vec!["--prefix=%(prefix)s"]);
        match &recipe.install {
            InstallSteps::Commands(commands) => {
                assert_eq!(commands.len(), 1);
                assert_eq!(commands[0][0], "sh");
            }
            other => panic!("unexpected install steps: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        // not toml at all
        let err = Recipe::parse("class Foo(Formula):", "foo.toml").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::InvalidInput { .. })
        ));

        // missing mandatory sources
        assert!(Recipe::parse(
            indoc! {r#"
                name = "x"
                version = "1"
            "#},
            "x.toml"
        )
        .is_err());

        // unknown field
        assert!(Recipe::parse(
            indoc! {r#"
                name = "x"
                version = "1"
                wat = true

                [sources]
                url = "file:///x.tar.gz"
            "#},
            "x.toml"
        )
        .is_err());

        // two checksums on one file
        assert!(Recipe::parse(
            indoc! {r#"
                name = "x"
                version = "1"

                [sources]
                url = "file:///x.tar.gz"
                sha256 = "4bdd55147bd05d951e3254d2252851c1da3e013dbb1c0f0a9130eaad28cdb185"
                sha1 = "ce27cb141098feb00714e758646be3e99c185b71"
            "#},
            "x.toml"
        )
        .is_err());

        // missing file
        let err = Recipe::from_file(Path::new("/no/such/recipe.toml")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::NotFound { .. })
        ));
    }
}
