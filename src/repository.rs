use std::fs;
use std::ops::{Deref, DerefMut};

use crate::artifact::PackageArtifact;
use crate::build::{self, BuildOptions};
use crate::env::Environment;
use crate::fetch::{Fetcher, FileRef};
use crate::prelude::*;
use crate::recipe::Recipe;
use crate::solve::{Repository, Resolvable};

pub const INDEX_FILE: &str = "repository.json";

static RECIPE_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x-u)^
          (?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)
          -
          (?P<version>[0-9A-Za-z._-]+)
          -
          (?P<revision>[A-Za-z0-9]+)
          \.toml
          $",
    )
    .unwrap()
});

#[derive(Debug, Clone)]
enum RepoBase {
    Local(PathBuf),
    Remote(Url),
}

impl Display for RepoBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoBase::Local(path) => write!(f, "{}", path.display()),
            RepoBase::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// An indexed set of binary artifacts, local or remote. The index document
/// (`repository.json`) maps package name to an ordered list of metas, each
/// carrying the artifact's SHA-256.
pub struct PackageRepository {
    base: RepoBase,
    fetcher: Fetcher,
    index: IndexMap<String, Vec<PackageMeta>>,
}

fn sort_newest_first(metas: &mut [PackageMeta]) {
    metas.sort_by(|a, b| {
        (&b.version, &b.revision).cmp(&(&a.version, &a.revision))
    });
}

impl PackageRepository {
    /// Open a repository at a local path or an `http(s)` URL.
    pub fn open(location: &str, fetcher: Fetcher) -> Result<PackageRepository> {
        context!("opening package repository {location}");
        let base = match Url::parse(location) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                RepoBase::Remote(url)
            }
            Ok(url) if url.scheme() == "file" => RepoBase::Local(
                url.to_file_path()
                    .map_err(|_| eyre!("invalid file URL {url}"))?,
            ),
            _ => RepoBase::Local(PathBuf::from(location)),
        };
        let mut repo = PackageRepository {
            base,
            fetcher,
            index: IndexMap::new(),
        };
        repo.load_index()?;
        Ok(repo)
    }

    fn load_index(&mut self) -> Result<()> {
        let raw: Option<Vec<u8>> = match &self.base {
            RepoBase::Local(path) => {
                let index_path = path.join(INDEX_FILE);
                if index_path.is_file() {
                    Some(fs::read(&index_path)?)
                } else {
                    // a fresh repository simply has no index yet
                    None
                }
            }
            RepoBase::Remote(_) => {
                let mut fetched = self
                    .fetcher
                    .fetch(&FileRef::new(&self.member_location(INDEX_FILE), None))?;
                let mut buf = Vec::new();
                fetched.read_to_end(&mut buf)?;
                Some(buf)
            }
        };
        if let Some(raw) = raw {
            self.index = serde_json::from_slice(&raw)
                .wrap_err_with(|| format!("parsing {INDEX_FILE} of {}", self.base))?;
        }
        Ok(())
    }

    fn member_location(&self, rel: &str) -> String {
        match &self.base {
            RepoBase::Local(path) => path.join(rel).display().to_string(),
            RepoBase::Remote(url) => {
                format!("{}/{}", url.as_str().trim_end_matches('/'), rel)
            }
        }
    }

    /// All artifacts matching a requirement, newest first.
    pub fn find(&self, requirement: &Requirement) -> Vec<PackageMeta> {
        let mut hits: Vec<PackageMeta> = self
            .index
            .get(requirement.name().normalized())
            .map(|metas| {
                metas
                    .iter()
                    .filter(|meta| requirement.satisfied_by(*meta))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_newest_first(&mut hits);
        hits
    }

    /// The best match for a requirement, or *RequirementNotFound*.
    pub fn find_best(&self, requirement: &Requirement) -> Result<PackageMeta> {
        self.find(requirement)
            .into_iter()
            .next()
            .ok_or_else(|| {
                IpkgError::RequirementNotFound {
                    requirement: requirement.to_string(),
                    requester: format!("repository {}", self.base),
                }
                .into()
            })
    }

    /// Resolve a `name[==version[:revision]]` spec against the index,
    /// considering only artifacts compatible with the host platform.
    pub fn get(&self, spec: &PackageSpec) -> Result<PackageMeta> {
        let host = Platform::current();
        let mut hits: Vec<PackageMeta> = self
            .index
            .get(spec.name.normalized())
            .map(|metas| {
                metas
                    .iter()
                    .filter(|meta| {
                        spec.matches(meta)
                            && meta.platform.is_compatible_with(host)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_newest_first(&mut hits);
        hits.into_iter().next().ok_or_else(|| {
            IpkgError::NotFound {
                what: "package",
                name: spec.to_string(),
            }
            .into()
        })
    }

    /// Open the artifact file behind an index entry. Remote downloads are
    /// verified against the indexed checksum.
    pub fn open_artifact(&self, meta: &PackageMeta) -> Result<PackageArtifact> {
        let rel = format!("{}/{}", meta.name.as_given(), meta.filename());
        match &self.base {
            RepoBase::Local(path) => PackageArtifact::open(&path.join(rel)),
            RepoBase::Remote(_) => {
                let hash = meta
                    .checksum
                    .as_ref()
                    .map(|hex| ContentHash::from_hex("sha256", hex))
                    .transpose()?;
                let fetched = self
                    .fetcher
                    .fetch(&FileRef::new(&self.member_location(&rel), hash))?;
                PackageArtifact::open_fetched(fetched)
            }
        }
    }
}

impl Repository for PackageRepository {
    fn find_objects(&self, requirement: &Requirement) -> Vec<Resolvable> {
        self.find(requirement)
            .into_iter()
            .map(|meta| Resolvable::Package(Rc::new(meta)))
            .collect()
    }
}

/// A package repository on the local filesystem: additionally supports
/// rebuilding the index from the artifacts on disk and building recipes
/// straight into the repository.
pub struct LocalPackageRepository {
    repo: PackageRepository,
    base: PathBuf,
}

impl Deref for LocalPackageRepository {
    type Target = PackageRepository;

    fn deref(&self) -> &PackageRepository {
        &self.repo
    }
}

impl DerefMut for LocalPackageRepository {
    fn deref_mut(&mut self) -> &mut PackageRepository {
        &mut self.repo
    }
}

impl LocalPackageRepository {
    pub fn open(base: &Path, fetcher: Fetcher) -> Result<LocalPackageRepository> {
        fs::create_dir_all(base)
            .wrap_err_with(|| format!("cannot create {}", base.display()))?;
        let repo = PackageRepository::open(&base.display().to_string(), fetcher)?;
        Ok(LocalPackageRepository {
            repo,
            base: base.to_owned(),
        })
    }

    fn save_index(&self) -> Result<()> {
        let path = self.base.join(INDEX_FILE);
        let mut temp = tempfile::NamedTempFile::new_in(&self.base)?;
        serde_json::to_writer_pretty(&mut temp, &self.repo.index)?;
        temp.persist(&path)
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Rebuild the index from scratch by walking `base/<name>/*.ipkg`,
    /// reading each artifact's meta and attaching its SHA-256. Unreadable
    /// files are skipped with a warning.
    pub fn update_metadata(&mut self) -> Result<()> {
        info!("Updating metadata of {}", self.base.display());
        self.repo.index.clear();

        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INDEX_FILE {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                debug!("ignoring non-directory {name}");
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if !file.file_type()?.is_file() {
                    debug!("ignoring {}", file.path().display());
                    continue;
                }
                match self.indexed_meta(&file.path()) {
                    Ok(meta) => {
                        self.repo
                            .index
                            .entry(meta.name.normalized().to_owned())
                            .or_default()
                            .push(meta);
                    }
                    Err(e) => {
                        warn!("skipping {}: {e}", file.path().display());
                    }
                }
            }
        }

        if self.repo.index.is_empty() {
            warn!("No package found");
        }
        for metas in self.repo.index.values_mut() {
            sort_newest_first(metas);
        }
        self.save_index()?;
        info!("Repository metadata updated");
        Ok(())
    }

    fn indexed_meta(&self, path: &Path) -> Result<PackageMeta> {
        let artifact = PackageArtifact::open(path)?;
        let mut meta = artifact.meta().clone();
        meta.checksum = Some(sha256_hex(&mut fs::File::open(path)?)?);
        Ok(meta)
    }

    /// Register an artifact in the index (with checksum) and persist it.
    pub fn add(&mut self, artifact: &PackageArtifact) -> Result<()> {
        let meta = self.indexed_meta(artifact.path())?;
        debug!("adding {} to repository", meta.spec_string());
        let entry = self
            .repo
            .index
            .entry(meta.name.normalized().to_owned())
            .or_default();
        entry.retain(|existing| !existing.same_release(&meta));
        entry.push(meta.clone());
        sort_newest_first(entry);
        self.save_index()?;
        info!("Package {} added to repository", meta.spec_string());
        Ok(())
    }

    /// Build a recipe with this repository as both the dependency source
    /// and the output location.
    pub fn build_recipe(
        &mut self,
        recipe: &Recipe,
        environment: Option<&mut Environment>,
        fetcher: &Fetcher,
        options: &BuildOptions,
    ) -> Result<PathBuf> {
        let package_dir = self.base.join(recipe.name.as_given());
        fs::create_dir_all(&package_dir)?;
        let artifact_path = build::build(
            recipe,
            &package_dir,
            environment,
            Some(&self.repo),
            fetcher,
            options,
        )?;
        self.add(&PackageArtifact::open(&artifact_path)?)?;
        Ok(artifact_path)
    }

    /// Build every recipe whose `(name, version, revision)` is not in the
    /// repository yet. A recipe whose dependencies name other unbuilt
    /// recipes is re-queued until they have been built; a recipe with
    /// dependencies nothing can satisfy is skipped with a warning.
    pub fn build_recipes(
        &mut self,
        recipes: &RecipeRepository,
        mut environment: Option<&mut Environment>,
        fetcher: &Fetcher,
        options: &BuildOptions,
    ) -> Result<Vec<PathBuf>> {
        let platform = Platform::current();
        let mut queue: std::collections::VecDeque<Rc<Recipe>> = recipes
            .all()
            .filter(|recipe| {
                let built = self
                    .repo
                    .index
                    .get(recipe.name.normalized())
                    .map(|metas| {
                        metas.iter().any(|meta| {
                            meta.version == recipe.version
                                && meta.revision == recipe.revision
                        })
                    })
                    .unwrap_or(false);
                !built
            })
            .cloned()
            .collect();

        let mut built_paths = Vec::new();
        let mut deferrals = 0usize;

        while let Some(recipe) = queue.pop_front() {
            let requirements = recipe.requirements(platform)?;

            let waiting_on_queue = requirements.iter().any(|requirement| {
                queue
                    .iter()
                    .any(|queued| requirement.satisfied_by(queued.as_ref()))
            });
            if waiting_on_queue {
                // a dependency builds later; come back to this one
                deferrals += 1;
                if deferrals > queue.len() + 1 {
                    warn!(
                        "skipping {}: dependency cycle among unbuilt recipes",
                        recipe.spec_string()
                    );
                    deferrals = 0;
                    continue;
                }
                queue.push_back(recipe);
                continue;
            }
            deferrals = 0;

            let unsatisfied: Vec<&Requirement> = requirements
                .iter()
                .filter(|requirement| {
                    let in_env = environment
                        .as_ref()
                        .map(|env| {
                            env.packages().any(|p| requirement.satisfied_by(p))
                        })
                        .unwrap_or(false);
                    let in_repo = !self.repo.find(requirement).is_empty();
                    !(in_env || in_repo)
                })
                .collect();
            if !unsatisfied.is_empty() {
                warn!(
                    "skipping {}: unsatisfied dependencies {:?}",
                    recipe.spec_string(),
                    unsatisfied
                        .iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                );
                continue;
            }

            let path = self.build_recipe(
                &recipe,
                environment.as_deref_mut(),
                fetcher,
                options,
            )?;
            built_paths.push(path);
        }

        Ok(built_paths)
    }
}

/// A set of named recipes on disk: `base/<name>/<name>-<version>-<revision>.toml`.
/// The tree is scanned once at construction; unreadable recipes are skipped
/// with a warning.
pub struct RecipeRepository {
    recipes: IndexMap<String, Vec<Rc<Recipe>>>,
}

impl RecipeRepository {
    pub fn open(base: &Path) -> Result<RecipeRepository> {
        context!("opening recipe repository {}", base.display());
        let mut recipes: IndexMap<String, Vec<Rc<Recipe>>> = IndexMap::new();
        for entry in fs::read_dir(base)
            .wrap_err_with(|| format!("cannot read {}", base.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let file_name = file.file_name().to_string_lossy().into_owned();
                if !RECIPE_FILE_RE.is_match(&file_name) {
                    continue;
                }
                match Recipe::from_file(&file.path()) {
                    Ok(recipe) => {
                        recipes
                            .entry(recipe.name.normalized().to_owned())
                            .or_default()
                            .push(Rc::new(recipe));
                    }
                    Err(e) => warn!("skipping {}: {e}", file.path().display()),
                }
            }
        }
        for versions in recipes.values_mut() {
            versions.sort_by(|a, b| {
                (&b.version, &b.revision).cmp(&(&a.version, &a.revision))
            });
        }
        Ok(RecipeRepository { recipes })
    }

    pub fn all(&self) -> impl Iterator<Item = &Rc<Recipe>> {
        self.recipes.values().flatten()
    }

    pub fn find(&self, requirement: &Requirement) -> Vec<Rc<Recipe>> {
        self.recipes
            .get(requirement.name().normalized())
            .map(|recipes| {
                recipes
                    .iter()
                    .filter(|recipe| requirement.satisfied_by(recipe.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Repository for RecipeRepository {
    fn find_objects(&self, requirement: &Requirement) -> Vec<Resolvable> {
        self.find(requirement)
            .into_iter()
            .map(Resolvable::Recipe)
            .collect()
    }
}
