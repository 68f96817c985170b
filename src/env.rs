use std::fs;
use std::io::ErrorKind;
use std::process::{Command, Stdio};

use fs2::FileExt;

use crate::artifact::PackageArtifact;
use crate::error::ExecutionError;
use crate::prelude::*;
use crate::repository::PackageRepository;
use crate::rewrite::rewrite_prefix;
use crate::tree::WriteTreeFS;

pub const META_FILE_NAME: &str = ".ipkg.meta";
pub const ENVVAR_NAME: &str = "IPKG_ENVIRONMENT";

/// The fixed directory layout beneath an environment prefix. Also the
/// namespace for `%(name)s` template expansion in configure arguments and
/// per-package envvars.
#[derive(Debug, Clone)]
pub struct Directories {
    map: IndexMap<&'static str, PathBuf>,
}

impl Directories {
    fn new(prefix: &Path) -> Directories {
        let mut map = IndexMap::new();
        map.insert("prefix", prefix.to_owned());
        map.insert("bin", prefix.join("bin"));
        map.insert("sbin", prefix.join("sbin"));
        map.insert("include", prefix.join("include"));
        map.insert("lib", prefix.join("lib"));
        map.insert("share", prefix.join("share"));
        map.insert("man", prefix.join("share/man"));
        map.insert("pkgconfig", prefix.join("lib/pkgconfig"));
        map.insert("tmp", prefix.join("tmp"));
        Directories { map }
    }

    pub fn get(&self, name: &str) -> Option<&PathBuf> {
        self.map.get(name)
    }

    /// Create the layout. With `idempotent` set, existing directories are
    /// fine; otherwise any conflict fails fast.
    pub fn create(&self, idempotent: bool) -> Result<()> {
        for (name, path) in self.map.iter() {
            let result = if *name == "prefix" {
                fs::create_dir_all(path)
            } else {
                fs::create_dir(path)
            };
            match result {
                Ok(()) => (),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && idempotent => (),
                Err(e) => {
                    return Err(e)
                        .wrap_err_with(|| format!("cannot create {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// Expand `%(name)s` references against the directory map.
    pub fn render(&self, template: &str) -> Result<String> {
        static TEMPLATE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?-u)%\(([A-Za-z_][A-Za-z0-9_]*)\)s").unwrap());
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for captures in TEMPLATE_RE.captures_iter(template) {
            let whole = captures.get(0).unwrap();
            let key = &captures[1];
            let path = self.map.get(key).ok_or(IpkgError::InvalidInput {
                what: "template directory name",
                input: key.to_owned(),
            })?;
            out.push_str(&template[last..whole.start()]);
            out.push_str(&path.display().to_string());
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

/// An ordered, deduplicating `:`-separated path list, e.g. `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathList {
    items: Vec<String>,
}

impl PathList {
    pub fn from_value(value: &str) -> PathList {
        PathList {
            items: value
                .split(':')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect(),
        }
    }

    pub fn remove(&mut self, item: &str) {
        self.items.retain(|existing| existing != item);
    }

    pub fn insert(&mut self, item: &str) {
        self.insert_at(0, item);
    }

    pub fn insert_at(&mut self, index: usize, item: &str) {
        self.remove(item);
        let index = index.min(self.items.len());
        self.items.insert(index, item.to_owned());
    }

    pub fn append(&mut self, item: &str) {
        self.remove(item);
        self.items.push(item.to_owned());
    }

    pub fn value(&self) -> String {
        self.items.join(":")
    }
}

#[derive(Debug, Clone)]
pub enum Variable {
    Scalar(String),
    PathList(PathList),
}

impl Variable {
    pub fn value(&self) -> String {
        match self {
            Variable::Scalar(value) => value.clone(),
            Variable::PathList(list) => list.value(),
        }
    }
}

/// The environment's variable map: a seed (ambient process environment, or
/// empty, or explicit) plus the canonical overlays.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    vars: IndexMap<String, Variable>,
}

impl VariableSet {
    pub fn from_ambient() -> VariableSet {
        let mut set = VariableSet::default();
        for (name, value) in std::env::vars() {
            set.vars.insert(name, Variable::Scalar(value));
        }
        set
    }

    pub fn empty() -> VariableSet {
        VariableSet::default()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn set_scalar(&mut self, name: &str, value: &str) {
        self.vars
            .insert(name.to_owned(), Variable::Scalar(value.into()));
    }

    /// Get a variable as a path list, converting a scalar seed value (or
    /// creating an empty list) as needed.
    pub fn path_list_mut(&mut self, name: &str) -> &mut PathList {
        let entry = self
            .vars
            .entry(name.to_owned())
            .or_insert_with(|| Variable::PathList(PathList::default()));
        if let Variable::Scalar(value) = entry {
            *entry = Variable::PathList(PathList::from_value(value));
        }
        match entry {
            Variable::PathList(list) => list,
            Variable::Scalar(_) => unreachable!(),
        }
    }

    pub fn as_dict(&self) -> IndexMap<String, String> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.value()))
            .collect()
    }

    pub fn as_string(&self, export: bool) -> String {
        let mut out = String::new();
        for (name, var) in self.vars.iter() {
            if export {
                out.push_str("export ");
            }
            out.push_str(&format!("{}='{}'\n", name, var.value()));
        }
        out
    }
}

/// The persistent meta document at `prefix/.ipkg.meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvMeta {
    #[serde(default)]
    pub packages: IndexMap<String, PackageMeta>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl EnvMeta {
    fn load(path: &Path) -> Result<EnvMeta> {
        match fs::read(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(EnvMeta::default()),
            Err(e) => Err(e).wrap_err_with(|| format!("reading {}", path.display())),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                IpkgError::MetaCorrupt {
                    path: path.to_owned(),
                    source: e,
                }
                .into()
            }),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        // atomic-by-rewrite: write a sibling temp file, rename into place
        let dir = path.parent().expect("meta path always has a parent");
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.persist(path)
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Options for running a command inside an environment.
#[derive(Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub stdin_data: Option<Vec<u8>>,
    /// Stream child output to our own stdout/stderr instead of discarding
    /// it. When false, stderr is captured and attached to failures.
    pub show_output: bool,
}

/// Holds the advisory lock that serializes mutating operations against one
/// prefix. Released on drop.
pub struct EnvLock {
    _file: fs::File,
}

/// A relocatable installation prefix: directory layout, variable set, and
/// persistent metadata about installed packages.
#[derive(Debug)]
pub struct Environment {
    prefix: PathBuf,
    directories: Directories,
    variables: VariableSet,
    meta: EnvMeta,
    meta_path: PathBuf,
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_owned())
    }
}

impl Environment {
    /// Open (or describe) the environment at `prefix`, seeding variables
    /// from the ambient process environment.
    pub fn new(prefix: &Path) -> Result<Environment> {
        Environment::with_variables(prefix, VariableSet::from_ambient())
    }

    /// The environment named by `$IPKG_ENVIRONMENT`.
    pub fn current() -> Result<Environment> {
        match std::env::var_os(ENVVAR_NAME) {
            Some(prefix) => Environment::new(Path::new(&prefix)),
            None => Err(IpkgError::NotFound {
                what: "active environment",
                name: format!("${ENVVAR_NAME} is not set"),
            }
            .into()),
        }
    }

    pub fn with_variables(prefix: &Path, seed: VariableSet) -> Result<Environment> {
        let prefix = absolutize(prefix);
        let directories = Directories::new(&prefix);
        let mut variables = seed;

        if variables.get("MANPATH").is_none() {
            variables.set_scalar("MANPATH", "/usr/share/man");
        }

        let dir = |name: &str| directories.get(name).unwrap().display().to_string();

        variables.set_scalar(ENVVAR_NAME, &dir("prefix"));
        variables.set_scalar("TMPDIR", &dir("tmp"));
        let home = std::env::var("HOME").unwrap_or_else(|_| "/".into());
        variables.set_scalar("HOME", &home);
        let env_name = prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| prefix.display().to_string());
        variables.set_scalar("PS1", &format!("({env_name})\\h:\\w\\$ "));

        variables.path_list_mut("PATH").insert(&dir("bin"));
        variables.path_list_mut("PATH").insert(&dir("sbin"));
        variables
            .path_list_mut("C_INCLUDE_PATH")
            .insert(&dir("include"));
        variables.path_list_mut("MANPATH").insert(&dir("man"));
        variables
            .path_list_mut("PKG_CONFIG_PATH")
            .insert(&dir("pkgconfig"));
        variables
            .path_list_mut(dynamic_library_path_var())
            .insert(&dir("lib"));

        let meta_path = prefix.join(META_FILE_NAME);
        let meta = EnvMeta::load(&meta_path)?;

        let mut env = Environment {
            prefix,
            directories,
            variables,
            meta,
            meta_path,
        };

        // installed packages contribute their envvars on load
        let envvar_sets: Vec<_> = env
            .meta
            .packages
            .values()
            .filter_map(|p| p.envvars.clone())
            .collect();
        for envvars in envvar_sets {
            env.add_package_envvars(&envvars)?;
        }
        Ok(env)
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn variables(&self) -> &VariableSet {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableSet {
        &mut self.variables
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageMeta> {
        self.meta.packages.values()
    }

    pub fn installed(&self, name: &PackageName) -> Option<&PackageMeta> {
        self.meta.packages.get(name.normalized())
    }

    pub fn create_directories(&self, idempotent: bool) -> Result<()> {
        info!("Creating environment directories at {}", self.prefix.display());
        self.directories.create(idempotent)
    }

    /// Take the advisory lock serializing mutations of this prefix. The
    /// lock file sits next to the meta document (which itself is replaced
    /// on every save, so it can't hold the lock).
    pub fn lock(&self) -> Result<EnvLock> {
        let lock_path = self.prefix.join(format!("{META_FILE_NAME}.lock"));
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(EnvLock { _file: file })
    }

    pub fn render(&self, template: &str) -> Result<String> {
        self.directories.render(template)
    }

    fn add_package_envvars(
        &mut self,
        envvars: &IndexMap<String, String>,
    ) -> Result<()> {
        for (name, value) in envvars {
            let rendered = self.directories.render(value)?;
            debug!("Adding variable {name}={rendered}");
            self.variables.set_scalar(name, &rendered);
        }
        Ok(())
    }

    /// Spawn `argv` with the environment's variables. Fails on non-zero
    /// exit; returns the (zero) exit code otherwise.
    pub fn execute(&self, argv: &[String], opts: &ExecOptions) -> Result<i32> {
        ensure!(!argv.is_empty(), "empty command");
        let pretty = argv.join(" ");
        debug!("execute({pretty:?}, cwd={:?})", opts.cwd);

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.env_clear();
        command.envs(self.variables.as_dict());
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        if opts.stdin_data.is_some() {
            command.stdin(Stdio::piped());
        }
        if !opts.show_output {
            command.stdout(Stdio::null());
            command.stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| IpkgError::ExecutionFailed {
            command: pretty.clone(),
            kind: if e.kind() == ErrorKind::NotFound {
                ExecutionError::NotFound
            } else {
                ExecutionError::Io(e)
            },
        })?;

        if let Some(data) = &opts.stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(data)?;
            // closes the pipe so the child sees EOF
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let mut err: eyre::Report = IpkgError::ExecutionFailed {
                command: pretty,
                kind: ExecutionError::NonZero(code),
            }
            .into();
            if !output.stderr.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                err = err.wrap_err(format!("stderr: {}", stderr.trim_end()));
            }
            return Err(err);
        }
        Ok(output.status.code().unwrap_or(0))
    }

    /// Install a package given a filesystem path to an `.ipkg` file or a
    /// `name[==version[:revision]]` spec resolved through `repository`.
    pub fn install(
        &mut self,
        target: &str,
        repository: Option<&PackageRepository>,
    ) -> Result<()> {
        context!("installing {target}");
        let path = Path::new(target);
        let artifact = if path.exists() {
            PackageArtifact::open(path)?
        } else {
            let spec: PackageSpec = target.try_into()?;
            let repository = repository.ok_or(IpkgError::NotFound {
                what: "package",
                name: target.into(),
            })?;
            let meta = repository.get(&spec)?;
            repository.open_artifact(&meta)?
        };
        self.install_artifact(&artifact, repository)
    }

    /// Install an opened artifact: check for an existing install, recurse
    /// into missing dependencies, extract, rewrite prefixes, record meta.
    pub fn install_artifact(
        &mut self,
        artifact: &PackageArtifact,
        repository: Option<&PackageRepository>,
    ) -> Result<()> {
        let meta = artifact.meta().clone();
        info!("Installing {}", meta.spec_string());

        if let Some(installed) = self.installed(&meta.name) {
            if installed.same_release(&meta) {
                warn!(
                    "{}",
                    IpkgError::AlreadyInstalled {
                        spec: meta.spec_string(),
                    }
                );
                return Ok(());
            }
            debug!(
                "another release of {} is installed ({}), uninstalling it first",
                meta.name,
                installed.spec_string()
            );
            let name = meta.name.clone();
            self.uninstall(&name)?;
        }

        for dependency in &meta.dependencies {
            let requirement = Requirement::parse(dependency, Platform::current())?;
            if self.packages().any(|p| requirement.satisfied_by(p)) {
                continue;
            }
            info!("Installing dependency: {dependency}");
            let repo = repository.ok_or_else(|| IpkgError::NotFound {
                what: "dependency",
                name: dependency.clone(),
            })?;
            let dep_meta = repo.find_best(&requirement)?;
            let dep_artifact = repo.open_artifact(&dep_meta)?;
            self.install_artifact(&dep_artifact, repository)?;
        }

        artifact.extract(&mut WriteTreeFS::new(&self.prefix))?;

        // Rewrite absolute build-prefix paths, unless the package was built
        // in place. Only binaries and scripts are candidates: bin/, sbin/,
        // and any lib* subtree.
        let build_prefix = meta.build_prefix.clone();
        if build_prefix != self.prefix.display().to_string() {
            debug!("Rewriting prefix in binaries and scripts");
            for package_file in &meta.files {
                let rewritable = match package_file.top_level() {
                    Some("bin") | Some("sbin") => true,
                    Some(top) => top.starts_with("lib"),
                    None => false,
                };
                if !rewritable {
                    continue;
                }
                let full = self.prefix.join(package_file.to_native());
                let is_plain_file = fs::symlink_metadata(&full)
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                if is_plain_file {
                    rewrite_prefix(package_file, &build_prefix, &self.prefix)?;
                }
            }
        }

        self.meta
            .packages
            .insert(meta.name.normalized().to_owned(), meta.clone());
        self.meta.save(&self.meta_path)?;

        if let Some(envvars) = &meta.envvars {
            self.add_package_envvars(envvars)?;
        }

        info!("Package {} installed", meta.spec_string());
        Ok(())
    }

    /// Remove an installed package: delete its files, reclaim empty parent
    /// directories, erase its meta entry.
    pub fn uninstall(&mut self, name: &PackageName) -> Result<()> {
        let meta = self
            .meta
            .packages
            .get(name.normalized())
            .ok_or(IpkgError::NotFound {
                what: "installed package",
                name: name.to_string(),
            })?
            .clone();

        info!("Uninstalling {}", meta.spec_string());

        for rel_path in &meta.files {
            let path = self.prefix.join(rel_path.to_native());
            match fs::symlink_metadata(&path) {
                Ok(stat) if stat.is_file() || stat.file_type().is_symlink() => {
                    fs::remove_file(&path)?;
                    self.reclaim_empty_parents(&path)?;
                }
                Ok(_) => debug!("ignoring {}", path.display()),
                Err(_) => debug!("already gone: {}", path.display()),
            }
        }

        self.meta.packages.shift_remove(name.normalized());
        self.meta.save(&self.meta_path)?;

        info!("Package {} uninstalled", name);
        Ok(())
    }

    fn reclaim_empty_parents(&self, path: &Path) -> Result<()> {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == self.prefix || !dir.starts_with(&self.prefix) {
                break;
            }
            let empty = fs::read_dir(dir)?.next().is_none();
            if !empty {
                break;
            }
            fs::remove_dir(dir)?;
            parent = dir.parent();
        }
        Ok(())
    }
}

pub fn dynamic_library_path_var() -> &'static str {
    if Platform::current().os_name() == "osx" {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::artifact::PackageArtifact;

    fn staged_artifact(
        tmp: &Path,
        name: &str,
        files: &[(&str, &str)],
        dependencies: Vec<String>,
    ) -> PackageArtifact {
        let stage = tmp.join(format!("stage-{name}"));
        let mut file_list = Vec::new();
        for (rel, content) in files {
            let full = stage.join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, content).unwrap();
            file_list.push((*rel).try_into().unwrap());
        }
        let meta = PackageMeta {
            name: name.try_into().unwrap(),
            version: "1.0".try_into().unwrap(),
            revision: Revision::one(),
            platform: ANY_PLATFORM.clone(),
            dependencies,
            homepage: None,
            hostname: "builder".into(),
            timestamp: 0.0,
            files: file_list,
            build_prefix: stage.display().to_string(),
            envvars: None,
            checksum: None,
        };
        PackageArtifact::create(&meta, &stage, tmp).unwrap()
    }

    fn fresh_env(tmp: &Path) -> Environment {
        let env =
            Environment::with_variables(&tmp.join("env"), VariableSet::empty())
                .unwrap();
        env.create_directories(false).unwrap();
        env
    }

    #[test]
    fn test_path_list() {
        let mut list = PathList::from_value("/usr/bin:/bin");
        list.insert("/env/bin");
        assert_eq!(list.value(), "/env/bin:/usr/bin:/bin");
        // inserting an existing entry moves it instead of duplicating
        list.insert("/bin");
        assert_eq!(list.value(), "/bin:/env/bin:/usr/bin");
        list.append("/env/bin");
        assert_eq!(list.value(), "/bin:/usr/bin:/env/bin");
        list.remove("/usr/bin");
        assert_eq!(list.value(), "/bin:/env/bin");
        list.insert_at(1, "/sbin");
        assert_eq!(list.value(), "/bin:/sbin:/env/bin");
    }

    #[test]
    fn test_canonical_variables() {
        let tmp = tempfile::TempDir::new().unwrap();
        let env = fresh_env(tmp.path());
        let dict = env.variables().as_dict();
        let prefix = env.prefix().display().to_string();

        assert_eq!(dict[ENVVAR_NAME], prefix);
        assert_eq!(dict["TMPDIR"], format!("{prefix}/tmp"));
        assert_eq!(dict["PATH"], format!("{prefix}/sbin:{prefix}/bin"));
        assert_eq!(dict["C_INCLUDE_PATH"], format!("{prefix}/include"));
        assert_eq!(
            dict["MANPATH"],
            format!("{prefix}/share/man:/usr/share/man")
        );
        assert_eq!(dict["PKG_CONFIG_PATH"], format!("{prefix}/lib/pkgconfig"));
        assert_eq!(
            dict[dynamic_library_path_var()],
            format!("{prefix}/lib")
        );
        assert!(dict["PS1"].starts_with("(env)"));

        let exported = env.variables().as_string(true);
        assert!(exported.contains(&format!("export TMPDIR='{prefix}/tmp'\n")));
    }

    #[test]
    fn test_seed_path_is_preserved() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut seed = VariableSet::empty();
        seed.set_scalar("PATH", "/usr/bin:/bin");
        let env = Environment::with_variables(&tmp.path().join("env"), seed).unwrap();
        let prefix = env.prefix().display().to_string();
        assert_eq!(
            env.variables().as_dict()["PATH"],
            format!("{prefix}/sbin:{prefix}/bin:/usr/bin:/bin")
        );
    }

    #[test]
    fn test_render() {
        let tmp = tempfile::TempDir::new().unwrap();
        let env = fresh_env(tmp.path());
        let prefix = env.prefix().display().to_string();
        assert_eq!(
            env.render("--prefix=%(prefix)s --mandir=%(man)s").unwrap(),
            format!("--prefix={prefix} --mandir={prefix}/share/man")
        );
        assert!(env.render("%(nope)s").is_err());
        assert_eq!(env.render("no templates").unwrap(), "no templates");
    }

    #[test]
    fn test_meta_corrupt() {
        let tmp = tempfile::TempDir::new().unwrap();
        let prefix = tmp.path().join("env");
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join(META_FILE_NAME), b"{ not json").unwrap();
        let err =
            Environment::with_variables(&prefix, VariableSet::empty()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::MetaCorrupt { .. })
        ));
    }

    #[test]
    fn test_install_uninstall_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let artifact = staged_artifact(
            tmp.path(),
            "foo",
            &[("foo.README", "Hello world\n")],
            vec![],
        );
        let mut env = fresh_env(tmp.path());

        env.install(artifact.path().to_str().unwrap(), None).unwrap();
        assert_eq!(
            fs::read(env.prefix().join("foo.README")).unwrap(),
            b"Hello world\n"
        );
        let installed = env.installed(&"foo".try_into().unwrap()).unwrap();
        assert_eq!(installed.version, "1.0".try_into().unwrap());

        // meta survives a reload
        let reloaded =
            Environment::with_variables(env.prefix(), VariableSet::empty()).unwrap();
        assert!(reloaded.installed(&"foo".try_into().unwrap()).is_some());

        env.uninstall(&"foo".try_into().unwrap()).unwrap();
        assert!(!env.prefix().join("foo.README").exists());
        assert!(env.installed(&"foo".try_into().unwrap()).is_none());

        // uninstalling again is an error
        let err = env.uninstall(&"foo".try_into().unwrap()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::NotFound { .. })
        ));
    }

    #[test]
    fn test_install_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let artifact =
            staged_artifact(tmp.path(), "foo", &[("share/x", "data\n")], vec![]);
        let mut env = fresh_env(tmp.path());

        env.install_artifact(&artifact, None).unwrap();
        let first = env.installed(&"foo".try_into().unwrap()).unwrap().clone();
        // same (name, version, revision): a warning, not an error, no change
        env.install_artifact(&artifact, None).unwrap();
        assert_eq!(env.installed(&"foo".try_into().unwrap()).unwrap(), &first);
    }

    #[test]
    fn test_uninstall_reclaims_empty_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let artifact = staged_artifact(
            tmp.path(),
            "foo",
            &[("share/doc/foo/README", "docs\n")],
            vec![],
        );
        let mut env = fresh_env(tmp.path());
        env.install_artifact(&artifact, None).unwrap();
        assert!(env.prefix().join("share/doc/foo/README").is_file());

        env.uninstall(&"foo".try_into().unwrap()).unwrap();
        // share/doc/foo and share/doc became empty and were reclaimed;
        // share itself was created by the layout and is kept only if
        // non-empty (here man/ still lives inside it)
        assert!(!env.prefix().join("share/doc").exists());
        assert!(env.prefix().join("share").exists());
    }

    #[test]
    fn test_install_rewrites_shebangs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let stage = tmp.path().join("stage-tool");
        fs::create_dir_all(stage.join("bin")).unwrap();
        fs::write(
            stage.join("bin/tool"),
            format!("#!{}/bin/interp\necho hi\n", stage.display()),
        )
        .unwrap();
        // a script outside bin/sbin/lib* keeps its embedded prefix
        fs::create_dir_all(stage.join("share")).unwrap();
        fs::write(
            stage.join("share/tool.sh"),
            format!("#!{}/bin/interp\n", stage.display()),
        )
        .unwrap();
        let meta = PackageMeta {
            name: "tool".try_into().unwrap(),
            version: "1.0".try_into().unwrap(),
            revision: Revision::one(),
            platform: ANY_PLATFORM.clone(),
            dependencies: vec![],
            homepage: None,
            hostname: "builder".into(),
            timestamp: 0.0,
            files: vec![
                "bin/tool".try_into().unwrap(),
                "share/tool.sh".try_into().unwrap(),
            ],
            build_prefix: stage.display().to_string(),
            envvars: None,
            checksum: None,
        };
        let artifact = PackageArtifact::create(&meta, &stage, tmp.path()).unwrap();

        let mut env = fresh_env(tmp.path());
        env.install_artifact(&artifact, None).unwrap();
        let body = fs::read_to_string(env.prefix().join("bin/tool")).unwrap();
        assert!(
            body.starts_with(&format!("#!{}/bin/interp", env.prefix().display())),
            "{body:?}"
        );
        let untouched = fs::read_to_string(env.prefix().join("share/tool.sh")).unwrap();
        assert!(untouched.starts_with(&format!("#!{}/bin/interp", stage.display())));
    }

    #[test]
    fn test_execute() {
        let tmp = tempfile::TempDir::new().unwrap();
        // commands resolve against the environment's own PATH, so seed it
        // from the ambient one to find sh
        let env = Environment::with_variables(
            &tmp.path().join("env"),
            VariableSet::from_ambient(),
        )
        .unwrap();
        env.create_directories(false).unwrap();

        let out = tmp.path().join("out.txt");
        let code = env
            .execute(
                &[
                    "sh".into(),
                    "-c".into(),
                    format!("echo $IPKG_ENVIRONMENT > {}", out.display()),
                ],
                &ExecOptions::default(),
            )
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            env.prefix().display().to_string()
        );

        // data is written to the child's stdin
        let out2 = tmp.path().join("out2.txt");
        env.execute(
            &["sh".into(), "-c".into(), format!("cat > {}", out2.display())],
            &ExecOptions {
                stdin_data: Some(b"from stdin\n".to_vec()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fs::read(&out2).unwrap(), b"from stdin\n");

        // non-zero exit is an ExecutionFailed error
        let err = env
            .execute(
                &["sh".into(), "-c".into(), "exit 3".into()],
                &ExecOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::ExecutionFailed {
                kind: ExecutionError::NonZero(3),
                ..
            })
        ));

        // missing command
        let err = env
            .execute(
                &["definitely-not-a-command-xyz".into()],
                &ExecOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::ExecutionFailed {
                kind: ExecutionError::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_package_envvars_are_rendered_and_persisted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let stage = tmp.path().join("stage-vars");
        fs::create_dir_all(&stage).unwrap();
        fs::write(stage.join("data"), b"x").unwrap();
        let meta = PackageMeta {
            name: "vars".try_into().unwrap(),
            version: "1.0".try_into().unwrap(),
            revision: Revision::one(),
            platform: ANY_PLATFORM.clone(),
            dependencies: vec![],
            homepage: None,
            hostname: "builder".into(),
            timestamp: 0.0,
            files: vec!["data".try_into().unwrap()],
            build_prefix: stage.display().to_string(),
            envvars: Some({
                let mut envvars = IndexMap::new();
                envvars.insert("VARS_HOME".to_string(), "%(prefix)s".to_string());
                envvars
            }),
            checksum: None,
        };
        let artifact = PackageArtifact::create(&meta, &stage, tmp.path()).unwrap();

        let mut env = fresh_env(tmp.path());
        env.install_artifact(&artifact, None).unwrap();
        let prefix = env.prefix().display().to_string();
        assert_eq!(env.variables().as_dict()["VARS_HOME"], prefix);

        // a freshly loaded environment re-applies installed envvars
        let reloaded =
            Environment::with_variables(env.prefix(), VariableSet::empty()).unwrap();
        assert_eq!(reloaded.variables().as_dict()["VARS_HOME"], prefix);
    }

    #[test]
    fn test_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let env = fresh_env(tmp.path());
        let guard = env.lock().unwrap();
        drop(guard);
        let _again = env.lock().unwrap();
    }
}
