use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::artifact::PackageArtifact;
use crate::env::{Environment, ExecOptions, VariableSet, META_FILE_NAME};
use crate::fetch::Fetcher;
use crate::prelude::*;
use crate::recipe::{InstallSteps, Recipe};
use crate::repository::PackageRepository;
use crate::tree::PrefixPath;
use crate::unpack::unarchive;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub keep_build_dir: bool,
    /// Stream build command output instead of discarding it.
    pub verbose: bool,
}

/// List every regular file and symlink under `base`, as prefix-relative
/// paths. The environment's own metadata files are not part of any
/// package and are excluded.
pub fn find_files(base: &Path) -> Result<BTreeSet<PrefixPath>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeSet<PrefixPath>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(base, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(base)
                    .expect("walking below base")
                    .to_str()
                    .ok_or_else(|| eyre!("non-unicode path {}", path.display()))?;
                if rel.starts_with(META_FILE_NAME) {
                    continue;
                }
                out.insert(rel.try_into()?);
            }
        }
        Ok(())
    }

    let mut out = BTreeSet::new();
    if base.is_dir() {
        walk(base, base, &mut out)?;
    }
    Ok(out)
}

/// Build a recipe into a binary artifact under `package_dir`.
///
/// The steps: set up a build environment (ephemeral unless one is given),
/// install missing dependencies, fetch + verify + extract the sources,
/// apply patches, snapshot the prefix, run the install steps, and package
/// the file-set difference. The prefix is put back the way it was found --
/// captured files deleted, step-installed dependencies uninstalled -- even
/// when a build step fails.
pub fn build(
    recipe: &Recipe,
    package_dir: &Path,
    environment: Option<&mut Environment>,
    repository: Option<&PackageRepository>,
    fetcher: &Fetcher,
    options: &BuildOptions,
) -> Result<PathBuf> {
    context!("building {}", recipe.spec_string());
    info!("Building {}", recipe.spec_string());

    let build_dir = tempfile::Builder::new().prefix("ipkg-build-").tempdir()?;

    let mut ephemeral;
    let environment: &mut Environment = match environment {
        Some(environment) => environment,
        None => {
            debug!("creating temporary build environment");
            ephemeral = Environment::with_variables(
                &build_dir.path().join("environment"),
                VariableSet::from_ambient(),
            )?;
            ephemeral.create_directories(false)?;
            &mut ephemeral
        }
    };

    if let Some(build_envvars) = &recipe.build_envvars {
        for (name, value) in build_envvars {
            let rendered = environment.render(value)?;
            environment.variables_mut().set_scalar(name, &rendered);
        }
    }

    // install missing dependencies, remembering which ones we added
    let platform = Platform::current();
    let mut installed_dependencies: Vec<PackageName> = Vec::new();
    for dependency in &recipe.dependencies {
        let requirement = Requirement::parse(dependency, platform)?;
        if environment
            .packages()
            .any(|package| requirement.satisfied_by(package))
        {
            continue;
        }
        info!("Installing build dependency: {dependency}");
        let repository = repository.ok_or_else(|| IpkgError::NotFound {
            what: "build dependency",
            name: dependency.clone(),
        })?;
        let meta = repository.find_best(&requirement)?;
        let artifact = repository.open_artifact(&meta)?;
        environment.install_artifact(&artifact, Some(repository))?;
        installed_dependencies.push(meta.name.clone());
    }

    let mut snapshot: Option<BTreeSet<PrefixPath>> = None;
    let result = build_inner(
        recipe,
        package_dir,
        environment,
        fetcher,
        build_dir.path(),
        options,
        &mut snapshot,
    );

    // best-effort cleanup, also on the error path: delete whatever the
    // build produced under the prefix, then the dependencies we installed
    if let Some(before) = snapshot {
        match find_files(environment.prefix()) {
            Ok(after) => {
                for produced in after.difference(&before) {
                    let path = environment.prefix().join(produced.to_native());
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("cannot remove {}: {e}", path.display());
                    }
                }
            }
            Err(e) => warn!("cannot re-scan build environment: {e}"),
        }
    }
    for dependency in installed_dependencies.iter().rev() {
        if let Err(e) = environment.uninstall(dependency) {
            warn!("cannot uninstall build dependency {dependency}: {e}");
        }
    }

    if options.keep_build_dir {
        let kept = build_dir.into_path();
        info!("Keeping build directory {}", kept.display());
    }

    let artifact_path = result?;
    info!("Build done");
    Ok(artifact_path)
}

fn build_inner(
    recipe: &Recipe,
    package_dir: &Path,
    environment: &mut Environment,
    fetcher: &Fetcher,
    build_dir: &Path,
    options: &BuildOptions,
    snapshot: &mut Option<BTreeSet<PrefixPath>>,
) -> Result<PathBuf> {
    // fetch and unpack the sources; the source root becomes the working
    // directory for every subsequent command
    let sources = fetcher.fetch(&recipe.sources)?;
    let sources_name = sources.name.clone();
    let src_root = unarchive(sources, &sources_name, &build_dir.join("sources"))?;

    for patch in &recipe.patches {
        info!("Applying patch: {patch}");
        let mut fetched = fetcher.fetch(patch)?;
        let mut content = Vec::new();
        fetched.read_to_end(&mut content)?;
        environment.execute(
            &["patch".into(), "-p0".into()],
            &ExecOptions {
                cwd: Some(src_root.clone()),
                stdin_data: Some(content),
                show_output: options.verbose,
            },
        )?;
    }

    *snapshot = Some(find_files(environment.prefix())?);

    run_install_steps(recipe, environment, &src_root, options)?;

    let after = find_files(environment.prefix())?;
    let captured: Vec<PrefixPath> = after
        .difference(snapshot.as_ref().expect("snapshot was just taken"))
        .cloned()
        .collect();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let hostname = whoami::fallible::hostname()
        .unwrap_or_else(|_| "localhost".into())
        .split('.')
        .next()
        .unwrap_or("localhost")
        .to_owned();

    let meta = PackageMeta {
        name: recipe.name.clone(),
        version: recipe.version.clone(),
        revision: recipe.revision.clone(),
        platform: Platform::current().clone(),
        dependencies: recipe.dependencies.clone(),
        homepage: recipe.homepage.clone(),
        hostname,
        timestamp,
        files: captured,
        build_prefix: environment.prefix().display().to_string(),
        envvars: recipe.envvars.clone(),
        checksum: None,
    };

    let artifact = PackageArtifact::create(&meta, environment.prefix(), package_dir)?;
    Ok(artifact.path().to_owned())
}

fn run_install_steps(
    recipe: &Recipe,
    environment: &Environment,
    src_root: &Path,
    options: &BuildOptions,
) -> Result<()> {
    let run = |argv: Vec<String>| -> Result<()> {
        info!("Running: {}", argv.join(" "));
        environment.execute(
            &argv,
            &ExecOptions {
                cwd: Some(src_root.to_owned()),
                stdin_data: None,
                show_output: options.verbose,
            },
        )?;
        Ok(())
    };

    match &recipe.install {
        InstallSteps::Default => {
            let mut configure = vec!["./configure".to_string()];
            for arg in &recipe.configure_args {
                configure.push(environment.render(arg)?);
            }
            run(configure)?;
            run(vec!["make".into()])?;
            run(vec!["make".into(), "install".into()])?;
        }
        InstallSteps::Commands(commands) => {
            for argv in commands {
                let rendered = argv
                    .iter()
                    .map(|arg| environment.render(arg))
                    .collect::<Result<Vec<_>>>()?;
                run(rendered)?;
            }
        }
    }
    Ok(())
}
