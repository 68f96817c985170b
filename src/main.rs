#![forbid(unsafe_code)]

mod artifact;
mod build;
mod env;
mod error;
mod fetch;
mod output;
mod prelude;
mod recipe;
mod repository;
mod rewrite;
mod solve;
mod tree;
mod unpack;
mod util;
mod vocab;

use clap::{Parser, Subcommand};

use crate::build::BuildOptions;
use crate::env::{Environment, ExecOptions};
use crate::error::ExecutionError;
use crate::fetch::Fetcher;
use crate::prelude::*;
use crate::recipe::Recipe;
use crate::repository::{LocalPackageRepository, PackageRepository, RecipeRepository};
use crate::solve::{select_most_recent, Resolvable, Solver};

#[derive(Parser)]
#[command(name = "ipkg", version, about = "Package manager for relocatable environments")]
struct Cli {
    #[command(flatten)]
    output: output::OutputArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List installed packages.
    List {
        /// The environment to inspect.
        #[arg(short, long, value_name = "ENV")]
        environment: Option<PathBuf>,
    },
    /// Install a package.
    Install {
        /// The environment in which the package will be installed.
        #[arg(short, long, value_name = "ENV")]
        environment: Option<PathBuf>,
        /// Use a repository to find the package.
        #[arg(short, long, value_name = "URL")]
        repository: Option<String>,
        /// An .ipkg file, or name[==version[:revision]].
        #[arg(value_name = "PKG")]
        package: String,
    },
    /// Uninstall a package.
    Uninstall {
        /// The environment from which the package will be uninstalled.
        #[arg(short, long, value_name = "ENV")]
        environment: Option<PathBuf>,
        #[arg(value_name = "PKG")]
        package: String,
    },
    /// Create an environment.
    Mkenv {
        #[arg(value_name = "ENV")]
        environment: PathBuf,
    },
    /// Show the variables of an environment.
    Printenv {
        /// Prefix variables with the export keyword.
        #[arg(short = 'x', long)]
        export: bool,
        #[arg(value_name = "ENV")]
        environment: PathBuf,
    },
    /// Run a command in an environment.
    Exec {
        #[arg(value_name = "ENV")]
        environment: PathBuf,
        #[arg(value_name = "COMMAND")]
        command: String,
        #[arg(value_name = "ARG", trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },
    /// Launch an interactive shell.
    Shell {
        /// Shell executable.
        #[arg(short, long, default_value = "/bin/bash")]
        shell: String,
        #[arg(value_name = "ENV")]
        environment: PathBuf,
    },
    /// Build a package from a recipe.
    Build {
        /// The environment in which the package will be built.
        #[arg(short, long, value_name = "ENV")]
        environment: Option<PathBuf>,
        /// Use a repository to find the dependencies.
        #[arg(short, long, value_name = "URL")]
        repository: Option<String>,
        /// Where to store the package. Default: current directory.
        #[arg(short, long, value_name = "DIR")]
        package_dir: Option<PathBuf>,
        /// Don't remove the build directory.
        #[arg(short, long)]
        keep_build_dir: bool,
        /// Add the newly built package to the repository (local repositories
        /// only).
        #[arg(short, long)]
        update_repository: bool,
        #[arg(value_name = "RECIPE_FILE")]
        recipe_file: PathBuf,
    },
    /// Create or refresh a package repository index.
    Mkrepo {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Build all recipes and store them in a repository.
    BuildRepository {
        /// The environment in which the packages will be built.
        #[arg(short, long, value_name = "ENV")]
        environment: Option<PathBuf>,
        #[arg(value_name = "PACKAGE_REPO")]
        package_repository: PathBuf,
        #[arg(value_name = "RECIPE_REPO")]
        recipe_repository: PathBuf,
    },
}

fn open_environment(prefix: &Option<PathBuf>) -> Result<Environment> {
    match prefix {
        Some(prefix) => Environment::new(prefix),
        None => Environment::current(),
    }
}

fn open_repository(
    location: &Option<String>,
    fetcher: &Fetcher,
) -> Result<Option<PackageRepository>> {
    location
        .as_ref()
        .map(|location| PackageRepository::open(location, fetcher.clone()))
        .transpose()
        .wrap_err_with(|| format!("cannot open repository {:?}", location))
}

fn install(
    environment: &mut Environment,
    package: &str,
    repository: Option<&PackageRepository>,
) -> Result<()> {
    // a filesystem path installs directly; anything else goes through the
    // solver for a full transitive install plan
    if Path::new(package).exists() {
        return environment.install(package, repository);
    }
    let spec: PackageSpec = package.try_into()?;
    let repository = repository.ok_or(IpkgError::NotFound {
        what: "package",
        name: package.into(),
    })?;
    let root = Resolvable::Package(Rc::new(repository.get(&spec)?));

    let repositories: [&dyn solve::Repository; 1] = [repository];
    let solver = Solver::from_obj(
        root.clone(),
        Platform::current(),
        Some(environment),
        &repositories,
    )?;
    let plan = solver.solve(Some(&root), select_most_recent, true)?;
    for step in plan {
        match step {
            Resolvable::Package(meta) => {
                let artifact = repository.open_artifact(&meta)?;
                environment.install_artifact(&artifact, Some(repository))?;
            }
            other => bail!("cannot install {other} (not a binary package)"),
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let fetcher = Fetcher::from_env();
    let verbose = cli.output.is_verbose();

    match cli.command {
        Command::List { environment } => {
            let environment = open_environment(&environment)?;
            for package in environment.packages() {
                println!("{}", package.spec_string());
            }
        }
        Command::Install {
            environment,
            repository,
            package,
        } => {
            let mut environment = open_environment(&environment)?;
            let _lock = environment.lock()?;
            let repository = open_repository(&repository, &fetcher)?;
            install(&mut environment, &package, repository.as_ref())?;
        }
        Command::Uninstall {
            environment,
            package,
        } => {
            let mut environment = open_environment(&environment)?;
            let _lock = environment.lock()?;
            let spec: PackageSpec = package.as_str().try_into()?;
            environment.uninstall(&spec.name)?;
        }
        Command::Mkenv { environment } => {
            let environment = Environment::new(&environment)?;
            environment.create_directories(false)?;
        }
        Command::Printenv {
            export,
            environment,
        } => {
            let environment = Environment::new(&environment)?;
            print!("{}", environment.variables().as_string(export));
        }
        Command::Exec {
            environment,
            command,
            arguments,
        } => {
            let environment = Environment::new(&environment)?;
            let mut argv = vec![command];
            argv.extend(arguments);
            environment.execute(
                &argv,
                &ExecOptions {
                    show_output: true,
                    ..Default::default()
                },
            )?;
        }
        Command::Shell { shell, environment } => {
            let environment = Environment::new(&environment)?;
            environment.execute(
                &[shell],
                &ExecOptions {
                    show_output: true,
                    ..Default::default()
                },
            )?;
        }
        Command::Build {
            environment,
            repository,
            package_dir,
            keep_build_dir,
            update_repository,
            recipe_file,
        } => {
            let recipe = Recipe::from_file(&recipe_file)?;
            let mut environment = environment
                .map(|prefix| Environment::new(&prefix))
                .transpose()?;
            let _lock = environment
                .as_ref()
                .map(|environment| environment.lock())
                .transpose()?;
            let options = BuildOptions {
                keep_build_dir,
                verbose,
            };
            if update_repository {
                let location = repository.ok_or_else(|| {
                    eyre!("--update-repository requires --repository")
                })?;
                let mut repository =
                    LocalPackageRepository::open(Path::new(&location), fetcher.clone())?;
                repository.build_recipe(
                    &recipe,
                    environment.as_mut(),
                    &fetcher,
                    &options,
                )?;
            } else {
                let package_dir = match package_dir {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                };
                let repository = open_repository(&repository, &fetcher)?;
                build::build(
                    &recipe,
                    &package_dir,
                    environment.as_mut(),
                    repository.as_ref(),
                    &fetcher,
                    &options,
                )?;
            }
        }
        Command::Mkrepo { path } => {
            let mut repository =
                LocalPackageRepository::open(&path, fetcher.clone())?;
            repository.update_metadata()?;
        }
        Command::BuildRepository {
            environment,
            package_repository,
            recipe_repository,
        } => {
            let mut environment = environment
                .map(|prefix| Environment::new(&prefix))
                .transpose()?;
            let _lock = environment
                .as_ref()
                .map(|environment| environment.lock())
                .transpose()?;
            let mut packages =
                LocalPackageRepository::open(&package_repository, fetcher.clone())?;
            let recipes = RecipeRepository::open(&recipe_repository)?;
            let new_packages = packages.build_recipes(
                &recipes,
                environment.as_mut(),
                &fetcher,
                &BuildOptions {
                    keep_build_dir: false,
                    verbose,
                },
            )?;
            if new_packages.is_empty() {
                info!("Repository is up to date");
            } else {
                info!("New packages:");
                for path in new_packages {
                    if let Some(filename) = path.file_name() {
                        info!("{}", filename.to_string_lossy());
                    }
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    output::init(&cli.output);

    if let Err(err) = run(cli) {
        // a child process's failure becomes our own exit code
        let code = match err.downcast_ref::<IpkgError>() {
            Some(IpkgError::ExecutionFailed {
                kind: ExecutionError::NonZero(code),
                ..
            }) => *code,
            _ => 1,
        };
        if std::env::var_os("IPKG_DEBUG").is_some() {
            // the full chain, with context and backtrace
            eprintln!("{err:?}");
        } else {
            tracing::error!("{err}");
        }
        std::process::exit(code);
    }
}
