use crate::prelude::*;
use auto_impl::auto_impl;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use typed_path::unix::UnixComponent;
use typed_path::UnixPath;

// Every path that ends up inside an environment prefix -- archive members,
// artifact file lists, the paths recorded in the meta document -- goes
// through PrefixPath: a validated, normalized, prefix-relative path. Parent
// references are rejected outright instead of being normalized away:
// nothing a package legitimately ships says "..", and the confinement
// invariant on `files` is easiest to hold when the representation cannot
// express an escape in the first place. (Symlink targets are the one spot
// where ".." is meaningful; PrefixSymlink handles those separately.)
#[derive(
    Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, DeserializeFromStr, SerializeDisplay,
)]
pub struct PrefixPath {
    components: Vec<String>,
}

// Prefixes are unix trees (the rewriter only knows shebangs, .pc/.la files
// and Mach-O), so a component just has to be clean utf-8 with no control
// bytes.
fn check_component(piece: &[u8]) -> Result<&str> {
    let piece = std::str::from_utf8(piece)?;
    if piece.is_empty() {
        bail!("empty path component");
    }
    if piece.contains(|c: char| c.is_ascii_control()) {
        bail!("control character in path component {piece:?}");
    }
    Ok(piece)
}

impl PrefixPath {
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn to_native(&self) -> PathBuf {
        self.components.iter().collect()
    }

    /// The first component, e.g. `bin` for `bin/sub/x`.
    pub fn top_level(&self) -> Option<&str> {
        self.components.first().map(|s| s.as_str())
    }

    /// The directory part, e.g. `bin/sub/x` -> `bin/sub`.
    pub fn parent(&self) -> Option<PrefixPath> {
        let (_, dir) = self.components.split_last()?;
        Some(PrefixPath {
            components: dir.to_vec(),
        })
    }
}

impl Display for PrefixPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.components.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.components.join("/"))
        }
    }
}

impl TryFrom<&[u8]> for PrefixPath {
    type Error = eyre::Report;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        context!("validating path {}", String::from_utf8_lossy(value));
        let mut components = Vec::new();
        for c in UnixPath::new(value).components() {
            match c {
                UnixComponent::RootDir => bail!("expected a prefix-relative path"),
                UnixComponent::CurDir => (),
                UnixComponent::ParentDir => {
                    bail!("'..' has no place in a prefix-relative path")
                }
                UnixComponent::Normal(piece) => {
                    components.push(check_component(piece)?.to_owned());
                }
            }
        }
        Ok(PrefixPath { components })
    }
}

impl TryFrom<&str> for PrefixPath {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

try_from_str_boilerplate!(PrefixPath);

/// A symlink shipped inside a package: its own location under the prefix,
/// and a relative target. The target is accepted only if resolving it from
/// the link's directory can never climb above the prefix root, tracked as
/// an absolute depth while walking the components.
#[derive(Debug)]
pub struct PrefixSymlink {
    pub link: PrefixPath,
    pub target: String,
}

impl PrefixSymlink {
    pub fn new(link: &PrefixPath, target_bytes: &[u8]) -> Result<PrefixSymlink> {
        context!(
            "validating symlink {} -> {}",
            link,
            String::from_utf8_lossy(target_bytes)
        );
        // resolution starts in the directory containing the link
        let mut depth = link
            .len()
            .checked_sub(1)
            .ok_or_else(|| eyre!("a symlink can't be the prefix root itself"))?;
        let mut normalized: Vec<&str> = Vec::new();
        for c in UnixPath::new(target_bytes).components() {
            match c {
                UnixComponent::RootDir => bail!("symlink target must be relative"),
                UnixComponent::CurDir => (),
                UnixComponent::ParentDir => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| eyre!("symlink target climbs out of the prefix"))?;
                    if matches!(normalized.last(), Some(&"..") | None) {
                        normalized.push("..");
                    } else {
                        normalized.pop();
                    }
                }
                UnixComponent::Normal(piece) => {
                    depth += 1;
                    normalized.push(check_component(piece)?);
                }
            }
        }
        let target = if normalized.is_empty() {
            ".".into()
        } else {
            normalized.join("/")
        };
        Ok(PrefixSymlink {
            link: link.clone(),
            target,
        })
    }
}

#[auto_impl(&mut)]
pub trait WriteTree {
    fn mkdir(&mut self, path: &PrefixPath) -> Result<()>;
    fn write_file(
        &mut self,
        path: &PrefixPath,
        data: &mut dyn Read,
        mode: u32,
    ) -> Result<()>;
    fn write_symlink(&mut self, symlink: &PrefixSymlink) -> Result<()>;
}

pub struct WriteTreeFS {
    root: PathBuf,
}

impl WriteTreeFS {
    pub fn new<T: AsRef<Path>>(root: T) -> WriteTreeFS {
        WriteTreeFS {
            root: root.as_ref().into(),
        }
    }

    fn full_path(&self, path: &PrefixPath) -> Result<PathBuf> {
        let full_path = self.root.join(path.to_native());
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(full_path)
    }
}

impl WriteTree for WriteTreeFS {
    fn mkdir(&mut self, path: &PrefixPath) -> Result<()> {
        context!("Creating {path}/");
        match fs::create_dir(self.full_path(path)?) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => Ok(other?),
        }
    }

    fn write_file(
        &mut self,
        path: &PrefixPath,
        data: &mut dyn Read,
        mode: u32,
    ) -> Result<()> {
        context!("Writing out {path}");
        let full_path = self.full_path(path)?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        // make sure we can at least read back what we wrote
        options.mode((mode & 0o7777) | 0o600);
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = match options.open(&full_path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // leftovers, e.g. from an interrupted build
                fs::remove_file(&full_path)?;
                options.open(&full_path)?
            }
            other => other?,
        };
        io::copy(data, &mut file)?;
        Ok(())
    }

    fn write_symlink(&mut self, symlink: &PrefixSymlink) -> Result<()> {
        context!("Symlinking {} -> {}", symlink.link, symlink.target);
        #[cfg(unix)]
        {
            let full_path = self.full_path(&symlink.link)?;
            if fs::symlink_metadata(&full_path).is_ok() {
                fs::remove_file(&full_path)?;
            }
            std::os::unix::fs::symlink(&symlink.target, &full_path)?;
        }
        #[cfg(not(unix))]
        {
            bail!("symlinks not supported on this platform");
        }
        Ok(())
    }
}
