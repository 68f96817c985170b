use std::fs;

use crate::prelude::*;
use crate::tree::WriteTree;
use crate::unpack::unpack_tar_filtered;

/// Name of the manifest member inside every artifact. The container format
/// is a bzip2-compressed tar: `.ipkg.meta` first, then each file from
/// `meta.files` relative to the prefix, preserving file modes, with no
/// directory entries.
pub const META_FILE: &str = ".ipkg.meta";

/// An `.ipkg` file on disk.
#[derive(Debug)]
pub struct PackageArtifact {
    path: PathBuf,
    meta: PackageMeta,
    // set when the artifact came from a download that only lives as long as
    // this value
    _temp: Option<tempfile::TempPath>,
}

impl PackageArtifact {
    /// Open an artifact fetched through the verified fetcher, adopting the
    /// temp file backing it (if any).
    pub fn open_fetched(fetched: crate::fetch::FetchedFile) -> Result<PackageArtifact> {
        let (path, temp) = fetched.into_parts();
        let mut artifact = PackageArtifact::open(&path)?;
        artifact._temp = temp;
        Ok(artifact)
    }

    pub fn open(path: &Path) -> Result<PackageArtifact> {
        context!("reading artifact {}", path.display());
        let file = fs::File::open(path).map_err(|_| IpkgError::NotFound {
            what: "artifact",
            name: path.display().to_string(),
        })?;
        let unbz = bzip2::read::BzDecoder::new(file);
        let mut archive = tar::Archive::new(unbz);
        for entry in archive.entries()? {
            let entry = entry?;
            if &*entry.path_bytes() == META_FILE.as_bytes() {
                let meta: PackageMeta = serde_json::from_reader(entry).map_err(|e| {
                    IpkgError::MetaCorrupt {
                        path: path.to_owned(),
                        source: e,
                    }
                })?;
                meta.check_files()
                    .wrap_err_with(|| format!("in {}", path.display()))?;
                return Ok(PackageArtifact {
                    path: path.to_owned(),
                    meta,
                    _temp: None,
                });
            }
        }
        Err(IpkgError::ArchiveLayoutInvalid {
            name: path.display().to_string(),
            problem: format!("no {META_FILE} member"),
        }
        .into())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &PackageMeta {
        &self.meta
    }

    /// Unpack every member except the manifest under `dest`.
    pub fn extract<W: WriteTree>(&self, dest: &mut W) -> Result<()> {
        context!("extracting {}", self.path.display());
        let file = fs::File::open(&self.path)?;
        let unbz = bzip2::read::BzDecoder::new(file);
        let archive = tar::Archive::new(unbz);
        unpack_tar_filtered(archive, dest, |path| path.to_string() != META_FILE)
    }

    /// Compose an artifact from `meta` plus the listed files under
    /// `prefix`, placed in `package_dir` under the canonical filename.
    /// Files are appended exactly as listed, one member per path,
    /// non-recursively.
    pub fn create(
        meta: &PackageMeta,
        prefix: &Path,
        package_dir: &Path,
    ) -> Result<PackageArtifact> {
        let path = package_dir.join(meta.filename());
        context!("creating artifact {}", path.display());
        meta.check_files()?;

        let file = fs::File::create(&path)?;
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let meta_json = serde_json::to_vec_pretty(meta)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(meta_json.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, META_FILE, meta_json.as_slice())?;

        for file_path in &meta.files {
            let native = file_path.to_native();
            builder
                .append_path_with_name(prefix.join(&native), &native)
                .wrap_err_with(|| format!("adding {file_path}"))?;
        }

        builder.into_inner()?.finish()?;
        info!("Package {} created", path.display());
        Ok(PackageArtifact {
            path,
            meta: meta.clone(),
            _temp: None,
        })
    }
}
