use std::fs;
use std::ops::Deref;
use std::process::{Command, Stdio};

use crate::error::ExecutionError;
use crate::prelude::*;
use crate::tree::{PrefixPath, PrefixSymlink, WriteTree, WriteTreeFS};

/// Extract a source archive into `target` and return the path of its single
/// top-level directory. Format detection is by filename suffix; an archive
/// with zero or more than one top-level entry is rejected.
pub fn unarchive<T: Read + Seek>(
    mut source: T,
    filename: &str,
    target: &Path,
) -> Result<PathBuf> {
    context!("extracting {filename}");
    fs::create_dir_all(target)?;
    let mut dest = WriteTreeFS::new(target);
    let mut top_level = BTreeSet::new();

    if filename.ends_with(".tar.gz") {
        let ungz = flate2::read::MultiGzDecoder::new(source);
        unpack_tar(tar::Archive::new(ungz), &mut dest, &mut top_level)?;
    } else if filename.ends_with(".tar.bz2") {
        let unbz = bzip2::read::BzDecoder::new(source);
        unpack_tar(tar::Archive::new(unbz), &mut dest, &mut top_level)?;
    } else if filename.ends_with(".tar.xz") {
        // tar can't read xz natively; pipe the file through the external xz
        // tool. stdin is a real file, so there is no feeding to deadlock on.
        let mut spool = tempfile::tempfile()?;
        std::io::copy(&mut source, &mut spool)?;
        spool.seek(std::io::SeekFrom::Start(0))?;
        let mut child = Command::new("xz")
            .args(["-d", "-c"])
            .stdin(Stdio::from(spool))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| IpkgError::ExecutionFailed {
                command: "xz -d -c".into(),
                kind: if e.kind() == std::io::ErrorKind::NotFound {
                    ExecutionError::NotFound
                } else {
                    ExecutionError::Io(e)
                },
            })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let unpacked = unpack_tar(tar::Archive::new(stdout), &mut dest, &mut top_level);
        let status = child.wait()?;
        unpacked?;
        if !status.success() {
            return Err(IpkgError::ExecutionFailed {
                command: "xz -d -c".into(),
                kind: ExecutionError::NonZero(status.code().unwrap_or(-1)),
            }
            .into());
        }
    } else if filename.ends_with(".zip") {
        unpack_zip(zip::ZipArchive::new(source)?, &mut dest, &mut top_level)?;
    } else {
        return Err(IpkgError::ArchiveLayoutInvalid {
            name: filename.into(),
            problem: "unrecognized archive suffix".into(),
        }
        .into());
    }

    if top_level.len() != 1 {
        return Err(IpkgError::ArchiveLayoutInvalid {
            name: filename.into(),
            problem: format!(
                "expected exactly 1 top-level entry, found {}",
                top_level.len()
            ),
        }
        .into());
    }
    Ok(target.join(top_level.into_iter().next().unwrap()))
}

fn note_top_level(top_level: &mut BTreeSet<String>, path: &PrefixPath) {
    if let Some(top) = path.top_level() {
        top_level.insert(top.to_owned());
    }
}

fn unpack_tar<T: Read, W: WriteTree>(
    archive: tar::Archive<T>,
    dest: &mut W,
    top_level: &mut BTreeSet<String>,
) -> Result<()> {
    unpack_tar_filtered(archive, dest, |path| {
        note_top_level(top_level, path);
        true
    })
}

/// Walk a tar archive, writing every member for which `keep` returns true
/// through the tree-safety layer. Shared between source extraction and
/// artifact extraction (which filters out the embedded meta member).
pub(crate) fn unpack_tar_filtered<T: Read, W: WriteTree>(
    mut archive: tar::Archive<T>,
    dest: &mut W,
    mut keep: impl FnMut(&PrefixPath) -> bool,
) -> Result<()> {
    let mut symlinks = Vec::<PrefixSymlink>::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PrefixPath = entry.path_bytes().deref().try_into()?;
        if !keep(&path) {
            continue;
        }
        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);
        use tar::EntryType::*;
        match kind {
            Symlink => {
                let target = entry
                    .link_name_bytes()
                    .ok_or_else(|| eyre!("symlink entry {} has no target", path))?;
                symlinks.push(PrefixSymlink::new(&path, target.as_ref())?);
            }
            Link | Char | Block | Fifo => {
                bail!("archive entry {} has unsupported type {:?}", path, kind)
            }
            Directory => dest.mkdir(&path)?,
            GNULongName | GNULongLink | GNUSparse | XGlobalHeader | XHeader => (),
            Regular | Continuous | _ => {
                dest.write_file(&path, &mut entry, mode)?;
            }
        }
    }

    // process symlinks in order from longest to shortest, to prevent weird cases where
    // first we make a symlink foo/ -> bar/, and then we make another symlink foo/baz ->
    // something.
    symlinks.sort_unstable_by_key(|symlink| symlink.link.len());
    for symlink in symlinks.into_iter().rev() {
        dest.write_symlink(&symlink)?;
    }
    Ok(())
}

fn unpack_zip<T: Read + Seek, W: WriteTree>(
    mut archive: zip::ZipArchive<T>,
    dest: &mut W,
    top_level: &mut BTreeSet<String>,
) -> Result<()> {
    let mut symlinks = Vec::<PrefixSymlink>::new();
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        context!("unpacking zip member {}", member.name());
        let path: PrefixPath = member.name().try_into()?;
        note_top_level(top_level, &path);
        if let Some(mode) = member.unix_mode() {
            if mode & 0xf000 == 0xa000 {
                // it's a symlink
                let mut target = Vec::new();
                member.read_to_end(&mut target)?;
                symlinks.push(PrefixSymlink::new(&path, &target)?);
                continue;
            }
        }
        if member.is_dir() {
            dest.mkdir(&path)?;
        } else {
            let mode = member.unix_mode().map(|m| m & 0o7777).unwrap_or(0o644);
            dest.write_file(&path, &mut member, mode)?;
        }
    }

    symlinks.sort_unstable_by_key(|symlink| symlink.link.len());
    for symlink in symlinks.into_iter().rev() {
        dest.write_symlink(&symlink)?;
    }
    Ok(())
}
