use std::fs;
use std::process::Command;

use crate::error::ExecutionError;
use crate::prelude::*;
use crate::tree::PrefixPath;

static PKGCONFIG_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?-u)^lib(64)?/pkgconfig/.*\.pc$").unwrap());
static LIBTOOL_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?-u)^lib(64)?/.*\.la$").unwrap());

const MACHO_MAGICS: [&[u8; 4]; 2] = [b"\xce\xfa\xed\xfe", b"\xcf\xfa\xed\xfe"];

/// Rewrite the build prefix embedded in one installed file, classified by
/// path and content:
///
/// - `lib(64)?/pkgconfig/*.pc`: first `prefix=` line
/// - `lib(64)?/*.la`: first `libdir=` line
/// - `#!` scripts: first line
/// - Mach-O binaries: re-ID via `install_name_tool`
///
/// Anything else is left untouched. The caller decides which files are
/// candidates at all (regular files under `bin/`, `sbin/`, `lib*/`).
pub fn rewrite_prefix(
    rel_path: &PrefixPath,
    build_prefix: &str,
    install_prefix: &Path,
) -> Result<()> {
    context!("rewriting prefix in {rel_path}");
    let file_path = install_prefix.join(rel_path.to_native());
    let install_prefix = install_prefix.display().to_string();
    let rel = rel_path.to_string();

    if PKGCONFIG_FILE.is_match(&rel) {
        rewrite_text_first_match(&file_path, b"prefix=", build_prefix, &install_prefix)
    } else if LIBTOOL_FILE.is_match(&rel) {
        rewrite_text_first_match(&file_path, b"libdir=", build_prefix, &install_prefix)
    } else {
        let mut first_bytes = [0u8; 4];
        let n = fs::File::open(&file_path)?.read(&mut first_bytes)?;
        if n >= 2 && &first_bytes[..2] == b"#!" {
            rewrite_text_first_line(&file_path, build_prefix, &install_prefix)
        } else if n == 4 && MACHO_MAGICS.iter().any(|m| *m == &first_bytes) {
            rewrite_macho(&file_path, build_prefix, &install_prefix)
        } else {
            Ok(())
        }
    }
}

fn replace_bytes(haystack: &[u8], from: &str, to: &str) -> Vec<u8> {
    // str::replace over lossy utf8 would mangle binaries; these rewrites
    // only ever run on single text lines, where a plain byte-level scan is
    // enough.
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(from.as_bytes()) {
            out.extend_from_slice(to.as_bytes());
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Rewrite the prefix in the first line starting with `line_start`.
fn rewrite_text_first_match(
    file_path: &Path,
    line_start: &[u8],
    build_prefix: &str,
    install_prefix: &str,
) -> Result<()> {
    let data = fs::read(file_path)?;
    let mut out = Vec::with_capacity(data.len());
    let mut done = false;
    for line in data.split_inclusive(|b| *b == b'\n') {
        if !done && line.starts_with(line_start) {
            out.extend(replace_bytes(line, build_prefix, install_prefix));
            done = true;
        } else {
            out.extend_from_slice(line);
        }
    }
    fs::write(file_path, out)?;
    Ok(())
}

/// Rewrite the prefix in the first line only: the path after a shebang.
fn rewrite_text_first_line(
    file_path: &Path,
    build_prefix: &str,
    install_prefix: &str,
) -> Result<()> {
    let data = fs::read(file_path)?;
    let split = data
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(data.len());
    let mut out = replace_bytes(&data[..split], build_prefix, install_prefix);
    out.extend_from_slice(&data[split..]);
    fs::write(file_path, out)?;
    Ok(())
}

fn run(argv: &[String]) -> Result<std::process::Output> {
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| IpkgError::ExecutionFailed {
            command: argv.join(" "),
            kind: if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::NotFound
            } else {
                ExecutionError::Io(e)
            },
        })?;
    if !output.status.success() {
        return Err(IpkgError::ExecutionFailed {
            command: argv.join(" "),
            kind: ExecutionError::NonZero(output.status.code().unwrap_or(-1)),
        }
        .into());
    }
    Ok(output)
}

fn macho_linked_libs(file_path: &str) -> Result<Vec<String>> {
    let output = run(&["otool".into(), "-L".into(), file_path.into()])?;
    let text = String::from_utf8_lossy(&output.stdout);
    // first line is the file itself; the rest are "\t<lib> (compat ...)"
    Ok(text
        .lines()
        .skip(1)
        .filter_map(|line| line.trim_start().split_whitespace().next())
        .map(|s| s.to_owned())
        .collect())
}

fn rewrite_macho(
    file_path: &Path,
    build_prefix: &str,
    install_prefix: &str,
) -> Result<()> {
    let path_str = file_path.display().to_string();

    // install_name_tool fails when the file is not writable, so grant the
    // write bit for the duration and restore the original mode after.
    #[cfg(unix)]
    let restore_mode = {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(file_path)?.permissions().mode();
        if mode & 0o200 == 0 {
            fs::set_permissions(file_path, fs::Permissions::from_mode(mode | 0o200))?;
            Some(mode)
        } else {
            None
        }
    };

    let mut argv: Vec<String> = vec!["install_name_tool".into(), "-id".into(), path_str.clone()];
    for lib in macho_linked_libs(&path_str)? {
        if lib.starts_with(build_prefix) {
            argv.push("-change".into());
            argv.push(lib.clone());
            argv.push(lib.replacen(build_prefix, install_prefix, 1));
        }
    }
    argv.push(path_str);
    let result = run(&argv);

    #[cfg(unix)]
    if let Some(mode) = restore_mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file_path, fs::Permissions::from_mode(mode))?;
    }

    result.map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;

    const OLD: &str = "/tmp/ipkg-build-x/environment";

    fn rewrite(rel: &str, content: &[u8]) -> Vec<u8> {
        let tmp = tempfile::TempDir::new().unwrap();
        let rel_path: PrefixPath = rel.try_into().unwrap();
        let full = tmp.path().join(rel_path.to_native());
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();
        rewrite_prefix(&rel_path, OLD, tmp.path()).unwrap();
        fs::read(&full).unwrap()
    }

    #[test]
    fn test_pkgconfig() {
        let out = rewrite(
            "lib/pkgconfig/foo.pc",
            format!("prefix={OLD}\nexec_prefix={OLD}\nName: foo\n").as_bytes(),
        );
        let text = String::from_utf8(out).unwrap();
        // only the first prefix= line is touched
        assert!(text.starts_with("prefix="));
        assert!(!text.lines().next().unwrap().contains(OLD));
        assert!(text.contains(&format!("exec_prefix={OLD}")));
    }

    #[test]
    fn test_libtool() {
        let out = rewrite(
            "lib64/libfoo.la",
            format!("# libfoo.la\nlibdir='{OLD}/lib64'\nold={OLD}\n").as_bytes(),
        );
        let text = String::from_utf8(out).unwrap();
        assert!(!text.lines().nth(1).unwrap().contains(OLD));
        assert!(text.lines().nth(2).unwrap().contains(OLD));
    }

    #[test]
    fn test_shebang() {
        let out = rewrite(
            "bin/foo-config",
            format!("#!{OLD}/bin/python\nimport x  # {OLD} stays\n").as_bytes(),
        );
        let text = String::from_utf8(out).unwrap();
        assert!(!text.lines().next().unwrap().contains(OLD));
        assert!(text.lines().nth(1).unwrap().contains(OLD));
    }

    #[test]
    fn test_plain_binary_untouched() {
        let content = b"\x7fELF some binary stuff".to_vec();
        let out = rewrite("bin/foo", &content);
        assert_eq!(out, content);
    }

    #[test]
    fn test_replace_bytes() {
        assert_eq!(replace_bytes(b"a/old/b/old", "/old", "/new"), b"a/new/b/new");
        assert_eq!(replace_bytes(b"nothing", "/old", "/new"), b"nothing");
    }
}
