use std::fs;
use std::io::SeekFrom;
use std::time::Duration;

use crate::prelude::*;

/// A reference to a source file: a location (URL or bare filesystem path)
/// plus an optional expected content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub location: String,
    pub hash: Option<ContentHash>,
}

impl FileRef {
    pub fn new(location: &str, hash: Option<ContentHash>) -> FileRef {
        FileRef {
            location: location.into(),
            hash,
        }
    }

    /// The trailing path segment, used for archive format detection.
    pub fn filename(&self) -> String {
        let path = match Url::parse(&self.location) {
            Ok(url) => url.path().to_owned(),
            Err(_) => self.location.clone(),
        };
        path.rsplit('/').next().unwrap_or("").to_owned()
    }
}

impl Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// An open, seekable, already-verified byte source.
#[derive(Debug)]
pub struct FetchedFile {
    pub name: String,
    path: PathBuf,
    file: fs::File,
    // holding this keeps a non-cached download alive until we're done with it
    _temp: Option<tempfile::TempPath>,
}

impl FetchedFile {
    /// Where the bytes live on disk, plus the guard keeping a temporary
    /// download alive. Whoever takes the guard owns the file's lifetime.
    pub fn into_parts(self) -> (PathBuf, Option<tempfile::TempPath>) {
        (self.path, self._temp)
    }
}

impl Read for FetchedFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FetchedFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Backend dispatch is on the URI scheme: `file` (or a bare path) opens the
/// filesystem directly, `http`/`https` downloads into a temp file --
/// streaming through the hash checker, never buffering the whole body in
/// memory -- and optionally persists it to the cache directory.
#[derive(Clone)]
pub struct Fetcher {
    agent: ureq::Agent,
    cache_dir: Option<PathBuf>,
}

impl Fetcher {
    pub fn new(cache_dir: Option<PathBuf>) -> Fetcher {
        let agent = ureq::AgentBuilder::new()
            .timeout_read(Duration::from_secs(30))
            .timeout_write(Duration::from_secs(30))
            .build();
        Fetcher { agent, cache_dir }
    }

    /// The cache is enabled iff `IPKG_CACHE_DIR` is set.
    pub fn from_env() -> Fetcher {
        Fetcher::new(std::env::var_os("IPKG_CACHE_DIR").map(PathBuf::from))
    }

    pub fn fetch(&self, file_ref: &FileRef) -> Result<FetchedFile> {
        context!("fetching {}", file_ref.location);
        match Url::parse(&file_ref.location) {
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| eyre!("invalid file URL {}", url))?;
                self.open_local(file_ref, &path)
            }
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                self.open_remote(file_ref, &url)
            }
            Ok(url) if url.scheme().len() > 1 => Err(IpkgError::InvalidInput {
                what: "file location scheme",
                input: url.scheme().into(),
            }
            .into()),
            // no scheme (or a single-letter windows drive): a plain path
            _ => self.open_local(file_ref, Path::new(&file_ref.location)),
        }
    }

    fn open_local(&self, file_ref: &FileRef, path: &Path) -> Result<FetchedFile> {
        let meta = fs::metadata(path).map_err(|_| IpkgError::NotFound {
            what: "file",
            name: path.display().to_string(),
        })?;
        if !meta.is_file() {
            return Err(IpkgError::InvalidInput {
                what: "file location (not a regular file)",
                input: path.display().to_string(),
            }
            .into());
        }
        if let Some(hash) = &file_ref.hash {
            hash.verify(&file_ref.location, &mut fs::File::open(path)?)?;
        }
        Ok(FetchedFile {
            name: file_ref.filename(),
            path: path.to_owned(),
            file: fs::File::open(path)?,
            _temp: None,
        })
    }

    fn cache_path(&self, url: &Url) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let key = sha256_hex(&mut url.as_str().as_bytes()).expect("in-memory read");
        Some(dir.join(key))
    }

    fn open_remote(&self, file_ref: &FileRef, url: &Url) -> Result<FetchedFile> {
        if let Some(cached) = self.cache_path(url) {
            if cached.is_file() {
                debug!("cache hit for {url}");
                if let Some(hash) = &file_ref.hash {
                    hash.verify(&file_ref.location, &mut fs::File::open(&cached)?)?;
                }
                return Ok(FetchedFile {
                    name: file_ref.filename(),
                    file: fs::File::open(&cached)?,
                    path: cached,
                    _temp: None,
                });
            }
        }

        info!("Downloading {url}");
        let response = self
            .agent
            .request_url("GET", url)
            .call()
            .wrap_err_with(|| format!("GET {url} failed"))?;
        let mut body = response.into_reader();

        let spool_dir = self
            .cache_dir
            .clone()
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(std::env::temp_dir);
        let mut temp = tempfile::NamedTempFile::new_in(spool_dir)?;
        match &file_ref.hash {
            Some(hash) => {
                let mut checker = hash.checker(&file_ref.location, temp.as_file_mut());
                std::io::copy(&mut body, &mut checker)?;
                checker.finish()?;
            }
            None => {
                std::io::copy(&mut body, temp.as_file_mut())?;
            }
        }
        debug!("Downloaded {url}");

        // Cache writes are best-effort: a failure is logged and the download
        // is still returned from its temp file.
        if let Some(cached) = self.cache_path(url) {
            match temp.persist(&cached) {
                Ok(mut file) => {
                    file.seek(SeekFrom::Start(0))?;
                    return Ok(FetchedFile {
                        name: file_ref.filename(),
                        path: cached,
                        file,
                        _temp: None,
                    });
                }
                Err(e) => {
                    warn!("cannot cache {url}: {}", e.error);
                    temp = e.file;
                }
            }
        }

        let (mut file, temp_path) = temp.into_parts();
        file.seek(SeekFrom::Start(0))?;
        Ok(FetchedFile {
            name: file_ref.filename(),
            path: temp_path.to_path_buf(),
            file,
            _temp: Some(temp_path),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BODY: &[u8] = b"Hello world\n";
    // sha256 of BODY
    const GOOD: &str = "1894a19c85ba153acbf743ac4e43fc004c891604b26f8c69e1e83ea2afc7c48f";

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("foo.tar.gz");
        fs::write(&path, BODY).unwrap();
        path
    }

    #[test]
    fn test_filename() {
        assert_eq!(
            FileRef::new("http://example.com/dist/foo-1.0.tar.gz", None).filename(),
            "foo-1.0.tar.gz"
        );
        assert_eq!(FileRef::new("/tmp/bar.zip", None).filename(), "bar.zip");
    }

    #[test]
    fn test_open_local_plain_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_fixture(tmp.path());
        let fetcher = Fetcher::new(None);
        let mut fetched = fetcher
            .fetch(&FileRef::new(path.to_str().unwrap(), None))
            .unwrap();
        let mut buf = Vec::new();
        fetched.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, BODY);
        assert_eq!(fetched.name, "foo.tar.gz");
    }

    #[test]
    fn test_open_local_file_url() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_fixture(tmp.path());
        let url = Url::from_file_path(&path).unwrap();
        let fetcher = Fetcher::new(None);
        let hash = ContentHash::from_hex("sha256", GOOD).unwrap();
        let mut fetched = fetcher
            .fetch(&FileRef::new(url.as_str(), Some(hash)))
            .unwrap();
        let mut buf = Vec::new();
        fetched.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, BODY);
    }

    #[test]
    fn test_checksum_mismatch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_fixture(tmp.path());
        let bad = ContentHash::from_hex(
            "sha256",
            "894a19c85ba153acbf743ac4e43fc004c891604b26f8c69e1e83ea2afc7c48f1",
        )
        .unwrap();
        let fetcher = Fetcher::new(None);
        let err = fetcher
            .fetch(&FileRef::new(path.to_str().unwrap(), Some(bad)))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IpkgError>(),
            Some(IpkgError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_and_irregular() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fetcher = Fetcher::new(None);
        let missing = tmp.path().join("nope");
        assert!(matches!(
            fetcher
                .fetch(&FileRef::new(missing.to_str().unwrap(), None))
                .unwrap_err()
                .downcast_ref::<IpkgError>(),
            Some(IpkgError::NotFound { .. })
        ));
        assert!(fetcher
            .fetch(&FileRef::new(tmp.path().to_str().unwrap(), None))
            .is_err());
    }

    #[test]
    fn test_unknown_scheme() {
        let fetcher = Fetcher::new(None);
        assert!(fetcher
            .fetch(&FileRef::new("ftp://example.com/foo", None))
            .is_err());
    }

    #[test]
    fn test_cache_key_is_stable() {
        let fetcher = Fetcher::new(Some(PathBuf::from("/cache")));
        let url = Url::parse("http://example.com/foo.tar.gz").unwrap();
        let a = fetcher.cache_path(&url).unwrap();
        let b = fetcher.cache_path(&url).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("/cache"));
        let other = Url::parse("http://example.com/bar.tar.gz").unwrap();
        assert_ne!(a, fetcher.cache_path(&other).unwrap());

        assert!(Fetcher::new(None).cache_path(&url).is_none());
    }
}
