use crate::prelude::*;

/// An expected content hash: algorithm name + raw digest bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    pub algorithm: String,
    pub raw_data: Vec<u8>,
}

fn digest_algorithm(name: &str) -> Result<&'static ring::digest::Algorithm> {
    Ok(match name {
        "sha256" => &ring::digest::SHA256,
        "sha384" => &ring::digest::SHA384,
        "sha512" => &ring::digest::SHA512,
        "sha1" => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
        _ => {
            return Err(IpkgError::InvalidInput {
                what: "hash algorithm",
                input: name.into(),
            }
            .into())
        }
    })
}

impl ContentHash {
    pub fn from_hex(algorithm: &str, hex: &str) -> Result<ContentHash> {
        digest_algorithm(algorithm)?;
        Ok(ContentHash {
            algorithm: algorithm.into(),
            raw_data: data_encoding::HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .wrap_err_with(|| format!("invalid {algorithm} hex digest {hex:?}"))?,
        })
    }

    /// Wrap a writer so that everything written through it is hashed; call
    /// `finish` to compare against the expected digest.
    pub fn checker<T: Write>(&self, name: &str, inner: T) -> HashChecker<'_, T> {
        HashChecker {
            inner,
            state: ring::digest::Context::new(
                digest_algorithm(&self.algorithm).expect("validated at construction"),
            ),
            expected: self,
            name: name.into(),
        }
    }

    /// Verify a whole byte stream in one go.
    pub fn verify<T: Read>(&self, name: &str, reader: &mut T) -> Result<()> {
        let mut checker = self.checker(name, std::io::sink());
        std::io::copy(reader, &mut checker)?;
        checker.finish()?;
        Ok(())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}",
            self.algorithm,
            data_encoding::HEXLOWER.encode(&self.raw_data),
        )
    }
}

/// Compute the lowercase hex SHA-256 of a byte stream.
pub fn sha256_hex<T: Read>(reader: &mut T) -> Result<String> {
    let mut state = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }
    Ok(data_encoding::HEXLOWER.encode(state.finish().as_ref()))
}

pub struct HashChecker<'a, T: Write> {
    inner: T,
    state: ring::digest::Context,
    expected: &'a ContentHash,
    name: String,
}

impl<'a, T: Write> HashChecker<'a, T> {
    pub fn finish(self) -> Result<T> {
        let digest = self.state.finish();
        if self.expected.raw_data != digest.as_ref() {
            return Err(IpkgError::ChecksumMismatch {
                name: self.name,
                algorithm: self.expected.algorithm.clone(),
                got: data_encoding::HEXLOWER.encode(digest.as_ref()),
                expected: data_encoding::HEXLOWER.encode(&self.expected.raw_data),
            }
            .into());
        }
        Ok(self.inner)
    }
}

impl<'a, T: Write> Write for HashChecker<'a, T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.state.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
