use crate::prelude::*;

/// A named digest like `sha256=<hex>`, the format hashes travel in through
/// index pages, lock files, and the content-addressed store.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct ArtifactHash {
    pub algorithm: String,
    pub digest: Vec<u8>,
}

impl ArtifactHash {
    pub fn from_hex(algorithm: &str, hex: &str) -> Result<ArtifactHash> {
        Ok(ArtifactHash {
            algorithm: algorithm.into(),
            digest: data_encoding::HEXLOWER_PERMISSIVE.decode(hex.as_bytes())?,
        })
    }

    pub fn sha256_of(data: &[u8]) -> ArtifactHash {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        ArtifactHash {
            algorithm: "sha256".into(),
            digest: digest.as_ref().to_vec(),
        }
    }

    /// Wrap a writer so that everything passing through gets hashed, and
    /// `finish` fails if the result doesn't match.
    pub fn checker<T: Write>(&self, inner: T) -> Result<HashChecker<'_, T>> {
        let algorithm = match self.algorithm.as_str() {
            "sha256" => &ring::digest::SHA256,
            other => bail!("unsupported hash algorithm {other:?}"),
        };
        Ok(HashChecker {
            inner,
            state: ring::digest::Context::new(algorithm),
            expected: self,
        })
    }
}

impl Display for ArtifactHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}",
            self.algorithm,
            data_encoding::HEXLOWER.encode(&self.digest),
        )
    }
}

impl TryFrom<&str> for ArtifactHash {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self> {
        let (algorithm, hex) = value
            .split_once('=')
            .ok_or_else(|| eyre!("expected 'algorithm=hexdigest', got {:?}", value))?;
        ArtifactHash::from_hex(algorithm, hex)
    }
}

try_from_str_boilerplate!(ArtifactHash);

pub struct HashChecker<'a, T: Write> {
    inner: T,
    state: ring::digest::Context,
    expected: &'a ArtifactHash,
}

impl<'a, T: Write> HashChecker<'a, T> {
    pub fn finish(self) -> Result<T> {
        let actual = self.state.finish();
        if self.expected.digest != actual.as_ref() {
            return Err(SprigError::ArtifactHashMismatch {
                url: String::new(),
                expected: self.expected.to_string(),
                got: data_encoding::HEXLOWER.encode(actual.as_ref()),
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let text = "sha256=c27c231e66336183c484fbfe080fa6cc954149366c15dc21db8b7290081ec7b8";
        let hash: ArtifactHash = text.parse().unwrap();
        assert_eq!(hash.algorithm, "sha256");
        assert_eq!(hash.to_string(), text);
    }

    #[test]
    fn test_sha256_of() {
        // sha256 of the empty string is a well-known constant
        let hash = ArtifactHash::sha256_of(b"");
        assert_eq!(
            hash.to_string(),
            "sha256=e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_checker_accepts_and_rejects() {
        let data = b"hello world";
        let good = ArtifactHash::sha256_of(data);
        let mut sink = Vec::new();
        let mut checker = good.checker(&mut sink).unwrap();
        checker.write_all(data).unwrap();
        assert!(checker.finish().is_ok());
        assert_eq!(sink, data);

        let wrong = ArtifactHash::sha256_of(b"something else");
        let mut sink = Vec::new();
        let mut checker = wrong.checker(&mut sink).unwrap();
        checker.write_all(data).unwrap();
        assert!(checker.finish().is_err());
    }
}
