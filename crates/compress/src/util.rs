use crate::Compression;
use std::fmt::{Display, Formatter, Result as FmtResult};

const RAW_EXTENSION: &str = ".raw";
const ZSTD_EXTENSION: &str = ".zst";

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl AsRef<str> for Compression {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl Compression {
    /// Returns the file extension (including the dot) used on disk.
    #[inline]
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => RAW_EXTENSION,
            Compression::ZstdFast | Compression::Zstd => ZSTD_EXTENSION,
        }
    }

    /// Every extension a blob can be stored under, raw first.
    #[must_use]
    pub fn extensions() -> [&'static str; 2] {
        [RAW_EXTENSION, ZSTD_EXTENSION]
    }

    /// Returns the short name used in configuration and logs.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::ZstdFast => "zstd-fast",
            Compression::Zstd => "zstd",
        }
    }

    /// Whether the on-disk bytes need decoding.
    #[inline]
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Verify that `bytes` start with what this format would produce.
    ///
    /// Both zstd tiers share a frame header, so only compressed-vs-raw is
    /// distinguishable from content.
    #[must_use]
    pub fn check_magic_bytes(&self, bytes: &[u8]) -> bool {
        Self::from_magic_bytes(bytes).is_compressed() == self.is_compressed()
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[rstest]
    #[case(Compression::None, ".raw")]
    #[case(Compression::ZstdFast, ".zst")]
    #[case(Compression::Zstd, ".zst")]
    fn test_extension(#[case] format: Compression, #[case] expected: &str) {
        assert_eq!(format.extension(), expected);
    }

    #[test]
    fn test_check_magic_bytes() {
        let compressed = Compression::Zstd.compress(b"some payload").unwrap();
        assert!(Compression::Zstd.check_magic_bytes(&compressed));
        assert!(Compression::ZstdFast.check_magic_bytes(&compressed));
        assert!(!Compression::None.check_magic_bytes(&compressed));
        assert!(Compression::None.check_magic_bytes(b"<p>plain</p>"));
        assert!(!Compression::Zstd.check_magic_bytes(b"<p>plain</p>"));
    }
}
