use crate::Compression;
use crate::error::{Error, ErrorKind};
use std::{path::Path, str::FromStr};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

impl FromStr for Compression {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "raw" => Ok(Compression::None),
            "zstd-fast" | "fast" => Ok(Compression::ZstdFast),
            "zst" | "zstd" => Ok(Compression::Zstd),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}
impl From<&[u8]> for Compression {
    fn from(value: &[u8]) -> Self {
        Compression::from_magic_bytes(value)
    }
}
impl Compression {
    /// Detect compression from a file extension.
    ///
    /// The level a `.zst` file was written with cannot be recovered from its
    /// name, so both zstd tiers come back as [`Compression::Zstd`].
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| match ext.to_lowercase().as_str() {
                "zst" => Compression::Zstd,
                _ => Compression::None,
            })
            .unwrap_or(Compression::None)
    }

    /// Detect compression format from magic bytes.
    ///
    /// Returns `None` variant if the input is too short or isn't a zstd frame.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Self {
        if bytes.starts_with(&ZSTD_MAGIC) {
            return Compression::Zstd;
        }
        Compression::None
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[rstest]
    #[case("none", Compression::None)]
    #[case("RAW", Compression::None)]
    #[case("fast", Compression::ZstdFast)]
    #[case("zstd-fast", Compression::ZstdFast)]
    #[case("zst", Compression::Zstd)]
    #[case("ZSTD", Compression::Zstd)]
    fn test_from_str(#[case] input: &str, #[case] expected: Compression) {
        assert_eq!(input.parse::<Compression>().unwrap(), expected);
    }

    #[test]
    fn test_from_str_unsupported() {
        assert!("bzip2".parse::<Compression>().is_err());
        assert!("".parse::<Compression>().is_err());
    }

    #[rstest]
    #[case("html/ab/cd/abcdef.raw", Compression::None)]
    #[case("html/ab/cd/abcdef.zst", Compression::Zstd)]
    #[case("ssr/d2/ab/cd/abcdef.ZST", Compression::Zstd)]
    #[case("abcdef", Compression::None)]
    fn test_from_path(#[case] input: &str, #[case] expected: Compression) {
        assert_eq!(Compression::from_path(input), expected);
    }

    #[rstest]
    #[case(&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd)]
    #[case(&[0x28, 0xB5, 0x2F], Compression::None)]
    #[case(b"<html>", Compression::None)]
    #[case(&[], Compression::None)]
    fn test_from_magic_bytes(#[case] input: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::from_magic_bytes(input), expected);
    }
}
