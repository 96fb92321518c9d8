use kosh_compress::Compression;

/// A blob as it exists on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    /// Hex-encoded BLAKE3 hash of the *uncompressed* bytes
    pub hash: String,
    /// How the bytes are encoded on disk, as told by the file extension
    pub compression: Compression,
    /// Size on disk, after compression
    pub size: u64,
}
impl Blob {
    pub(crate) fn new(hash: impl Into<String>, compression: Compression, size: u64) -> Self {
        Self { hash: hash.into(), compression, size }
    }
}
