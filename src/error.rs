use thiserror::Error;

/// Errors produced while scanning or decompressing a bzip2 stream.
///
/// The `Display` strings are stable and observed by callers; the variants
/// distinguish failures of the input source, the stream framing, the
/// per-block payload and the cross-block checksums.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The underlying byte source failed or was truncated.
    #[error("{0}")]
    Input(String),

    /// The stream header could not be read at all.
    #[error("failed to read stream header: {0}")]
    StreamHeader(String),

    /// Fewer than four header bytes were available.
    #[error("stream header is too small: {0}")]
    HeaderTooSmall(usize),

    #[error("wrong file magic: {first:02x}{second:02x}")]
    WrongFileMagic { first: u8, second: u8 },

    #[error("wrong version: {0}")]
    WrongVersion(char),

    #[error("bad block size: {0}")]
    BadBlockSize(char),

    /// The look-ahead window was exhausted without finding a block magic.
    #[error("failed to find next block within expected max buffer size of {0}")]
    BlockNotFound(usize),

    /// No end-of-stream trailer at the end of the input.
    #[error("failed to find trailer")]
    Trailer,

    /// The block payload violates the bzip2 structural rules.
    #[error("bzip2 data invalid: {0}")]
    Structural(String),

    /// Computed block CRC differs from the CRC stored in the block header.
    #[error("block checksum mismatch")]
    BlockCrc,

    /// Running stream CRC differs from the CRC stored in the trailer.
    #[error("mismatched stream CRCs: calculated=0x{calculated:08x} != stored=0x{stored:08x}")]
    StreamCrc { calculated: u32, stored: u32 },

    #[error("operation canceled")]
    Canceled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Input(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn canonical_strings() {
        assert_eq!(
            Error::WrongFileMagic {
                first: 0x01,
                second: 0x5a
            }
            .to_string(),
            "wrong file magic: 015a"
        );
        assert_eq!(Error::WrongVersion('i').to_string(), "wrong version: i");
        assert_eq!(Error::BadBlockSize('x').to_string(), "bad block size: x");
        assert_eq!(
            Error::BlockNotFound(930720).to_string(),
            "failed to find next block within expected max buffer size of 930720"
        );
        assert_eq!(Error::Trailer.to_string(), "failed to find trailer");
        assert_eq!(
            Error::StreamCrc {
                calculated: 0x4eece836,
                stored: 0x0000ff00
            }
            .to_string(),
            "mismatched stream CRCs: calculated=0x4eece836 != stored=0x0000ff00"
        );
        assert_eq!(Error::BlockCrc.to_string(), "block checksum mismatch");
        assert_eq!(
            Error::Structural("data exceeds block size".into()).to_string(),
            "bzip2 data invalid: data exceeds block size"
        );
        assert_eq!(
            Error::StreamHeader("EOF".into()).to_string(),
            "failed to read stream header: EOF"
        );
        assert_eq!(
            Error::HeaderTooSmall(3).to_string(),
            "stream header is too small: 3"
        );
    }
}
