use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgo {
    Sha1,
    Md5,
    Adler32,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Sha1 => "sha1",
            ChecksumAlgo::Md5 => "md5",
            ChecksumAlgo::Adler32 => "adler32",
        }
    }

    pub fn all() -> [ChecksumAlgo; 3] {
        [ChecksumAlgo::Sha1, ChecksumAlgo::Md5, ChecksumAlgo::Adler32]
    }
}

impl Display for ChecksumAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ChecksumAlgo {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "sha1" => ChecksumAlgo::Sha1,
            "md5" => ChecksumAlgo::Md5,
            "adler32" => ChecksumAlgo::Adler32,
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "unknown checksum algorithm {s:?}"
                )))
            }
        })
    }
}

try_from_str_boilerplate!(ChecksumAlgo);

/// A checksum value as stored on a node, one per algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub raw: Vec<u8>,
}

impl Checksum {
    pub fn from_hex(algo: ChecksumAlgo, hex: &str) -> Result<Checksum> {
        let raw = data_encoding::HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map_err(|_| {
                FsError::InvalidArgument(format!("invalid {algo} checksum {hex:?}"))
            })?;
        Ok(Checksum { algo, raw })
    }

    pub fn hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.raw)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.algo, self.hex())
    }
}
