//! Chunk compression settings.
use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use zarrs::{
    array::codec::{Bz2Codec, Bz2CompressionLevel, GzipCodec},
    metadata::v2::MetadataV2,
};

use crate::Error;

/// Compressor applied to each chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Compression {
    /// Uncompressed.
    Raw,
    Gzip {
        /// 0..=9; default 6.
        #[serde(default = "default_gzip_level")]
        level: u32,
    },
    Bz2 {
        /// 1..=9; default 9.
        #[serde(default = "default_bz2_level")]
        level: u32,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Self::Gzip {
            level: default_gzip_level(),
        }
    }
}

fn default_gzip_level() -> u32 {
    6
}

fn default_bz2_level() -> u32 {
    9
}

impl Compression {
    fn validate(&self) -> crate::Result<()> {
        match *self {
            Compression::Gzip { level } if level > 9 => Err(Error::invalid_option(
                "compression",
                format!("invalid gzip compression level {level}"),
            )),
            Compression::Bz2 { level } if !(1..=9).contains(&level) => Err(Error::invalid_option(
                "compression",
                format!("invalid bz2 compression level {level}"),
            )),
            _ => Ok(()),
        }
    }

    /// Convert to a bytes-to-bytes codec for Zarr V3 arrays.
    pub fn to_bytes_to_bytes_codec(
        &self,
    ) -> crate::Result<Option<Arc<dyn zarrs_codec::BytesToBytesCodecTraits>>> {
        self.validate()?;
        match *self {
            Compression::Raw => Ok(None),
            Compression::Gzip { level } => Ok(Some(Arc::new(
                GzipCodec::new(level).map_err(Error::wrap)?,
            ))),
            Compression::Bz2 { level } => Ok(Some(Arc::new(Bz2Codec::new(
                Bz2CompressionLevel::new(level)
                    .map_err(|n| Error::general(format!("invalid bz2 level {n}")))?,
            )))),
        }
    }

    /// The `compressor` member of Zarr V2 array metadata; `None` when uncompressed.
    pub fn to_v2_compressor(&self) -> crate::Result<Option<MetadataV2>> {
        self.validate()?;
        let compressor = match *self {
            Compression::Raw => return Ok(None),
            Compression::Gzip { level } => serde_json::json!({"id": "gzip", "level": level}),
            Compression::Bz2 { level } => serde_json::json!({"id": "bz2", "level": level}),
        };
        Ok(Some(serde_json::from_value(compressor)?))
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::Raw => f.write_str("raw"),
            Compression::Gzip { level } => write!(f, "gzip:{level}"),
            Compression::Bz2 { level } => write!(f, "bz2:{level}"),
        }
    }
}

/// Parses `raw`, `gzip`, `gzip:<level>`, `bz2` or `bz2:<level>`.
impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => {
                let level: u32 = level.parse().map_err(|_| {
                    Error::invalid_option("compression", format!("invalid level in {s:?}"))
                })?;
                (name, Some(level))
            }
            None => (s.as_str(), None),
        };
        let compression = match name {
            "raw" | "none" => Compression::Raw,
            "gzip" => Compression::Gzip {
                level: level.unwrap_or_else(default_gzip_level),
            },
            "bz2" | "bzip2" => Compression::Bz2 {
                level: level.unwrap_or_else(default_bz2_level),
            },
            _ => {
                return Err(Error::invalid_option(
                    "compression",
                    format!("unknown compressor {name:?}"),
                ));
            }
        };
        compression.validate()?;
        Ok(compression)
    }
}
