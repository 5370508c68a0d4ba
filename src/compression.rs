//! Wire-level message compression. Compressors are negotiated during the handshake by
//! intersecting the client's configured list with the one the server advertises; responses
//! are decompressed according to the compressor id carried in each OP_COMPRESSED frame.

#[cfg(feature = "zlib-compression")]
use std::io::Write;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
#[cfg(feature = "snappy-compression")]
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
#[cfg(feature = "zlib-compression")]
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;

/// Enum representing supported compressor algorithms.
/// Used for compressing outbound messages.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// Zlib compressor. The level must be between -1 and 9, where -1 selects the zlib
    /// default.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// The compression level.
        level: Option<i32>,
    },
    /// Snappy compressor.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
            #[cfg(not(any(feature = "zlib-compression", feature = "snappy-compression")))]
            _ => unreachable!(),
        }
    }

    pub(crate) fn id(&self) -> u8 {
        match self {
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => SNAPPY_COMPRESSOR_ID,
            #[cfg(not(any(feature = "zlib-compression", feature = "snappy-compression")))]
            _ => unreachable!(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level: Some(level) } if !(-1..=9).contains(level) => {
                Err(Error::invalid_argument(format!(
                    "invalid zlib compression level: {}",
                    level
                )))
            }
            _ => Ok(()),
        }
    }

    /// Parses a compressor name as given in client options. Names for algorithms whose
    /// feature flag is disabled are rejected.
    pub(crate) fn from_name(name: &str) -> Result<Self> {
        match name {
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Compressor::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Compressor::Snappy),
            other => Err(Error::invalid_argument(format!(
                "unsupported or disabled compressor: {}",
                other
            ))),
        }
    }

    pub(crate) fn parse_list(names: &[String]) -> Result<Vec<Self>> {
        names.iter().map(|name| Self::from_name(name)).collect()
    }

    /// Selects, from the client's configured compressors, the first one the server also
    /// supports.
    pub(crate) fn negotiate(
        configured: &[Compressor],
        server_advertised: &[String],
    ) -> Option<Compressor> {
        configured
            .iter()
            .find(|compressor| {
                server_advertised
                    .iter()
                    .any(|name| name == compressor.name())
            })
            .cloned()
    }

    pub(crate) fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { level } => {
                let compression = match level {
                    Some(level) if *level != -1 => flate2::Compression::new(*level as u32),
                    _ => flate2::Compression::default(),
                };
                let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), compression);
                encoder.write_all(bytes).map_err(compression_error)?;
                encoder.finish().map_err(compression_error)
            }
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder.compress_vec(bytes).map_err(|err| {
                    compression_error(std::io::Error::new(std::io::ErrorKind::Other, err))
                })
            }
            #[cfg(not(any(feature = "zlib-compression", feature = "snappy-compression")))]
            _ => {
                let _ = bytes;
                unreachable!()
            }
        }
    }
}

/// Enum representing supported decompressor algorithms.
/// Used for decompressing inbound responses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Decoder {
    Noop,
    #[cfg(feature = "zlib-compression")]
    Zlib,
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Decoder {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            NOOP_COMPRESSOR_ID => Ok(Decoder::Noop),
            #[cfg(feature = "zlib-compression")]
            ZLIB_COMPRESSOR_ID => Ok(Decoder::Zlib),
            #[cfg(feature = "snappy-compression")]
            SNAPPY_COMPRESSOR_ID => Ok(Decoder::Snappy),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("unsupported compressor id: {}", other),
            }
            .into()),
        }
    }

    pub(crate) fn decompress(&self, source: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decoder::Noop => Ok(source.to_vec()),
            #[cfg(feature = "zlib-compression")]
            Decoder::Zlib => {
                use std::io::Read;
                let mut decoder = flate2::read::ZlibDecoder::new(source);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).map_err(compression_error)?;
                Ok(out)
            }
            #[cfg(feature = "snappy-compression")]
            Decoder::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                decoder.decompress_vec(source).map_err(|err| {
                    compression_error(std::io::Error::new(std::io::ErrorKind::Other, err))
                })
            }
        }
    }
}

#[allow(dead_code)]
fn compression_error(err: std::io::Error) -> Error {
    ErrorKind::InvalidResponse {
        message: format!("compression failure: {}", err),
    }
    .into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn noop_decoder_passes_bytes_through() {
        let decoder = Decoder::from_u8(NOOP_COMPRESSOR_ID).unwrap();
        assert_eq!(decoder.decompress(b"hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn unknown_compressor_id_is_rejected() {
        assert!(Decoder::from_u8(200).is_err());
    }

    #[cfg(feature = "zlib-compression")]
    #[test]
    fn zlib_round_trip() {
        let compressor = Compressor::Zlib { level: Some(6) };
        let payload = vec![42u8; 4096];
        let compressed = compressor.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let decompressed = Decoder::Zlib.decompress(&compressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn snappy_round_trip() {
        let payload = vec![7u8; 2048];
        let compressed = Compressor::Snappy.compress(&payload).unwrap();
        let decompressed = Decoder::Snappy.decompress(&compressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn negotiation_intersects_client_and_server_lists() {
        let advertised = vec!["snappy".to_string(), "zlib".to_string()];

        #[cfg(feature = "zlib-compression")]
        {
            let configured = vec![Compressor::Zlib { level: None }];
            assert_eq!(
                Compressor::negotiate(&configured, &advertised),
                Some(Compressor::Zlib { level: None })
            );
        }

        let none: Vec<Compressor> = Vec::new();
        assert_eq!(Compressor::negotiate(&none, &advertised), None);
    }
}
