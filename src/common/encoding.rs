//! Content-coding support for bodies that travel through the proxy.
//!
//! A `Content-Encoding` header may carry a comma-separated stack of codings.
//! Decoding walks the stack right to left, encoding left to right; `identity`
//! is a no-op layer. Unknown codings surface as a distinct error so callers
//! can decide between "leave the body opaque" and "fail the transform".

use std::io::{Read, Write};

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown content-encoding: {0}")]
    UnknownEncoding(String),
    #[error("cannot decode {encoding} body: {source}")]
    DecodeError {
        encoding: String,
        source: std::io::Error,
    },
    #[error("cannot encode {encoding} body: {source}")]
    EncodeError {
        encoding: String,
        source: std::io::Error,
    },
}

/// Splits a `Content-Encoding` header value into its coding stack.
pub fn parse_stack(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Returns true when every coding in the stack is one this module can handle.
pub fn is_supported_stack(header: &str) -> bool {
    parse_stack(header).iter().all(|c| {
        matches!(
            c.as_str(),
            "gzip" | "x-gzip" | "deflate" | "br" | "zstd" | "identity"
        )
    })
}

/// Decodes a body according to a `Content-Encoding` header value, innermost
/// coding first (right to left).
pub fn decode(header: &str, body: &[u8]) -> Result<Bytes, Error> {
    let mut data = body.to_vec();
    for coding in parse_stack(header).iter().rev() {
        data = decode_one(coding, &data)?;
    }
    Ok(Bytes::from(data))
}

/// Encodes a body according to a `Content-Encoding` header value, applying
/// codings left to right so the result matches the header as sent.
pub fn encode(header: &str, body: &[u8]) -> Result<Bytes, Error> {
    let mut data = body.to_vec();
    for coding in parse_stack(header).iter() {
        data = encode_one(coding, &data)?;
    }
    Ok(Bytes::from(data))
}

fn decode_one(coding: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match coding {
        "identity" => return Ok(data.to_vec()),
        "gzip" | "x-gzip" => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|source| Error::DecodeError {
                    encoding: coding.to_string(),
                    source,
                })?;
        }
        "deflate" => {
            // HTTP "deflate" is zlib-wrapped, but raw deflate is seen in the
            // wild; try zlib first and fall back to a raw stream.
            let zlib = flate2::read::ZlibDecoder::new(data).read_to_end(&mut out);
            if zlib.is_err() {
                out.clear();
                flate2::read::DeflateDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|source| Error::DecodeError {
                        encoding: coding.to_string(),
                        source,
                    })?;
            }
        }
        "br" => {
            brotli::Decompressor::new(data, 4096)
                .read_to_end(&mut out)
                .map_err(|source| Error::DecodeError {
                    encoding: coding.to_string(),
                    source,
                })?;
        }
        "zstd" => {
            out = zstd::stream::decode_all(data).map_err(|source| Error::DecodeError {
                encoding: coding.to_string(),
                source,
            })?;
        }
        other => return Err(Error::UnknownEncoding(other.to_string())),
    }
    Ok(out)
}

fn encode_one(coding: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    match coding {
        "identity" => Ok(data.to_vec()),
        "gzip" | "x-gzip" => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|source| Error::EncodeError {
                    encoding: coding.to_string(),
                    source,
                })
        }
        "deflate" => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|source| Error::EncodeError {
                    encoding: coding.to_string(),
                    source,
                })
        }
        "br" => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(data).map_err(|source| Error::EncodeError {
                    encoding: coding.to_string(),
                    source,
                })?;
            }
            Ok(out)
        }
        "zstd" => zstd::stream::encode_all(data, 0).map_err(|source| Error::EncodeError {
            encoding: coding.to_string(),
            source,
        }),
        other => Err(Error::UnknownEncoding(other.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_stack_trims_and_lowercases() {
        assert_eq!(
            parse_stack("BR, identity , gzip"),
            vec!["br".to_string(), "identity".to_string(), "gzip".to_string()]
        );
    }

    #[test]
    fn identity_round_trip() {
        let body = b"hello world";
        let encoded = encode("identity", body).unwrap();
        assert_eq!(encoded.as_ref(), body);
        assert_eq!(decode("identity", &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn gzip_round_trip() {
        let body = b"hello world hello world hello world";
        let encoded = encode("gzip", body).unwrap();
        assert_ne!(encoded.as_ref(), body);
        assert_eq!(decode("gzip", &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn deflate_round_trip() {
        let body = b"some deflate payload";
        let encoded = encode("deflate", body).unwrap();
        assert_eq!(decode("deflate", &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn raw_deflate_is_accepted_on_decode() {
        use std::io::Write;
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"raw stream").unwrap();
        let raw = encoder.finish().unwrap();

        assert_eq!(decode("deflate", &raw).unwrap().as_ref(), b"raw stream");
    }

    #[test]
    fn brotli_round_trip() {
        let body = b"hello";
        let encoded = encode("br", body).unwrap();
        assert_eq!(decode("br", &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn zstd_round_trip() {
        let body = b"zstandard body";
        let encoded = encode("zstd", body).unwrap();
        assert_eq!(decode("zstd", &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn stacked_codings_round_trip() {
        let body = b"stacked content";
        let stack = "br, identity, gzip, identity";
        let encoded = encode(stack, body).unwrap();
        assert_eq!(decode(stack, &encoded).unwrap().as_ref(), body);
    }

    #[test]
    fn unknown_coding_is_a_distinct_error() {
        let err = decode("gzip, frob", b"x").unwrap_err();
        assert!(matches!(err, Error::UnknownEncoding(name) if name == "frob"));
        assert!(!is_supported_stack("gzip, frob"));
        assert!(is_supported_stack("br, identity, gzip"));
    }
}
