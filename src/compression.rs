//! Gzip transcoding of message bodies
//!
//! Recordings keep bodies decompressed so they can be sanitized and matched.
//! Bodies are compressed again when served to a client that expects
//! `Content-Encoding: gzip`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::model::Headers;
use crate::Result;

/// Whether the headers declare a gzip encoded body
#[must_use]
pub fn is_gzip(headers: &Headers) -> bool {
    headers.get("Content-Encoding").is_some_and(|values| {
        values
            .iter()
            .flat_map(|value| value.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("gzip"))
    })
}

/// Decompress `body` if the headers declare gzip.
///
/// A body that does not decode as gzip is returned unchanged; some clients
/// keep the header after the transport layer already inflated the payload.
#[must_use]
pub fn decompress_body(body: &[u8], headers: &Headers) -> Vec<u8> {
    if !is_gzip(headers) || body.is_empty() {
        return body.to_vec();
    }

    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::with_capacity(body.len() * 2);
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => decompressed,
        Err(e) => {
            debug!("Body declared gzip but did not decode ({e}), keeping raw bytes");
            body.to_vec()
        }
    }
}

/// Compress `body` if the headers declare gzip
///
/// # Errors
///
/// Returns error if the encoder fails
pub fn compress_body(body: &[u8], headers: &Headers) -> Result<Vec<u8>> {
    if !is_gzip(headers) || body.is_empty() {
        return Ok(body.to_vec());
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}
