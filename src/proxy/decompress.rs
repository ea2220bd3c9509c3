//! Streaming response-body decompression
//!
//! The HTML rewrite stage needs plain text, so compressed bodies are decoded
//! on the fly: the byte stream is bridged into an `AsyncBufRead`, run through
//! the decoder matching the `content-encoding` token, and bridged back into a
//! byte stream. A truncated compressed body ends the stream cleanly instead
//! of erroring, matching what browsers and curl do with prematurely closed
//! connections.

use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{future, Stream, StreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

/// Recognized `content-encoding` tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl ContentEncoding {
    pub fn is_compressed(self) -> bool {
        self != Self::Identity
    }
}

/// Classify the response `content-encoding`. Multi-coding values
/// (`gzip, br`) are not handled and pass through as identity.
pub fn content_encoding(headers: &HeaderMap) -> ContentEncoding {
    let value = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    match value {
        Some("gzip") => ContentEncoding::Gzip,
        Some("deflate") => ContentEncoding::Deflate,
        Some("br") => ContentEncoding::Brotli,
        _ => ContentEncoding::Identity,
    }
}

/// Whether the response has a body worth decompressing.
///
/// 204/304 never carry one. Zero-body detection inspects only the literal
/// `content-length: 0` value; a chunked empty body is not detected here and
/// still enters the decoder, where the truncation leniency keeps it harmless.
pub fn body_is_nonempty(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return false;
    }
    headers.get(CONTENT_LENGTH).map(|v| v.as_bytes()) != Some(b"0".as_slice())
}

/// Decode `stream` according to `encoding`.
///
/// `deflate` sniffs the first body byte: `0x78` is a zlib CMF byte, anything
/// else is treated as raw deflate (real servers mislabel both ways, and
/// permissive decoders are the ecosystem norm). An
/// `io::ErrorKind::UnexpectedEof` from any decoder is downgraded to a clean
/// end of stream; other decode errors propagate and terminate the body.
pub fn decompress_body<S>(stream: S, encoding: ContentEncoding) -> BoxStream<'static, io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    match encoding {
        ContentEncoding::Identity => stream.boxed(),
        ContentEncoding::Gzip => {
            let mut decoder = GzipDecoder::new(StreamReader::new(stream.boxed()));
            decoder.multiple_members(true);
            tolerant(ReaderStream::new(decoder)).boxed()
        }
        ContentEncoding::Brotli => {
            let decoder = BrotliDecoder::new(StreamReader::new(stream.boxed()));
            tolerant(ReaderStream::new(decoder)).boxed()
        }
        ContentEncoding::Deflate => stream::once(async move {
            let mut stream = stream.boxed();
            let first = stream.next().await;
            let zlib = matches!(&first, Some(Ok(chunk)) if chunk.first() == Some(&0x78));
            let rejoined = stream::iter(first).chain(stream);
            let reader = StreamReader::new(rejoined);
            let decoder: Box<dyn AsyncRead + Send + Unpin> = if zlib {
                Box::new(ZlibDecoder::new(reader))
            } else {
                Box::new(DeflateDecoder::new(reader))
            };
            tolerant(ReaderStream::new(decoder))
        })
        .flatten()
        .boxed(),
    }
}

/// End the stream cleanly on unexpected-end-of-input instead of surfacing it.
fn tolerant<S>(stream: S) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    stream.scan((), |_, item| {
        future::ready(match item {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
            other => Some(other),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::{BrotliEncoder, DeflateEncoder, GzipEncoder, ZlibEncoder};
    use futures_util::TryStreamExt;
    use tokio::io::AsyncWriteExt;

    const BODY: &[u8] = b"<html><body>hello compressed world</body></html>";

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    fn chunked(data: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send {
        // split into small chunks so decoding crosses chunk boundaries
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    async fn decode(data: Vec<u8>, encoding: ContentEncoding) -> Vec<u8> {
        decompress_body(chunked(data), encoding)
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[test]
    fn encoding_classification() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_encoding(&headers), ContentEncoding::Identity);
        headers.insert(CONTENT_ENCODING, " gzip ".parse().unwrap());
        assert_eq!(content_encoding(&headers), ContentEncoding::Gzip);
        headers.insert(CONTENT_ENCODING, "deflate".parse().unwrap());
        assert_eq!(content_encoding(&headers), ContentEncoding::Deflate);
        headers.insert(CONTENT_ENCODING, "br".parse().unwrap());
        assert_eq!(content_encoding(&headers), ContentEncoding::Brotli);
        headers.insert(CONTENT_ENCODING, "gzip, br".parse().unwrap());
        assert_eq!(content_encoding(&headers), ContentEncoding::Identity);
    }

    #[test]
    fn empty_body_detection() {
        let mut headers = HeaderMap::new();
        assert!(body_is_nonempty(StatusCode::OK, &headers));
        assert!(!body_is_nonempty(StatusCode::NO_CONTENT, &headers));
        assert!(!body_is_nonempty(StatusCode::NOT_MODIFIED, &headers));
        headers.insert(CONTENT_LENGTH, "0".parse().unwrap());
        assert!(!body_is_nonempty(StatusCode::OK, &headers));
        headers.insert(CONTENT_LENGTH, "42".parse().unwrap());
        assert!(body_is_nonempty(StatusCode::OK, &headers));
    }

    #[tokio::test]
    async fn decodes_gzip() {
        let encoded = gzip(BODY).await;
        assert_eq!(decode(encoded, ContentEncoding::Gzip).await, BODY);
    }

    #[tokio::test]
    async fn decodes_brotli() {
        let mut encoder = BrotliEncoder::new(Vec::new());
        encoder.write_all(BODY).await.unwrap();
        encoder.shutdown().await.unwrap();
        let encoded = encoder.into_inner();
        assert_eq!(decode(encoded, ContentEncoding::Brotli).await, BODY);
    }

    #[tokio::test]
    async fn decodes_zlib_flavoured_deflate() {
        let mut encoder = ZlibEncoder::new(Vec::new());
        encoder.write_all(BODY).await.unwrap();
        encoder.shutdown().await.unwrap();
        let encoded = encoder.into_inner();
        assert_eq!(encoded[0], 0x78);
        assert_eq!(decode(encoded, ContentEncoding::Deflate).await, BODY);
    }

    #[tokio::test]
    async fn decodes_raw_deflate() {
        let mut encoder = DeflateEncoder::new(Vec::new());
        encoder.write_all(BODY).await.unwrap();
        encoder.shutdown().await.unwrap();
        let encoded = encoder.into_inner();
        assert_eq!(decode(encoded, ContentEncoding::Deflate).await, BODY);
    }

    #[tokio::test]
    async fn truncated_gzip_ends_cleanly() {
        let mut encoded = gzip(BODY).await;
        // cut into the trailer so the decoder hits EOF mid-stream
        encoded.truncate(encoded.len() - 10);
        let decoded = decode(encoded, ContentEncoding::Gzip).await;
        // whatever was already decoded is kept, and no error surfaces
        assert!(BODY.starts_with(&decoded));
    }

    #[tokio::test]
    async fn garbage_gzip_surfaces_an_error() {
        let result: io::Result<Vec<Bytes>> =
            decompress_body(chunked(b"definitely not gzip data".to_vec()), ContentEncoding::Gzip)
                .try_collect()
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn identity_passes_through() {
        assert_eq!(decode(BODY.to_vec(), ContentEncoding::Identity).await, BODY);
    }
}
