//! Gzip for textual responses.
//!
//! Negotiated per request from `accept-encoding` and applied to the origin's
//! body while it streams. Every origin frame is compressed and sync-flushed
//! on its own, so a client still sees each chunk as soon as the origin sends
//! it. Responses the origin already encoded are left alone.

use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{CONTENT_ENCODING, HeaderValue, VARY};
use http::{Method, StatusCode};
use hyper::body::{Body as _, Frame};

use crate::body::{Body, BoxError};
use crate::cache::is_textual;
use crate::headers::HeaderList;

/// Whether the client accepts gzip. An explicit `q=0` is a refusal; `*`
/// counts when gzip is not named.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    let mut wildcard = false;
    for item in accept_encoding.split(',') {
        let mut params = item.split(';');
        let coding = params.next().unwrap_or_default().trim();
        let q = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .next()
            .and_then(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") {
            return q > 0.0;
        }
        if coding == "*" {
            wildcard = q > 0.0;
        }
    }
    wildcard
}

/// Whether an origin response is worth gzipping on its way out.
pub fn should_compress(method: &Method, status: StatusCode, headers: &HeaderList, min_bytes: usize) -> bool {
    if *method == Method::HEAD || !status.is_success() {
        return false;
    }
    // 206 bodies are byte ranges of the identity representation.
    if matches!(status, StatusCode::NO_CONTENT | StatusCode::PARTIAL_CONTENT) {
        return false;
    }
    if headers.contains("content-encoding") || headers.contains("content-range") {
        return false;
    }
    if !headers.get_str("content-type").is_some_and(is_textual) {
        return false;
    }
    let no_transform = headers.get_all("cache-control")
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| d.trim().eq_ignore_ascii_case("no-transform"));
    if no_transform {
        return false;
    }
    let declared = headers.get_str("content-length").and_then(|v| v.parse::<usize>().ok());
    !declared.is_some_and(|len| len < min_bytes)
}

/// Rewrites the head of a response whose body is about to be gzipped.
pub fn mark_encoded(headers: &mut HeaderList) {
    headers.remove("content-length");
    headers.set(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let varies = headers.get_all("vary")
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|f| f.trim().eq_ignore_ascii_case("accept-encoding"));
    if !varies {
        headers.append(VARY, HeaderValue::from_static("accept-encoding"));
    }
}

/// Gzip encoder over another body.
pub struct GzipBody {
    inner: Body,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipBody {
    pub fn new(inner: Body) -> Self {
        Self { inner, encoder: Some(GzEncoder::new(Vec::new(), Compression::default())) }
    }

    /// Writes the gzip trailer and returns whatever the encoder still held.
    fn finish(&mut self) -> Result<Vec<u8>, BoxError> {
        match self.encoder.take() {
            Some(encoder) => Ok(encoder.finish()?),
            None => Ok(Vec::new()),
        }
    }
}

impl hyper::body::Body for GzipBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        loop {
            let Some(encoder) = this.encoder.as_mut() else { return Poll::Ready(None) };
            let frame = match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    this.encoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    return match this.finish() {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(Frame::data(Bytes::from(tail))))),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            };
            // Trailers do not survive re-encoding.
            let Ok(data) = frame.into_data() else { continue };

            if let Err(e) = encoder.write_all(&data).and_then(|()| encoder.flush()) {
                this.encoder = None;
                return Poll::Ready(Some(Err(e.into())));
            }
            let mut out = std::mem::take(encoder.get_mut());
            if this.inner.is_end_stream() {
                match this.finish() {
                    Ok(tail) => out.extend_from_slice(&tail),
                    Err(e) => return Poll::Ready(Some(Err(e))),
                }
            }
            if out.is_empty() {
                continue;
            }
            return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
        }
    }

    fn is_end_stream(&self) -> bool {
        self.encoder.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use http::header::HeaderName;
    use http_body_util::BodyExt;

    use super::*;
    use crate::body::full;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderList {
        pairs.iter()
            .map(|(k, v)| (HeaderName::from_static(k), HeaderValue::from_static(v)))
            .collect()
    }

    #[test]
    fn negotiation() {
        assert!(accepts_gzip("gzip, deflate, br"));
        assert!(accepts_gzip("br;q=1.0, GZIP;q=0.5"));
        assert!(accepts_gzip("*"));
        assert!(!accepts_gzip("gzip;q=0"));
        assert!(!accepts_gzip("gzip;q=0, *"));
        assert!(!accepts_gzip("br, deflate"));
        assert!(!accepts_gzip("identity"));
    }

    #[test]
    fn only_textual_identity_bodies_are_compressed() {
        let json = headers(&[("content-type", "application/json")]);
        assert!(should_compress(&Method::GET, StatusCode::OK, &json, 1024));
        assert!(!should_compress(&Method::HEAD, StatusCode::OK, &json, 1024));
        assert!(!should_compress(&Method::GET, StatusCode::PARTIAL_CONTENT, &json, 1024));
        assert!(!should_compress(&Method::GET, StatusCode::NOT_FOUND, &json, 1024));

        let small = headers(&[("content-type", "text/html"), ("content-length", "12")]);
        assert!(!should_compress(&Method::GET, StatusCode::OK, &small, 1024));

        let encoded = headers(&[("content-type", "text/css"), ("content-encoding", "br")]);
        assert!(!should_compress(&Method::GET, StatusCode::OK, &encoded, 1024));

        let segment = headers(&[("content-type", "video/mp2t")]);
        assert!(!should_compress(&Method::GET, StatusCode::OK, &segment, 1024));

        let pinned = headers(&[("content-type", "text/html"), ("cache-control", "public, no-transform")]);
        assert!(!should_compress(&Method::GET, StatusCode::OK, &pinned, 1024));
    }

    #[test]
    fn encoded_head_drops_length_and_varies_once() {
        let mut h = headers(&[("content-length", "4096"), ("vary", "Accept-Encoding")]);
        mark_encoded(&mut h);
        assert!(!h.contains("content-length"));
        assert_eq!(h.get_str("content-encoding"), Some("gzip"));
        assert_eq!(h.get_all("vary").count(), 1);

        let mut bare = HeaderList::new();
        mark_encoded(&mut bare);
        assert_eq!(bare.get_str("vary"), Some("accept-encoding"));
    }

    #[tokio::test]
    async fn gzip_body_decodes_to_the_original() {
        let text = "{\"rooms\":[1,2,3]}".repeat(200);
        let body = GzipBody::new(full(text.clone()));
        let encoded = body.collect().await.unwrap().to_bytes();
        assert!(encoded.len() < text.len());

        let mut decoded = String::new();
        GzDecoder::new(&encoded[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, text);
    }
}
