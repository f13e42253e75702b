//! Server half of the upgrade handshake: request parsing, validation and the
//! 101/4xx response exchange.

use std::{collections::HashSet, io::Write as _};

use bytes::BytesMut;
use http::{HeaderMap, Request as HttpRequest, Response as HttpResponse, StatusCode};
use httparse::Status;
use monoio::io::{stream::Stream, AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use monoio_codec::{Decoded, Decoder, FramedRead};

use super::{
    derive_accept_key,
    headers::{FromHttparse, MAX_HEADERS},
};
use crate::{
    error::{Error, ProtocolError, RejectionKind, Result},
    protocol::{Connection, ConnectionConfig},
};

/// Server request type.
pub type Request = HttpRequest<()>;

/// Server response type.
pub type Response = HttpResponse<()>;

/// Upper bound for the upgrade request head. A well-formed handshake fits in
/// a fraction of this; anything larger without a terminating blank line is
/// rejected rather than buffered forever.
const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// What the validator holds a handshake against.
///
/// Built once at startup and shared read-only between all sessions.
#[derive(Debug, Clone, Default)]
pub struct AcceptPolicy {
    host: Option<String>,
    allowed_origins: Option<HashSet<String>>,
}

impl AcceptPolicy {
    /// Creates a policy pinning the `Host` header to the given `host:port`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            allowed_origins: None,
        }
    }

    /// Creates a policy that skips the host and origin checks, for embedders
    /// that front the server with their own routing.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Enables origin checking against the given set. Browsers always send
    /// `Origin`; with checking enabled a request without one is rejected.
    pub fn allow_origins<I, T>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.allowed_origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }
}

/// Runs the validation checks against a parsed upgrade request.
///
/// The checks run in the fixed order host, upgrade, connection, version,
/// key, origin; the first failure wins. Pure: revalidating the same request
/// always produces the same result.
///
/// On success returns the derived `Sec-WebSocket-Accept` value.
pub fn validate_upgrade(request: &Request, policy: &AcceptPolicy) -> Result<String, RejectionKind> {
    let headers = request.headers();

    if let Some(expected) = &policy.host {
        if header_str(headers, "Host") != Some(expected.as_str()) {
            return Err(RejectionKind::BadHost);
        }
    }

    if !header_str(headers, "Upgrade")
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(RejectionKind::BadUpgrade);
    }

    if !header_str(headers, "Connection")
        .map(|h| {
            h.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("Upgrade"))
        })
        .unwrap_or(false)
    {
        return Err(RejectionKind::BadConnection);
    }

    if header_str(headers, "Sec-WebSocket-Version") != Some("13") {
        return Err(RejectionKind::UnsupportedVersion);
    }

    let key = header_str(headers, "Sec-WebSocket-Key")
        .filter(|key| {
            // The key must be the base64 of exactly 16 random bytes.
            data_encoding::BASE64
                .decode(key.as_bytes())
                .map(|decoded| decoded.len() == 16)
                .unwrap_or(false)
        })
        .ok_or(RejectionKind::BadKey)?;

    if let Some(allowed) = &policy.allowed_origins {
        if !header_str(headers, "Origin")
            .map(|origin| allowed.contains(origin))
            .unwrap_or(false)
        {
            return Err(RejectionKind::BadOrigin);
        }
    }

    Ok(derive_accept_key(key.as_bytes()))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Performs the server side of the upgrade handshake.
///
/// Reads one HTTP request from `stream`, validates it against `policy` and
/// answers with `101 Switching Protocols` or the matching error status. On
/// success the stream, along with any bytes already buffered past the
/// request head, becomes an open [`Connection`].
pub async fn server_handshake<S>(
    stream: S,
    policy: &AcceptPolicy,
    config: Option<ConnectionConfig>,
) -> Result<Connection<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let mut framed = FramedRead::new(stream, RequestDecoder::default());

    let (size, request) = match framed.next().await {
        Some(Ok(decoded)) => decoded,
        Some(Err(err)) => {
            log::warn!("malformed handshake request: {err}");
            let _ = respond(framed.get_mut(), error_response(StatusCode::BAD_REQUEST)?).await;
            return Err(err);
        }
        None => return Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
    };

    if framed.read_buffer().len() != size {
        let _ = respond(framed.get_mut(), error_response(StatusCode::BAD_REQUEST)?).await;
        return Err(Error::Protocol(ProtocolError::JunkAfterRequest));
    }

    match validate_upgrade(&request, policy) {
        Ok(accept_key) => {
            respond(framed.get_mut(), switching_protocols(&request, &accept_key)?).await?;
            log::debug!("connection upgraded: {}", request.uri());

            framed.read_buffer_mut().clear();
            Ok(Connection::from_framed_read(framed, config))
        }

        Err(kind) => {
            log::warn!("handshake rejected ({kind}): {}", request.uri());
            respond(framed.get_mut(), error_response(kind.status())?).await?;
            Err(Error::Rejected(kind))
        }
    }
}

/// Builds the success response for a validated request.
fn switching_protocols(request: &Request, accept_key: &str) -> Result<Response> {
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .version(request.version())
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(())?)
}

fn error_response(status: StatusCode) -> Result<Response> {
    Ok(Response::builder().status(status).body(())?)
}

/// Serializes `response` and writes it out, flushing before returning. The
/// caller drops the stream afterwards on the error path, which closes the
/// socket only once the response has left the buffer.
async fn respond<S>(stream: &mut S, response: Response) -> Result<()>
where
    S: AsyncWriteRent,
{
    let mut buf = Vec::with_capacity(256);

    write!(
        buf,
        "{version:?} {status}\r\n",
        version = response.version(),
        status = response.status()
    )?;

    for (name, value) in response.headers() {
        buf.extend_from_slice(name.as_ref());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_ref());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    let (res, _) = stream.write_all(buf).await;
    res?;
    stream.flush().await?;
    Ok(())
}

/// Decoder for the upgrade request head.
///
/// Consumes nothing until a full head (terminated by a blank line) is
/// buffered, so a request split across arbitrary chunk boundaries parses the
/// same as one that arrived whole.
#[derive(Debug, Clone, Copy)]
pub struct RequestDecoder {
    max_size: usize,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self {
            max_size: MAX_REQUEST_SIZE,
        }
    }
}

impl Decoder for RequestDecoder {
    type Item = (usize, Request);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut hbuffer);

        match req.parse(src)? {
            Status::Partial if src.len() > self.max_size => {
                Err(Error::Protocol(ProtocolError::OversizedHandshake))
            }
            Status::Partial => Ok(Decoded::Insufficient),
            Status::Complete(size) => Ok(Decoded::Some((size, Request::from_httparse(req)?))),
        }
    }
}

impl<'h, 'b: 'h> FromHttparse<httparse::Request<'h, 'b>> for Request {
    fn from_httparse(raw: httparse::Request<'h, 'b>) -> Result<Self> {
        if raw.method.expect("Bug: no method in header") != "GET" {
            return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
        }

        // httparse only produces 0.9/1.0/1.1, so 1 means exactly HTTP/1.1.
        if raw.version.expect("Bug: no HTTP version") < 1 {
            return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
        }

        let headers = HeaderMap::from_httparse(raw.headers)?;

        let mut request = Request::new(());
        *request.method_mut() = http::Method::GET;
        *request.headers_mut() = headers;
        *request.uri_mut() = raw.path.expect("Bug: no path in header").parse()?;
        *request.version_mut() = http::Version::HTTP_11;

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(data: &[u8]) -> Result<Decoded<(usize, Request)>> {
        RequestDecoder::default().decode(&mut BytesMut::from(data))
    }

    fn parse(data: &[u8]) -> Request {
        match decode(data).unwrap() {
            Decoded::Some((_, request)) => request,
            other => panic!("unexpected: {other:?}"),
        }
    }

    const GOOD: &[u8] = b"\
        GET /chat HTTP/1.1\r\n\
        Host: localhost:3001\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://localhost:3000\r\n\
        \r\n";

    fn policy() -> AcceptPolicy {
        AcceptPolicy::new("localhost:3001").allow_origins(["http://localhost:3000"])
    }

    #[test]
    fn request_parsing() {
        let request = parse(b"GET /script.ws HTTP/1.1\r\nHost: foo.com\r\n\r\n");
        assert_eq!(request.uri().path(), "/script.ws");
        assert_eq!(request.headers().get("Host").unwrap(), &b"foo.com"[..]);
    }

    #[test]
    fn request_split_across_chunks_stays_pending() {
        let partial = &GOOD[..GOOD.len() - 2];
        assert!(matches!(decode(partial).unwrap(), Decoded::Insufficient));
    }

    #[test]
    fn non_get_method_fails() {
        let result = decode(b"POST /chat HTTP/1.1\r\nHost: foo.com\r\n\r\n");
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::WrongHttpMethod))
        ));
    }

    #[test]
    fn old_http_version_fails() {
        let result = decode(b"GET /chat HTTP/1.0\r\nHost: foo.com\r\n\r\n");
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::WrongHttpVersion))
        ));
    }

    #[test]
    fn missing_request_line_fails() {
        assert!(decode(b"Host: foo.com\r\n\r\n").is_err());
    }

    #[test]
    fn oversized_head_fails() {
        let mut data = b"GET /chat HTTP/1.1\r\n".to_vec();
        data.extend(std::iter::repeat(b'a').take(MAX_REQUEST_SIZE + 1));
        // No terminating blank line in sight.
        assert!(matches!(
            decode(&data),
            Err(Error::Protocol(ProtocolError::OversizedHandshake))
        ));
    }

    #[test]
    fn valid_request_is_accepted() {
        let accept = validate_upgrade(&parse(GOOD), &policy()).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn validation_is_idempotent() {
        let request = parse(GOOD);
        let first = validate_upgrade(&request, &policy());
        let second = validate_upgrade(&request, &policy());
        assert_eq!(first, second);
    }

    fn without(name: &str) -> Request {
        let mut request = parse(GOOD);
        request.headers_mut().remove(name);
        request
    }

    #[test]
    fn each_missing_header_maps_to_its_kind() {
        for (name, kind) in [
            ("Host", RejectionKind::BadHost),
            ("Upgrade", RejectionKind::BadUpgrade),
            ("Connection", RejectionKind::BadConnection),
            ("Sec-WebSocket-Version", RejectionKind::UnsupportedVersion),
            ("Sec-WebSocket-Key", RejectionKind::BadKey),
            ("Origin", RejectionKind::BadOrigin),
        ] {
            assert_eq!(validate_upgrade(&without(name), &policy()), Err(kind));
        }
    }

    #[test]
    fn first_defect_in_order_is_reported() {
        // Both the version and the host are wrong; the host check runs first.
        let mut request = parse(GOOD);
        request
            .headers_mut()
            .insert("Sec-WebSocket-Version", "8".parse().unwrap());
        request
            .headers_mut()
            .insert("Host", "evil.example".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::BadHost)
        );

        // With the host restored, the version defect surfaces.
        request
            .headers_mut()
            .insert("Host", "localhost:3001".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::UnsupportedVersion)
        );
    }

    #[test]
    fn host_must_match_exactly() {
        let mut request = parse(GOOD);
        request
            .headers_mut()
            .insert("Host", "localhost:9999".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::BadHost)
        );
    }

    #[test]
    fn upgrade_header_is_case_insensitive() {
        let mut request = parse(GOOD);
        request
            .headers_mut()
            .insert("Upgrade", "WebSocket".parse().unwrap());
        assert!(validate_upgrade(&request, &policy()).is_ok());
    }

    #[test]
    fn connection_tokens_are_trimmed_and_case_insensitive() {
        let mut request = parse(GOOD);
        request
            .headers_mut()
            .insert("Connection", "keep-alive ,  upgrade".parse().unwrap());
        assert!(validate_upgrade(&request, &policy()).is_ok());

        request
            .headers_mut()
            .insert("Connection", "keep-alive".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::BadConnection)
        );
    }

    #[test]
    fn key_must_decode_to_sixteen_bytes() {
        let mut request = parse(GOOD);
        // Valid base64 of 12 bytes, not 16.
        request
            .headers_mut()
            .insert("Sec-WebSocket-Key", "c2hvcnQga2V5Ng==".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::BadKey)
        );

        // Not base64 at all.
        request
            .headers_mut()
            .insert("Sec-WebSocket-Key", "!!!".parse().unwrap());
        assert_eq!(
            validate_upgrade(&request, &policy()),
            Err(RejectionKind::BadKey)
        );
    }

    #[test]
    fn disallowed_origin_is_forbidden() {
        let mut request = parse(GOOD);
        request
            .headers_mut()
            .insert("Origin", "http://evil.example".parse().unwrap());

        let kind = validate_upgrade(&request, &policy()).unwrap_err();
        assert_eq!(kind, RejectionKind::BadOrigin);
        assert_eq!(kind.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn origin_is_ignored_when_checking_disabled() {
        let policy = AcceptPolicy::new("localhost:3001");
        let request = without("Origin");
        assert!(validate_upgrade(&request, &policy).is_ok());
    }

    #[test]
    fn permissive_policy_skips_host_and_origin() {
        let mut request = without("Origin");
        request.headers_mut().remove("Host");
        assert!(validate_upgrade(&request, &AcceptPolicy::permissive()).is_ok());
    }
}
