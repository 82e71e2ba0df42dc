//! Pinned TLS transport.
//!
//! Both the HTTP client and the websocket dial through one rustls config
//! whose certificate verifier requires that at least one certificate in
//! the peer chain has `SHA256(SubjectPublicKeyInfo DER)` equal to the
//! configured fingerprint. With `skipTLSCheck` unset the chain is also
//! validated against the webpki roots; the pin is enforced either way,
//! during the handshake, before any application byte leaves the socket.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};

const PIN_MISMATCH_MSG: &str = "TLS key pin mismatch";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// An HTTP status/body pair. Non-2xx responses are returned, not raised;
/// the caller decides whether they are terminal.
#[derive(Debug)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body bytes
    pub body: Vec<u8>,
}

impl Response {
    /// Whether the status is outside the 2xx range.
    pub fn is_error(&self) -> bool {
        self.status < 200 || self.status >= 300
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Into::into)
    }
}

/// Host, port and path of an `https://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name
    pub host: String,
    /// Port, 443 unless given
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub path: String,
}

/// Split an `https://host[:port][/path]` URL.
pub fn parse_https_url(url: &str) -> Result<Endpoint> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| Error::Config(format!("not an https:// URL: {url}")))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h,
            p.parse::<u16>()
                .map_err(|_| Error::Config(format!("bad port in {url}")))?,
        ),
        None => (authority, 443),
    };
    if host.is_empty() {
        return Err(Error::Config(format!("empty host in {url}")));
    }
    Ok(Endpoint {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Percent-encode a query component (RFC 3986 unreserved set).
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ─── SPKI extraction ────────────────────────────────────────────────────

/// Read one DER TLV at `pos`; returns (tag, content range) and leaves
/// `pos` just past the value.
fn der_tlv(input: &[u8], pos: &mut usize) -> Result<(u8, std::ops::Range<usize>)> {
    let malformed = || Error::Network("malformed certificate DER".into());
    let tag = *input.get(*pos).ok_or_else(malformed)?;
    let mut i = *pos + 1;
    let first = *input.get(i).ok_or_else(malformed)?;
    i += 1;
    let len = if first < 0x80 {
        first as usize
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 {
            return Err(malformed());
        }
        let mut len = 0usize;
        for _ in 0..n {
            len = (len << 8) | *input.get(i).ok_or_else(malformed)? as usize;
            i += 1;
        }
        len
    };
    let end = i.checked_add(len).ok_or_else(malformed)?;
    if end > input.len() {
        return Err(malformed());
    }
    *pos = end;
    Ok((tag, i..end))
}

/// SHA-256 of the SubjectPublicKeyInfo DER inside an X.509 certificate.
///
/// Walks `Certificate -> tbsCertificate -> subjectPublicKeyInfo`: the SPKI
/// is the TLV after the optional `[0]` version, serial number, signature
/// algorithm, issuer, validity and subject.
pub fn spki_sha256(cert_der: &[u8]) -> Result<[u8; 32]> {
    let mut pos = 0usize;
    let (tag, cert) = der_tlv(cert_der, &mut pos)?;
    if tag != 0x30 {
        return Err(Error::Network("certificate is not a DER sequence".into()));
    }
    let tbs_input = &cert_der[cert.clone()];
    let mut pos = 0usize;
    let (tag, tbs) = der_tlv(tbs_input, &mut pos)?;
    if tag != 0x30 {
        return Err(Error::Network("tbsCertificate is not a sequence".into()));
    }

    let body = &tbs_input[tbs.clone()];
    let mut pos = 0usize;

    // optional explicit version
    if body.first() == Some(&0xA0) {
        der_tlv(body, &mut pos)?;
    }
    // serialNumber, signature, issuer, validity, subject
    for _ in 0..5 {
        der_tlv(body, &mut pos)?;
    }
    let spki_start = pos;
    let (tag, _) = der_tlv(body, &mut pos)?;
    if tag != 0x30 {
        return Err(Error::Network("subjectPublicKeyInfo is not a sequence".into()));
    }

    let mut hasher = Sha256::new();
    hasher.update(&body[spki_start..pos]);
    Ok(hasher.finalize().into())
}

// ─── pin verifier ───────────────────────────────────────────────────────

#[derive(Debug)]
struct PinVerifier {
    fingerprint: [u8; 32],
    chain: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(chain) = &self.chain {
            chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }

        for cert in std::iter::once(end_entity).chain(intermediates.iter()) {
            match spki_sha256(cert.as_ref()) {
                Ok(hash) if hash == self.fingerprint => {
                    debug!("pinned key found in peer chain");
                    return Ok(ServerCertVerified::assertion());
                }
                Ok(_) => {}
                Err(e) => warn!("unparseable certificate in peer chain: {e}"),
            }
        }

        warn!("no certificate in the peer chain matches the configured pin");
        Err(rustls::Error::General(PIN_MISMATCH_MSG.into()))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the shared rustls config for both transports.
pub fn pinned_tls_config(fingerprint: [u8; 32], skip_tls_check: bool) -> Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let chain = if skip_tls_check {
        None
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Some(
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| Error::Network(e.to_string()))?,
        )
    };

    let verifier = PinVerifier {
        fingerprint,
        chain,
        provider: provider.clone(),
    };

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Network(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

// ─── HTTP client ────────────────────────────────────────────────────────

/// Request/response client over the pinned dialer, carrying HTTP Basic
/// auth on every request.
pub struct HttpTransport {
    base: Endpoint,
    auth: String,
    tls: Arc<rustls::ClientConfig>,
}

impl HttpTransport {
    /// Build a transport for `server` authenticating as `user:pass`.
    pub fn new(
        server: &str,
        user: &str,
        pass: &str,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let base = parse_https_url(server)?;
        let auth = BASE64.encode(format!("{user}:{pass}"));
        Ok(HttpTransport { base, auth, tls })
    }

    /// The TLS config, shared with the websocket dialer.
    pub fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        self.tls.clone()
    }

    /// GET a service path.
    pub async fn get(&self, path: &str) -> Result<Response> {
        self.request("GET", &self.base.clone(), path, None, &[]).await
    }

    /// PUT a JSON body to a service path.
    pub async fn put_json(&self, path: &str, body: &[u8]) -> Result<Response> {
        self.request("PUT", &self.base.clone(), path, Some("application/json"), body)
            .await
    }

    /// PUT raw bytes to a service path.
    pub async fn put_binary(&self, path: &str, body: &[u8]) -> Result<Response> {
        self.request(
            "PUT",
            &self.base.clone(),
            path,
            Some("application/octet-stream"),
            body,
        )
        .await
    }

    /// PUT raw bytes to an absolute URL (attachment blob locations),
    /// still through the pinned dialer.
    pub async fn put_absolute(&self, url: &str, body: &[u8]) -> Result<Response> {
        let endpoint = parse_https_url(url)?;
        let path = endpoint.path.clone();
        self.request("PUT", &endpoint, &path, Some("application/octet-stream"), body)
            .await
    }

    async fn request(
        &self,
        method: &str,
        endpoint: &Endpoint,
        path: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<Response> {
        let mut req = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nAuthorization: Basic {}\r\nConnection: close\r\n",
            endpoint.host, self.auth
        )
        .into_bytes();
        if let Some(ct) = content_type {
            req.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
            req.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        req.extend_from_slice(b"\r\n");
        req.extend_from_slice(body);

        let raw = tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(endpoint, &req))
            .await
            .map_err(|_| Error::Network("request timed out".into()))??;
        let response = parse_response(&raw)?;
        if response.is_error() {
            debug!("{method} {path} -> {}", response.status);
        }
        Ok(response)
    }

    async fn exchange(&self, endpoint: &Endpoint, request: &[u8]) -> Result<Vec<u8>> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::Network(e.to_string()))?;
        let connector = TlsConnector::from(self.tls.clone());
        let mut stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(map_tls_error)?;

        stream.write_all(request).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok(raw)
    }
}

/// A failed pin is fatal and must be distinguishable from ordinary
/// network trouble.
pub fn map_tls_error(e: std::io::Error) -> Error {
    if e.to_string().contains(PIN_MISMATCH_MSG) {
        Error::PinMismatch
    } else {
        Error::Network(e.to_string())
    }
}

fn parse_response(raw: &[u8]) -> Result<Response> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::Network("truncated HTTP response".into()))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| Error::Network("non-UTF8 HTTP header".into()))?;
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Network("empty HTTP response".into()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Network(format!("bad status line: {status_line}")))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().ok(),
                "transfer-encoding" => {
                    chunked = value.trim().eq_ignore_ascii_case("chunked")
                }
                _ => {}
            }
        }
    }

    let raw_body = &raw[header_end + 4..];
    let body = if chunked {
        dechunk(raw_body)?
    } else {
        match content_length {
            Some(n) if n <= raw_body.len() => raw_body[..n].to_vec(),
            _ => raw_body.to_vec(),
        }
    };
    Ok(Response { status, body })
}

fn dechunk(mut raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::Network("truncated chunked body".into()))?;
        let size_str = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| Error::Network("bad chunk size".into()))?;
        let size = usize::from_str_radix(size_str.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| Error::Network("bad chunk size".into()))?;
        raw = &raw[line_end + 2..];
        if size == 0 {
            break;
        }
        if raw.len() < size + 2 {
            return Err(Error::Network("truncated chunk".into()));
        }
        out.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_https_url("https://example.org").unwrap(),
            Endpoint {
                host: "example.org".into(),
                port: 443,
                path: "/".into()
            }
        );
        assert_eq!(
            parse_https_url("https://example.org:4433/v1/x?a=b").unwrap(),
            Endpoint {
                host: "example.org".into(),
                port: 4433,
                path: "/v1/x?a=b".into()
            }
        );
        assert!(parse_https_url("http://example.org").is_err());
        assert!(parse_https_url("https://").is_err());
    }

    #[test]
    fn query_encoding() {
        assert_eq!(url_encode("+15551234567"), "%2B15551234567");
        assert_eq!(url_encode("abc-DEF_1.2~"), "abc-DEF_1.2~");
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
    }

    #[test]
    fn spki_extraction_matches_rcgen() {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let spki_der = key_pair.public_key_der();
        let expected: [u8; 32] = Sha256::digest(&spki_der).into();
        let actual = spki_sha256(cert.der().as_ref()).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn spki_extraction_rejects_garbage() {
        assert!(spki_sha256(&[]).is_err());
        assert!(spki_sha256(&[0x30, 0x02, 0x01]).is_err());
        assert!(spki_sha256(&[0x02, 0x01, 0x00]).is_err());
    }

    #[test]
    fn pin_verifier_accepts_matching_chain() {
        let CertifiedKey { cert, .. } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());
        let fingerprint = spki_sha256(der.as_ref()).unwrap();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinVerifier {
            fingerprint,
            chain: None,
            provider,
        };
        let name = ServerName::try_from("localhost").unwrap();
        verifier
            .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
            .unwrap();
    }

    #[test]
    fn pin_verifier_rejects_wrong_key() {
        let CertifiedKey { cert, .. } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = CertificateDer::from(cert.der().to_vec());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinVerifier {
            fingerprint: [0u8; 32],
            chain: None,
            provider,
        };
        let name = ServerName::try_from("localhost").unwrap();
        assert!(verifier
            .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn response_parsing_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhellotrailing";
        let r = parse_response(raw).unwrap();
        assert_eq!(r.status, 200);
        assert_eq!(r.body, b"hello");
        assert!(!r.is_error());
    }

    #[test]
    fn response_parsing_error_status() {
        let raw = b"HTTP/1.1 409 Conflict\r\nContent-Length: 2\r\n\r\n{}";
        let r = parse_response(raw).unwrap();
        assert_eq!(r.status, 409);
        assert!(r.is_error());
    }

    #[test]
    fn response_parsing_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let r = parse_response(raw).unwrap();
        assert_eq!(r.body, b"hello world");
    }

    #[test]
    fn response_parsing_no_length_reads_to_end() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let r = parse_response(raw).unwrap();
        assert_eq!(r.status, 204);
        assert!(r.body.is_empty());
    }
}
