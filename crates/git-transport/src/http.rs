//! HTTP/HTTPS smart transport implementation.
//!
//! Implements the git smart HTTP protocol for fetch and push.
//! Each request/response cycle is a separate HTTP POST.
//!
//! The actual socket/TLS work is an external collaborator: this module only
//! builds requests and parses responses, against an injected [`HttpClient`].
//! Embedding code that already owns an HTTP stack (e.g. one built on
//! `reqwest`) can implement the trait directly instead of going through the
//! bundled [`CurlHttpClient`].

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use crate::credential::AuthMethod;
use crate::{GitUrl, Service, Transport, TransportError};

/// An HTTP method used by the smart-HTTP protocol (only GET and POST appear here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A request the transport wants issued. Headers are pre-built; the client
/// is only responsible for putting bytes on the wire and returning bytes back.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The parsed-out result of an HTTP exchange: status code and body, headers
/// already stripped by the client.
#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Injected HTTP transport. Implementations perform the actual network I/O;
/// this crate only ever sees [`HttpRequest`]/[`HttpResponseData`].
pub trait HttpClient: Send + Sync {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponseData, TransportError>;
}

/// Default [`HttpClient`] that shells out to a `curl`-compatible binary.
///
/// This is a convenience implementation for environments with no HTTP stack
/// of their own; it is not the only way to satisfy [`HttpClient`].
pub struct CurlHttpClient;

impl HttpClient for CurlHttpClient {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponseData, TransportError> {
        match request.method {
            HttpMethod::Get => curl_get(&request.url, &request.headers),
            HttpMethod::Post => curl_post(&request.url, &request.headers, &request.body),
        }
    }
}

/// HTTP transport state.
pub struct HttpTransport {
    /// Base URL for the repository.
    base_url: String,
    /// The service we're talking to.
    service: Service,
    /// Buffer for data to be sent in the next request.
    write_buf: Vec<u8>,
    /// Response data from the last request.
    read_buf: Cursor<Vec<u8>>,
    /// Whether the initial info/refs request has been made.
    initial_request_done: bool,
    client: Arc<dyn HttpClient>,
    auth: Option<AuthMethod>,
}

impl HttpTransport {
    fn auth_headers(&self) -> Vec<(String, String)> {
        match &self.auth {
            None | Some(AuthMethod::Anonymous) | Some(AuthMethod::SshPublicKey { .. }) | Some(AuthMethod::SshAgent) => {
                Vec::new()
            }
            Some(AuthMethod::Basic { username, password }) => {
                let encoded = base64_encode(format!("{}:{}", username, password).as_bytes());
                vec![("Authorization".to_string(), format!("Basic {}", encoded))]
            }
            Some(AuthMethod::Token { token }) => {
                vec![("Authorization".to_string(), format!("Bearer {}", token))]
            }
        }
    }

    /// Perform the initial GET to /info/refs?service=... and return the response.
    fn do_initial_request(&mut self) -> Result<(), TransportError> {
        if self.initial_request_done {
            return Ok(());
        }

        let url = format!(
            "{}/info/refs?service={}",
            self.base_url,
            self.service.as_str()
        );

        let request = HttpRequest {
            method: HttpMethod::Get,
            url,
            headers: self.auth_headers(),
            body: Vec::new(),
        };
        let response = self.client.request(&request)?;
        check_status(&response)?;
        self.read_buf = Cursor::new(response.body);
        self.initial_request_done = true;
        Ok(())
    }

    /// Perform a POST to the service endpoint with the write buffer contents.
    fn do_post(&mut self) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url, self.service.as_str());
        let mut headers = self.auth_headers();
        headers.push((
            "Content-Type".to_string(),
            format!("application/x-{}-request", self.service.as_str()),
        ));
        headers.push((
            "Accept".to_string(),
            format!("application/x-{}-result", self.service.as_str()),
        ));

        let body = std::mem::take(&mut self.write_buf);
        let request = HttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body,
        };
        let response = self.client.request(&request)?;
        check_status(&response)?;
        self.read_buf = Cursor::new(response.body);
        Ok(())
    }
}

fn check_status(response: &HttpResponseData) -> Result<(), TransportError> {
    match response.status {
        0 | 200..=299 => Ok(()),
        401 | 403 => Err(TransportError::AuthenticationFailed),
        status => Err(TransportError::Http {
            status,
            message: "request failed".to_string(),
        }),
    }
}

impl Transport for HttpTransport {
    fn reader(&mut self) -> &mut dyn Read {
        if !self.initial_request_done {
            // Stateless HTTP defers the initial request until a reader is
            // actually requested, but it is also performed eagerly by
            // `connect`; this only applies if that eager call was skipped.
            if let Err(e) = self.do_initial_request() {
                self.read_buf = Cursor::new(Vec::new());
                eprintln!("HTTP initial request error: {}", e);
            }
        }
        &mut self.read_buf
    }

    fn writer(&mut self) -> &mut dyn Write {
        &mut self.write_buf
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_stateless(&self) -> bool {
        true
    }

    /// Flush the pending request body and return the response reader.
    /// Every round against a stateless transport is a fresh POST carrying
    /// whatever has accumulated in the write buffer.
    fn exchange(&mut self) -> Result<&mut dyn Read, TransportError> {
        self.do_post()?;
        Ok(&mut self.read_buf)
    }
}

/// Connect to a remote repository over HTTP/HTTPS using the default
/// curl-backed client and no authentication.
pub fn connect(url: &GitUrl, service: Service) -> Result<Box<dyn Transport>, TransportError> {
    connect_with_client(url, service, Arc::new(CurlHttpClient), None)
}

/// Connect to a remote repository over HTTP/HTTPS using an injected client
/// and authentication method.
pub fn connect_with_client(
    url: &GitUrl,
    service: Service,
    client: Arc<dyn HttpClient>,
    auth: Option<AuthMethod>,
) -> Result<Box<dyn Transport>, TransportError> {
    let base_url = format!(
        "{}://{}{}{}",
        url.scheme,
        url.host.as_deref().unwrap_or(""),
        url.port
            .map(|p| format!(":{}", p))
            .unwrap_or_default(),
        url.path
    );

    let mut transport = HttpTransport {
        base_url,
        service,
        write_buf: Vec::new(),
        read_buf: Cursor::new(Vec::new()),
        initial_request_done: false,
        client,
        auth,
    };

    // Perform the initial info/refs discovery
    transport.do_initial_request()?;

    Ok(Box::new(transport))
}

fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let n = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
        out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6 & 0x3f) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(n & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

/// Blocking HTTP GET via `std::process::Command` (curl).
fn curl_get(url: &str, headers: &[(String, String)]) -> Result<HttpResponseData, TransportError> {
    let mut args = vec!["-s".to_string(), "-w".to_string(), "\\n%{http_code}".to_string()];
    for (name, value) in headers {
        args.push("-H".to_string());
        args.push(format!("{}: {}", name, value));
    }
    args.push(url.to_string());

    let output = std::process::Command::new("curl")
        .args(&args)
        .output()
        .map_err(|e| TransportError::ConnectionFailed(format!("curl not found: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TransportError::ConnectionFailed(format!(
            "curl GET failed: {}",
            stderr
        )));
    }

    parse_curl_output(output.stdout)
}

/// Blocking HTTP POST via `std::process::Command` (curl).
fn curl_post(
    url: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<HttpResponseData, TransportError> {
    use std::process::Stdio;

    let mut args = vec![
        "-s".to_string(),
        "-w".to_string(),
        "\\n%{http_code}".to_string(),
        "-X".to_string(),
        "POST".to_string(),
    ];
    for (name, value) in headers {
        args.push("-H".to_string());
        args.push(format!("{}: {}", name, value));
    }
    args.push("--data-binary".to_string());
    args.push("@-".to_string());
    args.push(url.to_string());

    let mut child = std::process::Command::new("curl")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TransportError::ConnectionFailed(format!("curl not found: {}", e)))?;

    if let Some(ref mut stdin) = child.stdin {
        stdin.write_all(body)?;
    }
    drop(child.stdin.take());

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TransportError::ConnectionFailed(format!(
            "curl POST failed: {}",
            stderr
        )));
    }

    parse_curl_output(output.stdout)
}

/// Split curl's `-w "\n%{http_code}"` trailer off the body.
fn parse_curl_output(mut output: Vec<u8>) -> Result<HttpResponseData, TransportError> {
    let newline_pos = output
        .iter()
        .rposition(|&b| b == b'\n')
        .ok_or_else(|| TransportError::ConnectionFailed("malformed curl output".into()))?;
    let status_str = String::from_utf8_lossy(&output[newline_pos + 1..]).to_string();
    let status: u16 = status_str
        .trim()
        .parse()
        .map_err(|_| TransportError::ConnectionFailed("malformed curl status code".into()))?;
    output.truncate(newline_pos);
    Ok(HttpResponseData {
        status,
        body: output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockClient {
        response: HttpResponseData,
    }

    impl HttpClient for MockClient {
        fn request(&self, _request: &HttpRequest) -> Result<HttpResponseData, TransportError> {
            Ok(HttpResponseData {
                status: self.response.status,
                body: self.response.body.clone(),
            })
        }
    }

    #[test]
    fn connect_uses_injected_client() {
        let url = GitUrl {
            scheme: crate::Scheme::Https,
            host: Some("example.com".into()),
            port: None,
            user: None,
            path: "/repo.git".into(),
        };
        let client: Arc<dyn HttpClient> = Arc::new(MockClient {
            response: HttpResponseData {
                status: 200,
                body: b"001e# service=git-upload-pack\n0000".to_vec(),
            },
        });
        let transport =
            connect_with_client(&url, Service::UploadPack, client, None).unwrap();
        let mut transport = transport;
        let mut buf = Vec::new();
        transport.reader().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"001e# service=git-upload-pack\n0000");
    }

    struct RecordingClient {
        requests: std::sync::Mutex<Vec<HttpRequest>>,
        response: HttpResponseData,
    }

    impl HttpClient for RecordingClient {
        fn request(&self, request: &HttpRequest) -> Result<HttpResponseData, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(HttpResponseData {
                status: self.response.status,
                body: self.response.body.clone(),
            })
        }
    }

    #[test]
    fn exchange_posts_write_buffer_and_returns_response() {
        let client = Arc::new(RecordingClient {
            requests: std::sync::Mutex::new(Vec::new()),
            response: HttpResponseData {
                status: 200,
                body: b"0008NAK\n0000".to_vec(),
            },
        });
        let mut transport = HttpTransport {
            base_url: "https://example.com".into(),
            service: Service::UploadPack,
            write_buf: Vec::new(),
            read_buf: Cursor::new(Vec::new()),
            initial_request_done: true,
            client: client.clone(),
            auth: None,
        };

        use std::io::Write as _;
        transport.writer().write_all(b"0009done\n").unwrap();

        let mut body = Vec::new();
        transport.exchange().unwrap().read_to_end(&mut body).unwrap();

        assert_eq!(body, b"0008NAK\n0000");
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, b"0009done\n");
        assert_eq!(requests[0].method, HttpMethod::Post);
        // The write buffer is drained by the POST, so a second exchange()
        // sends an empty body rather than repeating the first one.
        assert!(transport.write_buf.is_empty());
    }

    #[test]
    fn auth_headers_basic() {
        let transport = HttpTransport {
            base_url: "https://example.com".into(),
            service: Service::UploadPack,
            write_buf: Vec::new(),
            read_buf: Cursor::new(Vec::new()),
            initial_request_done: true,
            client: Arc::new(CurlHttpClient),
            auth: Some(AuthMethod::Basic {
                username: "alice".into(),
                password: "secret".into(),
            }),
        };
        let headers = transport.auth_headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        assert!(headers[0].1.starts_with("Basic "));
    }

    #[test]
    fn base64_round_trips_known_vector() {
        assert_eq!(base64_encode(b"alice:secret"), "YWxpY2U6c2VjcmV0");
    }
}
