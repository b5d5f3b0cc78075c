//! Transport abstraction for git wire protocol communication.
//!
//! This crate provides the physical transport layer for git network operations.
//! It handles SSH (subprocess), HTTP/HTTPS (smart protocol), and local (direct
//! file access) transports. Higher-level protocol logic lives in `git-protocol`.

pub mod credential;
pub mod http;
pub mod local;
pub mod ssh;
pub mod url;

use std::io::{Read, Write};

use bstr::BString;
use git_hash::ObjectId;

pub use credential::AuthMethod;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("HTTP error: {status}: {message}")]
    Http { status: u16, message: String },

    #[error("server error: {0}")]
    ServerError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Git URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ssh,
    Git,
    Http,
    Https,
    File,
    /// Local path without scheme prefix.
    Local,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Ssh => write!(f, "ssh"),
            Scheme::Git => write!(f, "git"),
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
            Scheme::File => write!(f, "file"),
            Scheme::Local => write!(f, "local"),
        }
    }
}

/// Parsed git URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    pub scheme: Scheme,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub path: String,
}

impl std::fmt::Display for GitUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            Scheme::Ssh if self.user.is_some() && self.port.is_none() => {
                // SCP-like syntax: user@host:path
                write!(
                    f,
                    "{}@{}:{}",
                    self.user.as_deref().unwrap_or("git"),
                    self.host.as_deref().unwrap_or(""),
                    self.path
                )
            }
            Scheme::Local => write!(f, "{}", self.path),
            Scheme::File => write!(f, "file://{}", self.path),
            _ => {
                write!(f, "{}://", self.scheme)?;
                if let Some(ref user) = self.user {
                    write!(f, "{}@", user)?;
                }
                if let Some(ref host) = self.host {
                    write!(f, "{}", host)?;
                }
                if let Some(port) = self.port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", self.path)
            }
        }
    }
}

/// Service type for git transport connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// git-upload-pack (for fetch/clone).
    UploadPack,
    /// git-receive-pack (for push).
    ReceivePack,
}

impl Service {
    /// Service name as used in the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }
}

/// Protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V0,
    V1,
    V2,
}

/// Result of the initial transport handshake.
#[derive(Debug)]
pub struct HandshakeResult {
    pub protocol_version: ProtocolVersion,
    pub capabilities: Vec<String>,
    /// Advertised refs: (OID, refname). Empty for v2 (refs come via ls-refs).
    pub refs: Vec<(ObjectId, BString)>,
    /// Raw initial response lines for protocol parsing.
    pub extra_lines: Vec<Vec<u8>>,
}

/// Trait for transport connections.
///
/// A transport provides bidirectional I/O with a remote git process.
/// The connection lifecycle is:
/// 1. Connect via `connect()` function
/// 2. Read/write using the reader/writer
/// 3. Close when done
pub trait Transport: Send {
    /// Get a reader for the server's response.
    fn reader(&mut self) -> &mut dyn Read;

    /// Get a writer for sending data to the server.
    fn writer(&mut self) -> &mut dyn Write;

    /// Close the transport connection.
    fn close(self: Box<Self>) -> Result<(), TransportError>;

    /// Whether this transport supports stateless operation (HTTP).
    fn is_stateless(&self) -> bool {
        false
    }

    /// Flush whatever has been written so far and return a reader positioned
    /// at the response.
    ///
    /// Stateful transports (SSH, local subprocess) are a persistent
    /// bidirectional stream, so the default implementation just hands back
    /// `reader()`. Stateless transports (HTTP) must override this: every
    /// round is a fresh request, and `reader()` alone never sends the
    /// buffered want/have lines anywhere.
    fn exchange(&mut self) -> Result<&mut dyn Read, TransportError> {
        Ok(self.reader())
    }
}

/// Open a transport connection for the given URL and service.
pub fn connect(
    url: &GitUrl,
    service: Service,
) -> Result<Box<dyn Transport>, TransportError> {
    match url.scheme {
        Scheme::Ssh => ssh::connect(url, service),
        Scheme::Git => {
            // Git protocol uses a similar subprocess mechanism
            Err(TransportError::UnsupportedScheme(
                "git:// protocol not yet implemented".into(),
            ))
        }
        Scheme::Http | Scheme::Https => http::connect(url, service),
        Scheme::File | Scheme::Local => local::connect(url, service),
    }
}

/// Open a transport connection with an explicit HTTP client and auth method.
///
/// SSH and local transports authenticate through their own subprocess
/// (the `ssh` binary resolves `SshPublicKey`/`SshAgent` itself); only the
/// HTTP transport consults `client`/`auth` directly.
pub fn connect_with_auth(
    url: &GitUrl,
    service: Service,
    http_client: std::sync::Arc<dyn http::HttpClient>,
    auth: Option<AuthMethod>,
) -> Result<Box<dyn Transport>, TransportError> {
    match url.scheme {
        Scheme::Ssh => ssh::connect(url, service),
        Scheme::Git => Err(TransportError::UnsupportedScheme(
            "git:// protocol not yet implemented".into(),
        )),
        Scheme::Http | Scheme::Https => {
            http::connect_with_client(url, service, http_client, auth)
        }
        Scheme::File | Scheme::Local => local::connect(url, service),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A stateful, in-memory transport standing in for SSH/local: a
    /// persistent pipe, no `is_stateless`/`exchange` override.
    struct PipeTransport {
        read_buf: Cursor<Vec<u8>>,
        write_buf: Vec<u8>,
    }

    impl Transport for PipeTransport {
        fn reader(&mut self) -> &mut dyn Read {
            &mut self.read_buf
        }

        fn writer(&mut self) -> &mut dyn Write {
            &mut self.write_buf
        }

        fn close(self: Box<Self>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn default_exchange_is_stateful_passthrough() {
        let mut transport = PipeTransport {
            read_buf: Cursor::new(b"hello".to_vec()),
            write_buf: Vec::new(),
        };

        assert!(!transport.is_stateless());

        let mut out = Vec::new();
        transport.exchange().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }
}
