//! Git wire protocol implementation.
//!
//! This crate implements the git wire protocol for fetch operations. It
//! handles pkt-line framing, capability negotiation, the v1 ref advertisement
//! and negotiation exchange (with v2 detected and gracefully stepped down to
//! v1), and remote/refspec configuration.

pub mod capability;
pub mod fetch;
pub mod pktline;
pub mod remote;
pub mod sideband;
pub mod v1;
pub mod v2;

use git_transport::TransportError;

/// Errors that can occur during protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("invalid refspec: {0}")]
    InvalidRefSpec(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pack(#[from] git_pack::PackError),

    #[error(transparent)]
    Odb(#[from] git_odb::OdbError),

    #[error(transparent)]
    Ref(#[from] git_ref::RefError),

    #[error(transparent)]
    Config(#[from] git_config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Canceled(#[from] git_utils::UtilError),
}
