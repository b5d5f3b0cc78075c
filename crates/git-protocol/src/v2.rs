//! Protocol v2 detection.
//!
//! Protocol v2 replaces the v1 ref advertisement with a capability list and a
//! command-based exchange (`ls-refs`, `fetch`). We only need to recognize
//! when a server has switched to v2 so the handshake can step back down to
//! the v1 negotiation in [`crate::v1`]; full v2 command support (incremental
//! `ls-refs` filtering, section-based `fetch` responses) is not implemented.

use crate::capability::Capabilities;

/// Commands a v2 server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Command {
    LsRefs,
    Fetch,
}

impl V2Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            V2Command::LsRefs => "ls-refs",
            V2Command::Fetch => "fetch",
        }
    }
}

/// Whether the server's advertised capabilities name protocol v2's commands.
pub fn server_supports_v2(caps: &Capabilities) -> bool {
    caps.has(V2Command::LsRefs.as_str()) || caps.has(V2Command::Fetch.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_v2_from_command_capabilities() {
        let caps = Capabilities::parse_v2(&[
            b"agent=git/2.39.0\n".to_vec(),
            b"ls-refs\n".to_vec(),
            b"fetch=shallow\n".to_vec(),
        ]);
        assert!(server_supports_v2(&caps));
    }

    #[test]
    fn v1_capabilities_are_not_v2() {
        let caps = Capabilities::parse_v1("multi_ack side-band-64k agent=git/2.39.0");
        assert!(!server_supports_v2(&caps));
    }
}
