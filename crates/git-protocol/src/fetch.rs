//! Fetch protocol implementation.
//!
//! Orchestrates the complete fetch operation: compute wants from refspecs,
//! negotiate the object set to send in bounded rounds, receive and decode
//! the resulting pack into the object store, then update local refs under
//! compare-and-swap, respecting fast-forward/force rules.

use std::collections::HashSet;
use std::path::PathBuf;

use bstr::BString;
use git_hash::ObjectId;
use git_object::Object;
use git_odb::ObjectDatabase;
use git_ref::files::FilesRefStore;
use git_ref::store::RefTransaction;
use git_ref::{RefName, RefStore};
use git_transport::Transport;
use git_utils::cancel::CancellationToken;

use crate::capability::{self, AckMode, Capabilities, SidebandMode};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::remote::{map_refs, RefSpec};
use crate::sideband::SidebandReader;
use crate::ProtocolError;

/// Maximum `have` lines sent before a round boundary.
///
/// Bounds how much a single round can grow a stateless (HTTP) request,
/// which resends the whole history of haves sent so far every round.
const MAX_HAVES_PER_ROUND: usize = 32;

/// Upper bound on negotiation rounds before giving up and sending `done`
/// unconditionally. Prevents an unbounded back-and-forth against a server
/// that never acknowledges a common ancestor.
const MAX_NEGOTIATION_ROUNDS: usize = 256;

/// Fetch operation options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Shallow fetch depth (None = full).
    pub depth: Option<u32>,
    /// Deepen a shallow clone by N additional commits.
    pub deepen: Option<u32>,
    /// Convert a shallow repository to a complete one.
    pub unshallow: bool,
    /// Create a shallow clone with commits newer than this date (ISO 8601 or unix timestamp).
    pub shallow_since: Option<String>,
    /// Exclude commits reachable from a specific revision.
    pub shallow_exclude: Option<String>,
    /// Partial clone filter (e.g., "blob:none").
    pub filter: Option<String>,
    /// Show progress output.
    pub progress: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            depth: None,
            deepen: None,
            unshallow: false,
            shallow_since: None,
            shallow_exclude: None,
            filter: None,
            progress: true,
        }
    }
}

/// Outcome of applying a single mapped ref after a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdateStatus {
    /// The local tracking ref did not exist and was created.
    Created,
    /// The local tracking ref advanced along a fast-forward path.
    FastForwarded,
    /// The local tracking ref was force-updated (refspec had `+`, non-fast-forward).
    Forced,
    /// The local tracking ref already pointed at this OID.
    UpToDate,
    /// Update refused: non-fast-forward and the refspec did not force it.
    RejectedNonFastForward,
}

/// A single ref update attempted as part of a fetch.
#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub remote_name: String,
    pub local_name: String,
    pub old_oid: Option<ObjectId>,
    pub new_oid: ObjectId,
    pub status: RefUpdateStatus,
}

/// Result of a fetch operation.
#[derive(Debug)]
pub struct FetchResult {
    /// Path to the received pack file (if a pack was transferred).
    pub pack_path: Option<PathBuf>,
    /// Ref updates attempted, with their outcome.
    pub ref_updates: Vec<RefUpdate>,
    /// Number of objects newly stored in the pack.
    pub new_objects: usize,
    /// Shallow boundary commits (OIDs listed in "shallow" lines from the server).
    pub shallow_commits: Vec<ObjectId>,
    /// Commits that are no longer shallow boundaries ("unshallow" lines from the server).
    pub unshallow_commits: Vec<ObjectId>,
}

impl FetchResult {
    fn empty() -> Self {
        Self {
            pack_path: None,
            ref_updates: Vec::new(),
            new_objects: 0,
            shallow_commits: Vec::new(),
            unshallow_commits: Vec::new(),
        }
    }
}

/// Perform a fetch operation using an already-connected transport.
///
/// `advertised_refs` is the server's ref advertisement; `refspecs` maps
/// those remote refs to local tracking ref names (see [`crate::remote`]).
/// Objects are decoded straight into `odb`; ref updates are committed to
/// `ref_store` under compare-and-swap, one transaction per ref.
///
/// `token`, if given, is checked between pkt-line frames and between
/// negotiation rounds so a caller can abort a long-running fetch.
pub fn fetch(
    transport: &mut dyn Transport,
    advertised_refs: &[(ObjectId, BString)],
    server_caps: &Capabilities,
    refspecs: &[RefSpec],
    odb: &ObjectDatabase,
    ref_store: &FilesRefStore,
    options: &FetchOptions,
    token: Option<&CancellationToken>,
) -> Result<FetchResult, ProtocolError> {
    let mapped = map_refs(advertised_refs, refspecs);
    if mapped.is_empty() {
        return Ok(FetchResult::empty());
    }

    let mut wants: Vec<ObjectId> = Vec::new();
    for (oid, _, _) in &mapped {
        if !odb.contains(oid) && !wants.contains(oid) {
            wants.push(*oid);
        }
    }

    let (mut result, shallow_commits, unshallow_commits) = if wants.is_empty() {
        (FetchResult::empty(), Vec::new(), Vec::new())
    } else {
        negotiate_and_receive(transport, server_caps, &wants, odb, options, token)?
    };
    result.shallow_commits = shallow_commits;
    result.unshallow_commits = unshallow_commits;

    if !result.shallow_commits.is_empty() || !result.unshallow_commits.is_empty() {
        odb.update_shallow(&result.shallow_commits, &result.unshallow_commits)?;
    }

    result.ref_updates = apply_ref_updates(&mapped, refspecs, odb, ref_store)?;

    Ok(result)
}

/// Run negotiation and receive the resulting pack, installing it into `odb`.
fn negotiate_and_receive(
    transport: &mut dyn Transport,
    server_caps: &Capabilities,
    wants: &[ObjectId],
    odb: &ObjectDatabase,
    options: &FetchOptions,
    token: Option<&CancellationToken>,
) -> Result<(FetchResult, Vec<ObjectId>, Vec<ObjectId>), ProtocolError> {
    let mut client_caps = capability::negotiate_fetch_capabilities(server_caps);
    let is_shallow_request = options.depth.is_some()
        || options.deepen.is_some()
        || options.unshallow
        || options.shallow_since.is_some()
        || options.shallow_exclude.is_some();

    if is_shallow_request && server_caps.has("shallow") && !client_caps.iter().any(|c| c == "shallow") {
        client_caps.push("shallow".into());
    }
    if options.shallow_since.is_some()
        && server_caps.has("deepen-since")
        && !client_caps.iter().any(|c| c == "deepen-since")
    {
        client_caps.push("deepen-since".into());
    }
    if options.shallow_exclude.is_some()
        && server_caps.has("deepen-not")
        && !client_caps.iter().any(|c| c == "deepen-not")
    {
        client_caps.push("deepen-not".into());
    }
    if (options.deepen.is_some() || options.unshallow)
        && server_caps.has("deepen-relative")
        && !client_caps.iter().any(|c| c == "deepen-relative")
    {
        client_caps.push("deepen-relative".into());
    }

    let sideband_mode = capability::select_sideband(server_caps);
    let ack_mode = capability::select_ack_mode(server_caps);

    // Send wants plus any shallow negotiation lines, then flush.
    {
        let writer = transport.writer();
        let mut pkt_writer = PktLineWriter::new(writer);

        for (i, want) in wants.iter().enumerate() {
            if i == 0 && !client_caps.is_empty() {
                pkt_writer.write_text(&format!("want {} {}", want, client_caps.join(" ")))?;
            } else {
                pkt_writer.write_text(&format!("want {want}"))?;
            }
        }

        if let Some(depth) = options.depth {
            pkt_writer.write_text(&format!("deepen {depth}"))?;
        }
        if let Some(deepen) = options.deepen {
            pkt_writer.write_text(&format!("deepen {deepen}"))?;
        }
        if options.unshallow {
            pkt_writer.write_text(&format!("deepen {}", 0x7fff_ffff_u32))?;
        }
        if let Some(ref since) = options.shallow_since {
            pkt_writer.write_text(&format!("deepen-since {since}"))?;
        }
        if let Some(ref exclude) = options.shallow_exclude {
            pkt_writer.write_text(&format!("deepen-not {exclude}"))?;
        }

        pkt_writer.write_flush()?;
    }

    // A shallow/unshallow response section, terminated by a flush, precedes
    // negotiation only when shallow parameters were sent.
    let mut shallow_commits = Vec::new();
    let mut unshallow_commits = Vec::new();
    if is_shallow_request {
        let mut pkt_reader = PktLineReader::new(transport.exchange()?);
        loop {
            if let Some(t) = token {
                t.check()?;
            }
            match pkt_reader.read_pkt()? {
                PktLine::Data(data) => {
                    let line = strip_newline(&data);
                    let line = String::from_utf8_lossy(line);
                    if let Some(hex) = line.strip_prefix("shallow ") {
                        if let Ok(oid) = ObjectId::from_hex(hex.trim()) {
                            shallow_commits.push(oid);
                        }
                    } else if let Some(hex) = line.strip_prefix("unshallow ") {
                        if let Ok(oid) = ObjectId::from_hex(hex.trim()) {
                            unshallow_commits.push(oid);
                        }
                    }
                }
                PktLine::Flush => break,
                _ => break,
            }
        }
    }

    // Bounded negotiation: send haves in rounds of at most
    // MAX_HAVES_PER_ROUND, reading ACKs between rounds, until the server
    // signals readiness, we run out of haves, or we hit the round cap.
    let haves = gather_haves(odb, wants);
    let mut have_chunks = haves.chunks(MAX_HAVES_PER_ROUND);
    let mut round = 0;
    let mut ready = false;

    loop {
        if let Some(t) = token {
            t.check()?;
        }
        round += 1;
        let chunk = have_chunks.next().unwrap_or(&[]);
        let is_final_round = chunk.len() < MAX_HAVES_PER_ROUND || round >= MAX_NEGOTIATION_ROUNDS;

        {
            let writer = transport.writer();
            let mut pkt_writer = PktLineWriter::new(writer);
            for have in chunk {
                pkt_writer.write_text(&format!("have {have}"))?;
            }
            if is_final_round {
                pkt_writer.write_text("done")?;
            } else {
                pkt_writer.write_flush()?;
            }
            pkt_writer.flush()?;
        }

        if is_final_round {
            break;
        }

        let mut pkt_reader = PktLineReader::new(transport.exchange()?);
        loop {
            if let Some(t) = token {
                t.check()?;
            }
            match pkt_reader.read_pkt()? {
                PktLine::Data(data) => {
                    let line = strip_newline(&data);
                    let line = String::from_utf8_lossy(line);
                    if line == "NAK" {
                        break;
                    }
                    if let Some(rest) = line.strip_prefix("ACK ") {
                        match ack_mode {
                            AckMode::Single => {
                                ready = true;
                                break;
                            }
                            AckMode::Multi | AckMode::MultiDetailed => {
                                if rest.ends_with(" ready") || rest.ends_with(" common") {
                                    if rest.ends_with(" ready") {
                                        ready = true;
                                    }
                                    continue;
                                }
                                // bare "ACK <oid>" in multi_ack marks the
                                // end of this round's responses.
                                break;
                            }
                        }
                    }
                }
                PktLine::Flush => break,
                _ => break,
            }
        }

        if ready {
            break;
        }
    }

    // Final ACK/NAK for the "done" round, then the pack itself. These come
    // from the same response (one POST, for a stateless transport), so both
    // are read off one `exchange()` call rather than two.
    let mut final_pkt_reader = PktLineReader::new(transport.exchange()?);
    loop {
        if let Some(t) = token {
            t.check()?;
        }
        match final_pkt_reader.read_pkt()? {
            PktLine::Data(data) => {
                let line = strip_newline(&data);
                let line = String::from_utf8_lossy(line);
                if line == "NAK" || line.starts_with("ACK ") {
                    break;
                }
            }
            PktLine::Flush => break,
            _ => break,
        }
    }

    let pack_data = receive_pack_data(final_pkt_reader, sideband_mode)?;

    let mut result = FetchResult::empty();
    if !pack_data.is_empty() {
        let decoded = git_pack::decode::decode_pack(
            &pack_data,
            odb.hash_algo(),
            |oid| {
                odb.read(oid)
                    .ok()
                    .flatten()
                    .map(|obj| (obj.object_type(), obj.serialize_content()))
            },
            token,
        )?;

        result.new_objects = decoded.entries.len();
        let pack_path = git_pack::decode::install_pack(odb.objects_dir(), &pack_data, &decoded)?;
        odb.refresh()?;
        result.pack_path = Some(pack_path);
    }

    Ok((result, shallow_commits, unshallow_commits))
}

/// Collect the OIDs of every locally known object, to offer as `have`
/// candidates during negotiation. `wants` is excluded so an up-to-date
/// branch doesn't pad the have set with the exact OIDs we're requesting.
fn gather_haves(odb: &ObjectDatabase, wants: &[ObjectId]) -> Vec<ObjectId> {
    let want_set: HashSet<ObjectId> = wants.iter().copied().collect();
    let mut haves = Vec::new();
    if let Ok(iter) = odb.iter_all_oids() {
        for oid in iter.flatten() {
            if !want_set.contains(&oid) && !haves.contains(&oid) {
                haves.push(oid);
            }
        }
    }
    haves
}

/// Receive pack data from the already-open response reader, handling
/// sideband if needed. `pkt_reader` is positioned right after the final
/// ACK/NAK line, wherever the pack bytes begin.
fn receive_pack_data(
    pkt_reader: PktLineReader<&mut dyn std::io::Read>,
    sideband_mode: SidebandMode,
) -> Result<Vec<u8>, ProtocolError> {
    match sideband_mode {
        SidebandMode::None => {
            let reader = pkt_reader.into_inner();
            let mut data = Vec::new();
            std::io::Read::read_to_end(reader, &mut data)?;
            Ok(data)
        }
        SidebandMode::Band | SidebandMode::Band64k => {
            let mut sideband = SidebandReader::new(pkt_reader);
            sideband.read_all_data()
        }
    }
}

/// Apply the negotiated ref set to local tracking refs, one CAS transaction
/// per ref, respecting fast-forward and force-refspec rules.
fn apply_ref_updates(
    mapped: &[(ObjectId, String, String)],
    refspecs: &[RefSpec],
    odb: &ObjectDatabase,
    ref_store: &FilesRefStore,
) -> Result<Vec<RefUpdate>, ProtocolError> {
    let mut updates = Vec::with_capacity(mapped.len());

    for (new_oid, remote_name, local_name) in mapped {
        let force = refspecs
            .iter()
            .find(|s| s.matches_source(remote_name))
            .is_some_and(|s| s.force);

        let ref_name = RefName::new(local_name.clone())?;
        let old_oid = ref_store.resolve_to_oid(&ref_name)?;

        let status = match old_oid {
            None => {
                let mut txn = RefTransaction::new();
                txn.create(ref_name, *new_oid, format!("fetch: storing {remote_name}"));
                ref_store.commit_transaction(txn)?;
                RefUpdateStatus::Created
            }
            Some(old) if old == *new_oid => RefUpdateStatus::UpToDate,
            Some(old) => {
                let fast_forward = is_ancestor(&old, new_oid, odb)?;
                if fast_forward || force {
                    let mut txn = RefTransaction::new();
                    txn.update(ref_name, old, *new_oid, format!("fetch: {remote_name}"));
                    ref_store.commit_transaction(txn)?;
                    if fast_forward {
                        RefUpdateStatus::FastForwarded
                    } else {
                        RefUpdateStatus::Forced
                    }
                } else {
                    RefUpdateStatus::RejectedNonFastForward
                }
            }
        };

        updates.push(RefUpdate {
            remote_name: remote_name.clone(),
            local_name: local_name.clone(),
            old_oid,
            new_oid: *new_oid,
            status,
        });
    }

    Ok(updates)
}

/// Whether `ancestor` is reachable by walking `descendant`'s commit parents.
///
/// Non-commit objects (e.g. a tag pointing straight at a blob) are treated
/// as never fast-forwardable, since there is no parent chain to walk.
fn is_ancestor(
    ancestor: &ObjectId,
    descendant: &ObjectId,
    odb: &ObjectDatabase,
) -> Result<bool, ProtocolError> {
    if ancestor == descendant {
        return Ok(true);
    }

    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut queue = vec![*descendant];

    while let Some(oid) = queue.pop() {
        if !visited.insert(oid) {
            continue;
        }
        if oid == *ancestor {
            return Ok(true);
        }
        let parents = match odb.read(&oid)? {
            Some(Object::Commit(commit)) => commit.parents,
            Some(Object::Tag(tag)) => vec![tag.target],
            _ => continue,
        };
        for parent in parents {
            if !visited.contains(&parent) {
                queue.push(parent);
            }
        }
    }

    Ok(false)
}

fn strip_newline(data: &[u8]) -> &[u8] {
    if data.last() == Some(&b'\n') {
        &data[..data.len() - 1]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RefSpec;

    fn oid(byte: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[19] = byte;
        ObjectId::from_bytes(&bytes, git_hash::HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn fetch_with_no_matching_refspec_is_a_no_op() {
        let refs = vec![(oid(1), BString::from("refs/heads/main"))];
        let mapped = map_refs(&refs, &[]);
        assert!(mapped.is_empty());
    }

    #[test]
    fn fetch_maps_refs_through_refspec() {
        let refs = vec![(oid(1), BString::from("refs/heads/main"))];
        let specs = vec![RefSpec::parse("+refs/heads/*:refs/remotes/origin/*").unwrap()];
        let mapped = map_refs(&refs, &specs);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].2, "refs/remotes/origin/main");
    }

    #[test]
    fn strip_newline_removes_trailing_newline() {
        assert_eq!(strip_newline(b"hello\n"), b"hello");
        assert_eq!(strip_newline(b"hello"), b"hello");
    }
}
