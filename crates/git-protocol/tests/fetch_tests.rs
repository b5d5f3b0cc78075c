//! Integration tests for v1 ref advertisement parsing.

use std::io::Cursor;

use git_hash::ObjectId;
use git_protocol::pktline::{PktLineReader, PktLineWriter};
use git_protocol::v1;

/// Helper to build a v1 ref advertisement.
fn make_ref_advertisement(refs: &[(&str, &str)], caps: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);

    for (i, (oid, refname)) in refs.iter().enumerate() {
        if i == 0 && !caps.is_empty() {
            writer
                .write_text(&format!("{} {}\0{}", oid, refname, caps))
                .unwrap();
        } else {
            writer.write_text(&format!("{} {}", oid, refname)).unwrap();
        }
    }
    writer.write_flush().unwrap();
    buf
}

#[test]
fn parse_ref_advertisement_with_capabilities() {
    let oid = "95d09f2b10159347eece71399a7e2e907ea3df4f";
    let buf = make_ref_advertisement(
        &[
            (oid, "HEAD"),
            (oid, "refs/heads/main"),
            (oid, "refs/heads/develop"),
            (oid, "refs/tags/v1.0"),
        ],
        "multi_ack_detailed thin-pack side-band-64k ofs-delta no-done include-tag symref=HEAD:refs/heads/main agent=git/2.39.0",
    );

    let mut reader = PktLineReader::new(Cursor::new(buf));
    let (refs, caps) = v1::parse_ref_advertisement(&mut reader).unwrap();

    assert_eq!(refs.len(), 4);
    assert!(caps.has("multi_ack_detailed"));
    assert!(caps.has("thin-pack"));
    assert!(caps.has("side-band-64k"));
    assert!(caps.has("ofs-delta"));
    assert!(caps.has("no-done"));
    assert!(caps.has("include-tag"));
    assert_eq!(caps.get("symref"), Some("HEAD:refs/heads/main"));
    assert_eq!(caps.get("agent"), Some("git/2.39.0"));
}

#[test]
fn parse_ref_advertisement_single_ref() {
    let oid = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let buf = make_ref_advertisement(&[(oid, "HEAD")], "report-status delete-refs");

    let mut reader = PktLineReader::new(Cursor::new(buf));
    let (refs, caps) = v1::parse_ref_advertisement(&mut reader).unwrap();

    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].0, ObjectId::from_hex(oid).unwrap());
    assert!(caps.has("report-status"));
    assert!(caps.has("delete-refs"));
}

#[test]
fn parse_ref_advertisement_detects_v2_switch() {
    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);
    writer.write_text("version 2").unwrap();
    writer.write_flush().unwrap();

    let mut reader = PktLineReader::new(Cursor::new(buf));
    let (refs, caps) = v1::parse_ref_advertisement(&mut reader).unwrap();
    assert!(refs.is_empty());
    assert!(caps.entries().is_empty());
}
