//! Round-trip tests: serialize a pack → install it → read back and verify.

use git_hash::{hasher::Hasher, HashAlgorithm};
use git_object::ObjectType;
use git_pack::decode::decode_pack;
use git_pack::pack::PackFile;
use git_pack::write::write_single_object_pack;

#[test]
fn roundtrip_single_blob() {
    let content = b"roundtrip test blob";
    let (pack_bytes, oid) = write_single_object_pack(ObjectType::Blob, content).unwrap();

    let decoded = decode_pack(&pack_bytes, HashAlgorithm::Sha1, |_| None, None).unwrap();
    let entry = decoded.find(&oid).unwrap();
    assert_eq!(entry.obj_type, ObjectType::Blob);
    assert_eq!(entry.data, content);

    let dir = tempfile::tempdir().unwrap();
    let pack_path = git_pack::decode::install_pack(dir.path(), &pack_bytes, &decoded).unwrap();

    let pack = PackFile::open(&pack_path).unwrap();
    assert_eq!(pack.num_objects(), 1);
    let obj = pack.read_object(&oid).unwrap().unwrap();
    assert_eq!(obj.obj_type, ObjectType::Blob);
    assert_eq!(obj.data, content);
}

#[test]
fn roundtrip_verifies_expected_oid() {
    let content = b"another blob";
    let (pack_bytes, oid) = write_single_object_pack(ObjectType::Blob, content).unwrap();
    let expected = Hasher::hash_object(HashAlgorithm::Sha1, "blob", content).unwrap();
    assert_eq!(oid, expected);

    let decoded = decode_pack(&pack_bytes, HashAlgorithm::Sha1, |_| None, None).unwrap();
    assert_eq!(decoded.entries.len(), 1);
}
