//! On-disk placement of artifacts.
//!
//! The artifact for key `k` lives at `<root>/<d[0..2]>/<d[2..4]>/<d>`, where
//! `d` is the hex SHA-256 of `k`. Any two distinct keys map to distinct
//! files whatever their length or nesting. Each file starts with the key and
//! a newline, followed by the payload, so the startup scan rebuilds the index
//! from file contents alone.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use rpc_cache_protocol::key::MAX_KEY_LEN;
use rpc_cache_protocol::ArtifactKey;

const HEADER_END: u8 = b'\n';

/// Hex digest naming the artifact file for `key`.
pub fn file_name(key: &ArtifactKey) -> String {
    hex::encode(key.digest())
}

/// Absolute path of the artifact file for `key` under `root`.
pub fn artifact_path(root: &Path, key: &ArtifactKey) -> PathBuf {
    let name = file_name(key);
    root.join(&name[0..2]).join(&name[2..4]).join(name)
}

/// Whether `name` could be an artifact file name.
pub fn is_artifact_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Header written before the payload.
pub fn header(key: &ArtifactKey) -> Vec<u8> {
    let mut header = Vec::with_capacity(key.as_str().len() + 1);
    header.extend_from_slice(key.as_str().as_bytes());
    header.push(HEADER_END);
    header
}

pub fn header_len(key: &ArtifactKey) -> u64 {
    key.as_str().len() as u64 + 1
}

/// Split a whole artifact file into its recorded key and payload.
pub fn split(contents: &[u8]) -> Option<(&str, &[u8])> {
    let end = contents.iter().take(MAX_KEY_LEN + 1).position(|b| *b == HEADER_END)?;
    let key = std::str::from_utf8(&contents[..end]).ok()?;
    Some((key, &contents[end + 1..]))
}

/// Read only the key recorded at the start of an artifact file.
///
/// Returns `None` when the header is missing or not a valid key.
pub fn read_key(path: &Path) -> io::Result<Option<ArtifactKey>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let limit = (MAX_KEY_LEN + 1) as u64;
    io::Read::take(&mut reader, limit).read_until(HEADER_END, &mut line)?;
    if line.pop() != Some(HEADER_END) {
        return Ok(None);
    }
    Ok(String::from_utf8(line).ok().and_then(|raw| ArtifactKey::parse(raw).ok()))
}
