//! Content-addressed blob storage
//!
//! Binary payloads live beside a table file (`users.jsonl` -> `users.blobs/`),
//! and rows carry only a reference string:
//!
//! ```text
//! sha256:<52 base32hex chars>-<size>
//! ```
//!
//! Files are fanned out by the first two digest characters:
//! `<dir>/<digest[..2]>/<digest[2..]>-<size>`. Writes land in `<dir>/tmp/`
//! first and are renamed into place, so a reader never sees a partial blob.
//!
//! There is no reference counting: deleting the rows that point at a blob
//! leaves the blob on disk.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::{Result, StoreError};

pub const BLOB_REF_PREFIX: &str = "sha256:";
pub const BLOB_DIR_SUFFIX: &str = ".blobs";

const DIGEST_LEN: usize = 52;
const TMP_DIR: &str = "tmp";

/// RFC 4648 "extended hex" alphabet. ASCII-ordered and safe on
/// case-insensitive filesystems.
const BASE32HEX: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// A validated blob reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef(String);

impl BlobRef {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidBlobRef(s.to_string());

        let rest = s.strip_prefix(BLOB_REF_PREFIX).ok_or_else(invalid)?;
        if rest.len() < DIGEST_LEN + 2 || rest.as_bytes()[DIGEST_LEN] != b'-' {
            return Err(invalid());
        }
        let (digest, size) = (&rest[..DIGEST_LEN], &rest[DIGEST_LEN + 1..]);

        if !digest.bytes().all(|c| BASE32HEX.contains(&c)) {
            return Err(invalid());
        }
        if !size.bytes().all(|c| c.is_ascii_digit()) || (size.len() > 1 && size.starts_with('0')) {
            return Err(invalid());
        }
        size.parse::<u64>().map_err(|_| invalid())?;

        Ok(BlobRef(s.to_string()))
    }

    fn from_digest(digest: &[u8], size: u64) -> Self {
        BlobRef(format!("{}{}-{}", BLOB_REF_PREFIX, base32hex(digest), size))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base32hex SHA-256 digest.
    pub fn digest(&self) -> &str {
        &self.0[BLOB_REF_PREFIX.len()..BLOB_REF_PREFIX.len() + DIGEST_LEN]
    }

    /// Content length in bytes.
    pub fn size(&self) -> u64 {
        self.0[BLOB_REF_PREFIX.len() + DIGEST_LEN + 1..]
            .parse()
            .unwrap_or_default()
    }

    fn shard(&self) -> &str {
        &self.digest()[..2]
    }

    fn file_name(&self) -> &str {
        &self.0[BLOB_REF_PREFIX.len() + 2..]
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        BlobRef::parse(s)
    }
}

impl TryFrom<String> for BlobRef {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        BlobRef::parse(&s)
    }
}

impl From<BlobRef> for String {
    fn from(r: BlobRef) -> Self {
        r.0
    }
}

/// Unpadded base32hex, most significant bits first.
fn base32hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &b in bytes {
        buffer = ((buffer << 8) | u32::from(b)) & 0xFFFF;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32HEX[((buffer >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32HEX[((buffer << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

/// Blob directory for a table file: `dir/users.jsonl` -> `dir/users.blobs`.
pub fn blob_dir_for(table_path: &Path) -> PathBuf {
    let stem = table_path
        .file_stem()
        .unwrap_or_else(|| table_path.as_os_str());
    let mut name = stem.to_os_string();
    name.push(BLOB_DIR_SUFFIX);
    table_path.with_file_name(name)
}

/// Content-addressed files under one directory
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store that sits beside `table_path`.
    pub fn for_table(table_path: &Path) -> Self {
        Self::new(blob_dir_for(table_path))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, blob: &BlobRef) -> PathBuf {
        self.dir.join(blob.shard()).join(blob.file_name())
    }

    pub fn contains(&self, blob: &BlobRef) -> bool {
        self.path_for(blob).is_file()
    }

    /// Store `bytes` and return their reference.
    ///
    /// Idempotent: if the content is already present nothing is written.
    pub fn store(&self, bytes: &[u8]) -> Result<BlobRef> {
        let blob = BlobRef::from_digest(&Sha256::digest(bytes), bytes.len() as u64);
        if self.contains(&blob) {
            tracing::debug!(blob = %blob, "blob already stored");
            return Ok(blob);
        }

        let mut writer = self.writer()?;
        if let Err(e) = writer.write_all(bytes) {
            let tmp = writer.tmp_path.clone();
            writer.abort()?;
            return Err(StoreError::io("write blob", tmp, e));
        }
        writer.finish()
    }

    /// Read the whole blob.
    pub fn fetch(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let path = self.path_for(blob);
        fs::read(&path).map_err(|e| self.map_read_error(blob, path, e))
    }

    /// Open the blob for streaming reads.
    pub fn open(&self, blob: &BlobRef) -> Result<File> {
        let path = self.path_for(blob);
        File::open(&path).map_err(|e| self.map_read_error(blob, path, e))
    }

    fn map_read_error(&self, blob: &BlobRef, path: PathBuf, e: io::Error) -> StoreError {
        if e.kind() == io::ErrorKind::NotFound {
            StoreError::BlobNotFound(blob.clone())
        } else {
            StoreError::io("read blob", path, e)
        }
    }

    /// Remove temp files left behind by writers that never finished, such
    /// as after a crash. Returns how many were removed.
    pub fn cleanup_tmp(&self) -> Result<usize> {
        let tmp_dir = self.dir.join(TMP_DIR);
        let entries = match fs::read_dir(&tmp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io("read blob tmp dir", &tmp_dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("read blob tmp dir", &tmp_dir, e))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "tmp") {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("remove blob temp file", &path, e)),
            }
        }

        if removed > 0 {
            tracing::debug!(dir = %tmp_dir.display(), removed, "removed stale blob temp files");
        }
        Ok(removed)
    }

    /// Start a streaming write.
    pub fn writer(&self) -> Result<BlobWriter> {
        let tmp_dir = self.dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).map_err(|e| StoreError::io("create blob tmp dir", &tmp_dir, e))?;

        let tmp_path = tmp_dir.join(format!("{}-{:016x}.tmp", std::process::id(), rand::random::<u64>()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|e| StoreError::io("create blob temp file", &tmp_path, e))?;

        Ok(BlobWriter {
            store: self.clone(),
            tmp_path,
            file: Some(file),
            hasher: Sha256::new(),
            size: 0,
        })
    }
}

/// Streams content into a blob, hashing as it goes.
///
/// Call [`BlobWriter::finish`] to move the content into place. Dropping the
/// writer without finishing removes the temp file.
pub struct BlobWriter {
    store: BlobStore,
    tmp_path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    size: u64,
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "blob writer is closed"))?;
        let n = file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWriter {
    pub fn finish(mut self) -> Result<BlobRef> {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                let _ = fs::remove_file(&self.tmp_path);
                return Err(StoreError::io("sync blob", &self.tmp_path, e));
            }
        }

        let hasher = std::mem::take(&mut self.hasher);
        let blob = BlobRef::from_digest(&hasher.finalize(), self.size);
        let target = self.store.path_for(&blob);

        let shard_dir = self.store.dir.join(blob.shard());
        if let Err(e) = fs::create_dir_all(&shard_dir) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(StoreError::io("create blob shard dir", shard_dir, e));
        }

        if target.is_file() {
            fs::remove_file(&self.tmp_path).map_err(|e| StoreError::io("remove blob temp file", &self.tmp_path, e))?;
        } else if let Err(e) = fs::rename(&self.tmp_path, &target) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(StoreError::io("rename blob", target, e));
        }

        tracing::debug!(blob = %blob, size = self.size, "stored blob");
        Ok(blob)
    }

    /// Discard everything written so far.
    pub fn abort(mut self) -> Result<()> {
        self.file.take();
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("remove blob temp file", &self.tmp_path, e)),
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
