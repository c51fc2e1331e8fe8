//! Immutable snapshots of filesystem state and the store that manufactures,
//! compares, persists, and restores them.
//!
//! A version is equality-comparable without touching the disk: file versions
//! carry an mtime+size fingerprint and optionally a content hash, and the
//! content behind a hashed version can be parked in a blob cache so it can
//! be restored on a later build without re-running its producer.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::artifact::ArtifactId;
use crate::densemap::{declare_id, DenseMap};
use crate::ir::CommandId;

declare_id!(MetadataVersionId);
declare_id!(ContentVersionId);

/// How aggressively file content is hashed when fingerprinting.
/// Fingerprints (mtime+size) are always collected; hashing lets two
/// versions match even when the fingerprint changed, at the cost of
/// reading every file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintLevel {
    None,
    Local,
    All,
}

impl FingerprintLevel {
    /// Should content under this policy be hashed, given whether the path
    /// lives under the working tree?
    pub fn hashes(self, local: bool) -> bool {
        match self {
            FingerprintLevel::None => false,
            FingerprintLevel::Local => local,
            FingerprintLevel::All => true,
        }
    }
}

/// A SHA-256 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn of_file(path: &Path) -> std::io::Result<ContentHash> {
        let mut f = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(ContentHash(hasher.finalize().into()))
    }
}

/// uid/gid/mode as observed or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataVersion {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl MetadataVersion {
    pub fn of_path(path: &Path) -> std::io::Result<MetadataVersion> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(MetadataVersion {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
        })
    }

    /// A permission check against these bits for the calling user.
    /// Owner bits apply to the owning uid, group bits to the owning gid,
    /// other bits to everyone else.  Root passes everything.
    pub fn allows(&self, r: bool, w: bool, x: bool, euid: u32, egid: u32) -> bool {
        if euid == 0 {
            return true;
        }
        let shift = if euid == self.uid {
            6
        } else if egid == self.gid {
            3
        } else {
            0
        };
        let bits = (self.mode >> shift) & 0o7;
        (!r || bits & 0o4 != 0) && (!w || bits & 0o2 != 0) && (!x || bits & 0o1 != 0)
    }
}

/// The cheap summary used to decide file equality without hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub size: u64,
}

/// A snapshot of a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    /// Known to hold zero bytes (a fresh creation or truncation).
    pub empty: bool,
    pub fingerprint: Option<Fingerprint>,
    pub hash: Option<ContentHash>,
}

impl FileVersion {
    /// A version for a file the build created but has not yet realized.
    pub fn new_empty() -> FileVersion {
        FileVersion { empty: true, fingerprint: None, hash: None }
    }

    /// Inspect the file at `path`, hashing its content if asked to.
    pub fn of_path(path: &Path, hash: bool) -> std::io::Result<FileVersion> {
        let meta = std::fs::metadata(path)?;
        let fingerprint = Fingerprint {
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            size: meta.len(),
        };
        let hash = if hash { Some(ContentHash::of_file(path)?) } else { None };
        Ok(FileVersion {
            empty: meta.len() == 0,
            fingerprint: Some(fingerprint),
            hash,
        })
    }

    /// Version equality.  Hashes decide when both sides carry one (the
    /// fingerprint policy hashed this file); otherwise the mtime+size
    /// fingerprints must agree.
    pub fn matches(&self, other: &FileVersion) -> bool {
        if self.empty && other.empty {
            return true;
        }
        if let (Some(a), Some(b)) = (self.hash, other.hash) {
            return a == b;
        }
        match (self.fingerprint, other.fingerprint) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A snapshot of a symlink's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkVersion {
    pub target: String,
}

/// A snapshot of a directory's entry list.  Entry targets are meaningful
/// only in-memory; across a trace round-trip only the names survive, and
/// matching is by name.
#[derive(Debug, Clone, PartialEq)]
pub struct DirListVersion {
    pub entries: BTreeMap<String, Option<ArtifactId>>,
    /// The listing sits on top of whatever the real filesystem holds; an
    /// opaque listing trusts the disk for names not in `entries`.
    pub opaque: bool,
}

impl DirListVersion {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn matches(&self, other: &DirListVersion) -> bool {
        self.entries.len() == other.entries.len()
            && self.names().eq(other.names())
    }
}

/// A write event on a pipe: who wrote, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeWriteVersion {
    pub writer: Option<CommandId>,
    pub seq: u32,
}

/// A read event on a pipe, identified by the write it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeReadVersion {
    pub writer: Option<CommandId>,
    pub seq: u32,
}

/// The content side of a version, one variant per artifact kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentVersion {
    File(FileVersion),
    Symlink(SymlinkVersion),
    Dir(DirListVersion),
    PipeWrite(PipeWriteVersion),
    PipeRead(PipeReadVersion),
}

impl ContentVersion {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ContentVersion::File(_) => "file",
            ContentVersion::Symlink(_) => "symlink",
            ContentVersion::Dir(_) => "dir",
            ContentVersion::PipeWrite(_) => "pipe write",
            ContentVersion::PipeRead(_) => "pipe read",
        }
    }
}

#[derive(Debug, Clone)]
struct ContentEntry {
    version: ContentVersion,
    /// Path of the cached blob for hashed file content, once parked.
    cached: Option<PathBuf>,
    /// Table IDs assigned when this version passed through a trace.
    write_id: Option<u16>,
    read_id: Option<u16>,
}

#[derive(Debug, Clone)]
struct MetadataEntry {
    version: MetadataVersion,
    write_id: Option<u16>,
    read_id: Option<u16>,
}

/// The arena of all versions seen in a build: those read back from the
/// previous trace plus those manufactured this run.  Versions are immutable
/// once pushed; only the bookkeeping (trace IDs, cache path) is filled in
/// later, and each of those is set-once.
#[derive(Debug, Clone, Default)]
pub struct VersionStore {
    metadata: DenseMap<MetadataVersionId, MetadataEntry>,
    contents: DenseMap<ContentVersionId, ContentEntry>,
}

impl VersionStore {
    pub fn new() -> VersionStore {
        VersionStore::default()
    }

    pub fn push_metadata(&mut self, v: MetadataVersion) -> MetadataVersionId {
        self.metadata.push(MetadataEntry { version: v, write_id: None, read_id: None })
    }

    pub fn push_content(&mut self, v: ContentVersion) -> ContentVersionId {
        self.contents.push(ContentEntry {
            version: v,
            cached: None,
            write_id: None,
            read_id: None,
        })
    }

    pub fn metadata(&self, id: MetadataVersionId) -> &MetadataVersion {
        &self.metadata.get(id).version
    }

    pub fn content(&self, id: ContentVersionId) -> &ContentVersion {
        &self.contents.get(id).version
    }

    pub fn content_count(&self) -> usize {
        self.contents.len()
    }

    pub fn metadata_matches(&self, a: MetadataVersionId, b: MetadataVersionId) -> bool {
        a == b || self.metadata(a) == self.metadata(b)
    }

    /// Version equality as defined per kind.
    pub fn content_matches(&self, a: ContentVersionId, b: ContentVersionId) -> bool {
        if a == b {
            return true;
        }
        match (self.content(a), self.content(b)) {
            (ContentVersion::File(x), ContentVersion::File(y)) => x.matches(y),
            (ContentVersion::Symlink(x), ContentVersion::Symlink(y)) => x.target == y.target,
            (ContentVersion::Dir(x), ContentVersion::Dir(y)) => x.matches(y),
            (ContentVersion::PipeWrite(x), ContentVersion::PipeWrite(y)) => x == y,
            (ContentVersion::PipeRead(x), ContentVersion::PipeRead(y)) => x == y,
            _ => false,
        }
    }

    pub fn cached(&self, id: ContentVersionId) -> Option<&Path> {
        self.contents.get(id).cached.as_deref()
    }

    pub fn set_cached(&mut self, id: ContentVersionId, path: PathBuf) {
        let entry = self.contents.get_mut(id);
        if entry.cached.is_none() {
            entry.cached = Some(path);
        }
    }

    pub fn content_write_id(&self, id: ContentVersionId) -> Option<u16> {
        self.contents.get(id).write_id
    }

    pub fn set_content_write_id(&mut self, id: ContentVersionId, table_id: u16) {
        self.contents.get_mut(id).write_id = Some(table_id);
    }

    pub fn set_content_read_id(&mut self, id: ContentVersionId, table_id: u16) {
        self.contents.get_mut(id).read_id = Some(table_id);
    }

    pub fn metadata_write_id(&self, id: MetadataVersionId) -> Option<u16> {
        self.metadata.get(id).write_id
    }

    pub fn set_metadata_write_id(&mut self, id: MetadataVersionId, table_id: u16) {
        self.metadata.get_mut(id).write_id = Some(table_id);
    }

    pub fn set_metadata_read_id(&mut self, id: MetadataVersionId, table_id: u16) {
        self.metadata.get_mut(id).read_id = Some(table_id);
    }

    /// Park a hashed file version's content in the blob cache, remembering
    /// where it landed.
    pub fn cache(&mut self, id: ContentVersionId, path: &Path, cache: &BlobCache) -> std::io::Result<()> {
        if self.cached(id).is_some() {
            return Ok(());
        }
        let hash = match self.content(id) {
            ContentVersion::File(f) => match f.hash {
                Some(h) => h,
                None => return Ok(()), // not content-addressable
            },
            _ => return Ok(()),
        };
        let blob = cache.save(hash, path)?;
        self.set_cached(id, blob);
        Ok(())
    }

    /// Realize a content version at `path`.
    pub fn commit_content(&self, id: ContentVersionId, path: &Path) -> std::io::Result<()> {
        match self.content(id) {
            ContentVersion::File(f) => {
                if let Some(blob) = self.cached(id) {
                    std::fs::copy(blob, path)?;
                } else if f.empty {
                    std::fs::write(path, b"")?;
                } else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "file content is not cached and cannot be recreated",
                    ));
                }
            }
            ContentVersion::Symlink(s) => {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                std::os::unix::fs::symlink(&s.target, path)?;
            }
            ContentVersion::Dir(_) => {
                std::fs::create_dir_all(path)?;
            }
            ContentVersion::PipeWrite(_) | ContentVersion::PipeRead(_) => {}
        }
        Ok(())
    }

    /// Realize a metadata version at `path` (chmod, then chown).
    pub fn commit_metadata(&self, id: MetadataVersionId, path: &Path) -> std::io::Result<()> {
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::fs::PermissionsExt;
        let v = self.metadata(id);
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(v.mode))?;
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let ret = unsafe { libc::chown(cpath.as_ptr(), v.uid, v.gid) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // Non-root builds cannot chown; only surface real failures.
            if err.raw_os_error() != Some(libc::EPERM) {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// An on-disk cache of file content addressed by hash.
#[derive(Debug, Clone)]
pub struct BlobCache {
    dir: PathBuf,
}

impl BlobCache {
    pub fn new(dir: impl Into<PathBuf>) -> BlobCache {
        BlobCache { dir: dir.into() }
    }

    pub fn blob_path(&self, hash: ContentHash) -> PathBuf {
        self.dir.join(hash.hex())
    }

    /// Park `src` under its hash, hard-linking when possible.
    pub fn save(&self, hash: ContentHash, src: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let dst = self.blob_path(hash);
        if dst.exists() {
            return Ok(dst);
        }
        if std::fs::hard_link(src, &dst).is_err() {
            std::fs::copy(src, &dst)?;
        }
        Ok(dst)
    }

    /// Find a previously parked blob, if any.
    pub fn lookup(&self, hash: ContentHash) -> Option<PathBuf> {
        let path = self.blob_path(hash);
        path.exists().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(mtime: i64, size: u64) -> FileVersion {
        FileVersion {
            empty: size == 0,
            fingerprint: Some(Fingerprint { mtime, mtime_nsec: 0, size }),
            hash: None,
        }
    }

    #[test]
    fn file_match_by_fingerprint() {
        assert!(fp(100, 5).matches(&fp(100, 5)));
        assert!(!fp(100, 5).matches(&fp(101, 5)));
        assert!(!fp(100, 5).matches(&fp(100, 6)));
    }

    #[test]
    fn file_match_by_hash_overrides_fingerprint() {
        let h = ContentHash([7; 32]);
        let mut a = fp(100, 5);
        let mut b = fp(200, 5);
        a.hash = Some(h);
        b.hash = Some(h);
        assert!(a.matches(&b));
        b.hash = Some(ContentHash([8; 32]));
        assert!(!a.matches(&b));
    }

    #[test]
    fn empty_matches_empty() {
        assert!(FileVersion::new_empty().matches(&fp(50, 0)));
    }

    #[test]
    fn metadata_allows() {
        let v = MetadataVersion { uid: 1000, gid: 1000, mode: 0o640 };
        assert!(v.allows(true, true, false, 1000, 1000));
        assert!(v.allows(true, false, false, 1001, 1000));
        assert!(!v.allows(false, true, false, 1001, 1000));
        assert!(!v.allows(true, false, false, 1001, 1001));
        assert!(v.allows(true, true, true, 0, 0));
    }

    #[test]
    fn dir_match_is_by_name() {
        let a = DirListVersion {
            entries: [("x".to_string(), Some(ArtifactId(1))), ("y".to_string(), None)]
                .into_iter()
                .collect(),
            opaque: false,
        };
        let b = DirListVersion {
            entries: [("x".to_string(), None), ("y".to_string(), Some(ArtifactId(9)))]
                .into_iter()
                .collect(),
            opaque: false,
        };
        assert!(a.matches(&b));
        let c = DirListVersion {
            entries: [("x".to_string(), None)].into_iter().collect(),
            opaque: false,
        };
        assert!(!a.matches(&c));
    }

    #[test]
    fn store_same_id_always_matches() {
        let mut store = VersionStore::new();
        let id = store.push_content(ContentVersion::File(FileVersion::new_empty()));
        assert!(store.content_matches(id, id));
    }

    #[test]
    fn store_pipe_versions() {
        let mut store = VersionStore::new();
        let a = store.push_content(ContentVersion::PipeWrite(PipeWriteVersion {
            writer: Some(CommandId(1)),
            seq: 0,
        }));
        let b = store.push_content(ContentVersion::PipeWrite(PipeWriteVersion {
            writer: Some(CommandId(1)),
            seq: 0,
        }));
        let c = store.push_content(ContentVersion::PipeWrite(PipeWriteVersion {
            writer: Some(CommandId(2)),
            seq: 0,
        }));
        assert!(store.content_matches(a, b));
        assert!(!store.content_matches(a, c));
    }


    #[test]
    fn fingerprint_and_cache_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("input");
        std::fs::write(&src, b"hello\n")?;

        let v = FileVersion::of_path(&src, true)?;
        assert!(!v.empty);
        let hash = v.hash.unwrap();

        let cache = BlobCache::new(dir.path().join("cache"));
        let mut store = VersionStore::new();
        let id = store.push_content(ContentVersion::File(v));
        store.cache(id, &src, &cache)?;
        assert!(store.cached(id).is_some());

        // Restore through commit_content at a fresh path.
        let dst = dir.path().join("restored");
        store.commit_content(id, &dst)?;
        assert_eq!(std::fs::read(&dst)?, b"hello\n");
        Ok(())
    }
}
