//! The build environment: the mutable mapping from absolute paths to
//! artifacts, backed by lazy inspection of the real filesystem.
//!
//! The first time a path is looked up we stat it and intern an artifact of
//! the right kind; afterwards the environment's logical view is
//! authoritative, so emulated builds see their own effects rather than the
//! disk.

use std::collections::HashMap;
use std::path::Path;

use crate::artifact::{Artifact, ArtifactId, ArtifactKind, Match, Slot};
use crate::canon;
use crate::densemap::DenseMap;
use crate::ir::{CommandId, SpecialKind};
use crate::version::{
    ContentVersion, ContentVersionId, FileVersion, FingerprintLevel, MetadataVersion,
    MetadataVersionId, SymlinkVersion, VersionStore,
};

pub struct Env {
    pub versions: VersionStore,
    artifacts: DenseMap<ArtifactId, Artifact>,
    paths: HashMap<String, ArtifactId>,
    fingerprint: FingerprintLevel,
    /// The working tree; paths under it count as "local" for fingerprint
    /// policy.
    build_root: String,
    cwd: String,
    root: ArtifactId,
    tmp: Option<ArtifactId>,
    specials: [Option<ArtifactId>; 3],
    umask: u32,
    euid: u32,
    egid: u32,
}

fn process_umask() -> u32 {
    // There is no way to read the umask without setting it.
    unsafe {
        let mask = libc::umask(0);
        libc::umask(mask);
        mask as u32
    }
}

impl Env {
    pub fn new(versions: VersionStore, cwd: String, fingerprint: FingerprintLevel) -> Env {
        let cwd = canon::normalize(&cwd);
        let mut env = Env {
            versions,
            artifacts: DenseMap::new(),
            paths: HashMap::new(),
            fingerprint,
            build_root: cwd.clone(),
            cwd,
            root: ArtifactId(0),
            tmp: None,
            specials: [None, None, None],
            umask: process_umask(),
            euid: unsafe { libc::geteuid() },
            egid: unsafe { libc::getegid() },
        };
        let meta = env.stat_metadata("/");
        let root = env.artifacts.push(Artifact::dir_on_disk("/".to_string(), meta));
        env.paths.insert("/".to_string(), root);
        env.root = root;
        env
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        self.artifacts.get(id)
    }

    pub fn artifact_mut(&mut self, id: ArtifactId) -> &mut Artifact {
        self.artifacts.get_mut(id)
    }

    pub fn artifact_ids(&self) -> impl Iterator<Item = ArtifactId> {
        self.artifacts.ids()
    }

    pub fn push_artifact(&mut self, a: Artifact) -> ArtifactId {
        self.artifacts.push(a)
    }

    pub fn root_dir(&self) -> ArtifactId {
        self.root
    }

    pub fn cwd_path(&self) -> &str {
        &self.cwd
    }

    pub fn umask(&self) -> u32 {
        self.umask
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }

    pub fn egid(&self) -> u32 {
        self.egid
    }

    /// Does the fingerprint policy hash content at this path?
    pub fn hashes(&self, path: &str) -> bool {
        self.fingerprint.hashes(path.starts_with(&self.build_root))
    }

    /// Look up the artifact at an absolute normalized path, interning from
    /// the real filesystem on first sight.  None means the path does not
    /// exist on disk either.
    pub fn get_path(&mut self, path: &str) -> Option<ArtifactId> {
        if let Some(&id) = self.paths.get(path) {
            return Some(id);
        }
        let id = self.intern_from_disk(path)?;
        self.paths.insert(path.to_string(), id);
        Some(id)
    }

    /// Record that `path` now names `id`, e.g. after a creating syscall.
    pub fn install(&mut self, path: &str, id: ArtifactId) {
        if self.artifacts.get(id).path.is_none() {
            self.artifacts.get_mut(id).path = Some(path.to_string());
        }
        self.paths.insert(path.to_string(), id);
    }

    /// Forget the artifact at `path`, e.g. after an unlink.
    pub fn remove(&mut self, path: &str) {
        self.paths.remove(path);
    }

    /// All known path bindings, for the final-state walk.
    pub fn path_bindings(&self) -> Vec<(String, ArtifactId)> {
        let mut v: Vec<_> = self.paths.iter().map(|(p, &id)| (p.clone(), id)).collect();
        v.sort();
        v
    }

    pub fn temp_dir(&mut self) -> ArtifactId {
        if let Some(id) = self.tmp {
            return id;
        }
        let path = canon::normalize(&std::env::temp_dir().to_string_lossy());
        let id = match self.get_path(&path) {
            Some(id) => id,
            None => {
                let meta = self.stat_metadata(&path);
                let id = self.artifacts.push(Artifact::dir_on_disk(path.clone(), meta));
                self.paths.insert(path, id);
                id
            }
        };
        self.tmp = Some(id);
        id
    }

    /// The artifact for a special reference kind.
    pub fn special(&mut self, kind: SpecialKind) -> ArtifactId {
        match kind {
            SpecialKind::Root => self.root,
            SpecialKind::Cwd => {
                let cwd = self.cwd.clone();
                self.get_path(&cwd).expect("working directory exists")
            }
            SpecialKind::Tmp => self.temp_dir(),
            SpecialKind::Stdin | SpecialKind::Stdout | SpecialKind::Stderr => {
                let (slot, name) = match kind {
                    SpecialKind::Stdin => (0, "<stdin>"),
                    SpecialKind::Stdout => (1, "<stdout>"),
                    _ => (2, "<stderr>"),
                };
                if let Some(id) = self.specials[slot] {
                    return id;
                }
                let meta = self.versions.push_metadata(MetadataVersion {
                    uid: self.euid,
                    gid: self.egid,
                    mode: 0o600,
                });
                let id = self.artifacts.push(Artifact::special(name, meta));
                self.specials[slot] = Some(id);
                id
            }
        }
    }

    /// An anonymous file created by the build (O_CREAT, O_TMPFILE).
    pub fn create_file(&mut self, mode: u32) -> ArtifactId {
        let meta = self.created_metadata(mode);
        let content = self.versions.push_content(ContentVersion::File(FileVersion::new_empty()));
        self.artifacts.push(Artifact::anonymous_file(meta, content))
    }

    pub fn create_dir(&mut self, mode: u32) -> ArtifactId {
        let meta = self.created_metadata(mode);
        self.artifacts.push(Artifact::anonymous_dir(meta))
    }

    pub fn create_symlink(&mut self, target: &str) -> ArtifactId {
        let meta = self.created_metadata(0o777);
        let content = self.versions.push_content(ContentVersion::Symlink(SymlinkVersion {
            target: target.to_string(),
        }));
        self.artifacts.push(Artifact::symlink(None, meta, content, target.to_string(), false))
    }

    pub fn create_pipe(&mut self) -> ArtifactId {
        let meta = self.versions.push_metadata(MetadataVersion {
            uid: self.euid,
            gid: self.egid,
            mode: 0o600,
        });
        self.artifacts.push(Artifact::pipe(meta))
    }

    fn created_metadata(&mut self, mode: u32) -> crate::version::MetadataVersionId {
        self.versions.push_metadata(MetadataVersion {
            uid: self.euid,
            gid: self.egid,
            mode: mode & !self.umask,
        })
    }

    fn stat_metadata(&mut self, path: &str) -> crate::version::MetadataVersionId {
        let v = MetadataVersion::of_path(Path::new(path)).unwrap_or(MetadataVersion {
            uid: self.euid,
            gid: self.egid,
            mode: 0o755,
        });
        self.versions.push_metadata(v)
    }

    /// The artifact's current content version, manufacturing computed
    /// versions (directory listings, pipe reads) on demand.
    pub fn current_content(&mut self, id: ArtifactId) -> Option<ContentVersionId> {
        let artifact = self.artifacts.get(id);
        artifact.current_content(&mut self.versions)
    }

    pub fn current_metadata(&self, id: ArtifactId) -> Option<MetadataVersionId> {
        self.artifacts.get(id).metadata.current()
    }

    /// Check an artifact's content against an expected version.
    pub fn match_artifact_content(
        &mut self,
        id: ArtifactId,
        expected: ContentVersionId,
    ) -> Match<ContentVersionId> {
        let artifact = self.artifacts.get(id);
        artifact.match_content(&mut self.versions, expected)
    }

    pub fn match_artifact_metadata(
        &self,
        id: ArtifactId,
        expected: MetadataVersionId,
    ) -> Match<MetadataVersionId> {
        self.artifacts.get(id).match_metadata(&self.versions, expected)
    }

    pub fn update_artifact_content(&mut self, id: ArtifactId, writer: CommandId, v: ContentVersionId) {
        let artifact = self.artifacts.get_mut(id);
        artifact.update_content(writer, v, &self.versions)
    }

    /// Record a pipe write event, returning its version.
    pub fn pipe_write(&mut self, id: ArtifactId, writer: CommandId) -> ContentVersionId {
        let artifact = self.artifacts.get_mut(id);
        artifact.pipe_write(writer, &mut self.versions)
    }

    /// Compare an artifact's produced content to the disk at `path`.
    pub fn check_final(
        &mut self,
        id: ArtifactId,
        path: &str,
    ) -> Option<(ContentVersionId, Option<ContentVersionId>)> {
        let hash = self.hashes(path);
        let artifact = self.artifacts.get(id);
        artifact.check_final_state(&mut self.versions, Path::new(path), hash)
    }

    /// Commit pending state at `path` and fingerprint the result.
    pub fn apply_final(&mut self, id: ArtifactId, path: &str) -> std::io::Result<Option<ContentVersionId>> {
        let hash = self.hashes(path);
        let artifact = self.artifacts.get_mut(id);
        artifact.apply_final_state(&mut self.versions, Path::new(path), hash)
    }

    /// Fingerprint whatever the disk currently holds behind `id`.
    pub fn observe_on_disk(&mut self, id: ArtifactId) -> Option<ContentVersionId> {
        let path = self.artifacts.get(id).path.clone()?;
        let hash = self.hashes(&path);
        let artifact = self.artifacts.get(id);
        match &artifact.kind {
            ArtifactKind::File(_) => FileVersion::of_path(Path::new(&path), hash)
                .ok()
                .map(|v| self.versions.push_content(ContentVersion::File(v))),
            ArtifactKind::Symlink(_) => std::fs::read_link(Path::new(&path)).ok().map(|t| {
                self.versions.push_content(ContentVersion::Symlink(SymlinkVersion {
                    target: t.to_string_lossy().into_owned(),
                }))
            }),
            ArtifactKind::Dir(_) => {
                let listing = artifact.listing();
                Some(self.versions.push_content(ContentVersion::Dir(listing)))
            }
            _ => None,
        }
    }

    pub fn observe_metadata_on_disk(&mut self, id: ArtifactId) -> Option<MetadataVersionId> {
        let path = self.artifacts.get(id).path.clone()?;
        MetadataVersion::of_path(Path::new(&path))
            .ok()
            .map(|v| self.versions.push_metadata(v))
    }

    /// Re-inspect the disk behind an artifact after a traced command ran,
    /// replacing its committed content with a fresh observation.
    pub fn refresh_from_disk(&mut self, id: ArtifactId) {
        let path = match self.artifacts.get(id).path.clone() {
            Some(p) => p,
            None => return,
        };
        let hash = self.hashes(&path);
        let is_file = matches!(self.artifacts.get(id).kind, ArtifactKind::File(_));
        let is_symlink = matches!(self.artifacts.get(id).kind, ArtifactKind::Symlink(_));
        if is_file {
            if let Ok(v) = FileVersion::of_path(Path::new(&path), hash) {
                let vid = self.versions.push_content(ContentVersion::File(v));
                if let ArtifactKind::File(f) = &mut self.artifacts.get_mut(id).kind {
                    f.content = Slot::committed(vid);
                }
            }
        } else if is_symlink {
            if let Ok(target) = std::fs::read_link(Path::new(&path)) {
                let target = target.to_string_lossy().into_owned();
                let vid = self.versions.push_content(ContentVersion::Symlink(SymlinkVersion {
                    target: target.clone(),
                }));
                if let ArtifactKind::Symlink(s) = &mut self.artifacts.get_mut(id).kind {
                    s.content = Slot::committed(vid);
                    s.target = target;
                }
            }
        }
        // Directory listings are computed from disk on demand; pipes and
        // specials have nothing on disk.
        if let Ok(mv) = MetadataVersion::of_path(Path::new(&path)) {
            let vid = self.versions.push_metadata(mv);
            self.artifacts.get_mut(id).metadata = Slot::committed(vid);
        }
    }

    fn intern_from_disk(&mut self, path: &str) -> Option<ArtifactId> {
        let p = Path::new(path);
        let meta = std::fs::symlink_metadata(p).ok()?;
        let mv = self.versions.push_metadata(MetadataVersion {
            uid: std::os::unix::fs::MetadataExt::uid(&meta),
            gid: std::os::unix::fs::MetadataExt::gid(&meta),
            mode: std::os::unix::fs::MetadataExt::mode(&meta) & 0o7777,
        });
        let ft = meta.file_type();
        let artifact = if ft.is_dir() {
            Artifact::dir_on_disk(path.to_string(), mv)
        } else if ft.is_symlink() {
            let target = std::fs::read_link(p).ok()?.to_string_lossy().into_owned();
            let cv = self.versions.push_content(ContentVersion::Symlink(SymlinkVersion {
                target: target.clone(),
            }));
            Artifact::symlink(Some(path.to_string()), mv, cv, target, true)
        } else if ft.is_file() {
            let hash = self.hashes(path);
            let fv = FileVersion::of_path(p, hash).ok()?;
            let cv = self.versions.push_content(ContentVersion::File(fv));
            Artifact::file(Some(path.to_string()), mv, cv)
        } else {
            // Device nodes, sockets, fifos on disk.
            return Some(self.artifacts.push(Artifact::special(path, mv)));
        };
        Some(self.artifacts.push(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;

    fn env_at(dir: &Path) -> Env {
        Env::new(
            VersionStore::new(),
            dir.to_string_lossy().into_owned(),
            FingerprintLevel::Local,
        )
    }

    #[test]
    fn interns_files_lazily() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("in.txt"), "data")?;
        let mut env = env_at(tmp.path());

        let path = canon::join(env.cwd_path(), "in.txt");
        let id = env.get_path(&path).expect("file interned");
        assert!(matches!(env.artifact(id).kind, ArtifactKind::File(_)));
        // Second lookup is the same artifact.
        assert_eq!(env.get_path(&path), Some(id));
        Ok(())
    }

    #[test]
    fn missing_path_is_none_until_installed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut env = env_at(tmp.path());
        let path = canon::join(env.cwd_path(), "out");
        assert_eq!(env.get_path(&path), None);

        let id = env.create_file(0o666);
        env.install(&path, id);
        assert_eq!(env.get_path(&path), Some(id));
        assert_eq!(env.artifact(id).path.as_deref(), Some(path.as_str()));

        env.remove(&path);
        // The file never hit the disk, so the path is gone again.
        assert_eq!(env.get_path(&path), None);
        Ok(())
    }

    #[test]
    fn root_is_an_opaque_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = env_at(tmp.path());
        let root = env.root_dir();
        assert!(env.artifact(root).is_opaque_dir());
    }

    #[test]
    fn created_mode_honors_umask() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = env_at(tmp.path());
        let umask = env.umask();
        let id = env.create_file(0o666);
        let meta = env.artifact(id).metadata.current().unwrap();
        assert_eq!(env.versions.metadata(meta).mode, 0o666 & !umask);
    }
}
