//! Artifacts: persistent identities for the filesystem objects a build
//! touches, wrapping a sequence of versions.
//!
//! Each artifact tracks its state on two levels: the committed side mirrors
//! what is actually on disk, while the uncommitted side holds whatever the
//! build has logically produced but not yet written back.  Commands interact
//! with artifacts only through the operations here; every observation is a
//! potential dependency and every write a potential output.

use std::collections::BTreeMap;
use std::path::Path;

use crate::densemap::declare_id;
use crate::ir::CommandId;
use crate::version::{
    ContentVersion, ContentVersionId, DirListVersion, FileVersion, MetadataVersionId,
    PipeReadVersion, PipeWriteVersion, VersionStore,
};

declare_id!(ArtifactId);

/// A committed/uncommitted pair of versions.  `current` prefers the
/// uncommitted side: the build's logical view runs ahead of the disk.
#[derive(Debug, Clone)]
pub struct Slot<T: Copy> {
    pub committed: Option<T>,
    pub uncommitted: Option<T>,
}

impl<T: Copy> Default for Slot<T> {
    fn default() -> Self {
        Slot { committed: None, uncommitted: None }
    }
}

impl<T: Copy> Slot<T> {
    pub fn committed(v: T) -> Slot<T> {
        Slot { committed: Some(v), uncommitted: None }
    }

    pub fn uncommitted(v: T) -> Slot<T> {
        Slot { committed: None, uncommitted: Some(v) }
    }

    pub fn current(&self) -> Option<T> {
        self.uncommitted.or(self.committed)
    }

    /// A new uncommitted version supersedes any pending one.
    pub fn update(&mut self, v: T) {
        self.uncommitted = Some(v);
    }

    pub fn mark_committed(&mut self) {
        if let Some(v) = self.uncommitted.take() {
            self.committed = Some(v);
        }
    }
}

/// A logical directory entry layered over the filesystem baseline.
/// `target: None` means the entry was removed.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub target: Option<ArtifactId>,
    /// Whether the link/unlink has been realized on disk.
    pub committed: bool,
}

/// What a directory knows about a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLookup {
    Present(ArtifactId),
    Removed,
    /// Not in the logical map; an opaque baseline may still have it.
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct FileState {
    pub content: Slot<ContentVersionId>,
}

#[derive(Debug, Clone)]
pub struct SymlinkState {
    pub content: Slot<ContentVersionId>,
    /// Target string, duplicated out of the version for cheap resolution.
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct DirState {
    pub entries: BTreeMap<String, DirEntry>,
    /// Trust the real filesystem for names outside the logical map.
    pub opaque: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PipeState {
    /// Number of write events so far; doubles as the next sequence number.
    pub writes: u32,
    pub last_writer: Option<CommandId>,
}

#[derive(Debug, Clone)]
pub enum ArtifactKind {
    File(FileState),
    Symlink(SymlinkState),
    Dir(DirState),
    Pipe(PipeState),
    /// stdin/stdout/stderr and other objects with no observable content.
    Special,
}

/// The outcome of a match predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match<T: Copy> {
    Matched,
    Mismatch { observed: Option<T> },
}

#[derive(Debug, Clone)]
pub struct Artifact {
    /// The primary absolute path this artifact is known by, if any.
    pub path: Option<String>,
    pub kind: ArtifactKind,
    pub metadata: Slot<MetadataVersionId>,
    pub metadata_writer: Option<CommandId>,
    pub content_writer: Option<CommandId>,
}

impl Artifact {
    pub fn file(path: Option<String>, meta: MetadataVersionId, content: ContentVersionId) -> Artifact {
        Artifact {
            path,
            kind: ArtifactKind::File(FileState { content: Slot::committed(content) }),
            metadata: Slot::committed(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    /// An anonymous file created by the build, not yet on disk anywhere.
    pub fn anonymous_file(meta: MetadataVersionId, content: ContentVersionId) -> Artifact {
        Artifact {
            path: None,
            kind: ArtifactKind::File(FileState { content: Slot::uncommitted(content) }),
            metadata: Slot::uncommitted(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    pub fn symlink(
        path: Option<String>,
        meta: MetadataVersionId,
        content: ContentVersionId,
        target: String,
        committed: bool,
    ) -> Artifact {
        let content = if committed { Slot::committed(content) } else { Slot::uncommitted(content) };
        Artifact {
            path,
            kind: ArtifactKind::Symlink(SymlinkState { content, target }),
            metadata: Slot::committed(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    /// A directory backed by the real filesystem: names we have not tracked
    /// fall through to disk.
    pub fn dir_on_disk(path: String, meta: MetadataVersionId) -> Artifact {
        Artifact {
            path: Some(path),
            kind: ArtifactKind::Dir(DirState { entries: BTreeMap::new(), opaque: true }),
            metadata: Slot::committed(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    /// A directory created by the build; its listing is entirely logical.
    pub fn anonymous_dir(meta: MetadataVersionId) -> Artifact {
        Artifact {
            path: None,
            kind: ArtifactKind::Dir(DirState { entries: BTreeMap::new(), opaque: false }),
            metadata: Slot::uncommitted(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    pub fn pipe(meta: MetadataVersionId) -> Artifact {
        Artifact {
            path: None,
            kind: ArtifactKind::Pipe(PipeState::default()),
            metadata: Slot::committed(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    pub fn special(name: &str, meta: MetadataVersionId) -> Artifact {
        Artifact {
            path: Some(name.to_string()),
            kind: ArtifactKind::Special,
            metadata: Slot::committed(meta),
            metadata_writer: None,
            content_writer: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.path.as_deref().unwrap_or("<anonymous>")
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ArtifactKind::Dir(_))
    }

    /// The current content version, manufacturing one for kinds whose
    /// content is computed (directory listings, pipe read events).
    pub fn current_content(&self, versions: &mut VersionStore) -> Option<ContentVersionId> {
        match &self.kind {
            ArtifactKind::File(f) => f.content.current(),
            ArtifactKind::Symlink(s) => s.content.current(),
            ArtifactKind::Dir(_) => {
                let listing = self.listing();
                Some(versions.push_content(ContentVersion::Dir(listing)))
            }
            ArtifactKind::Pipe(p) => Some(versions.push_content(ContentVersion::PipeRead(
                PipeReadVersion { writer: p.last_writer, seq: p.writes },
            ))),
            ArtifactKind::Special => None,
        }
    }

    /// The logical listing of a directory.  For opaque directories the
    /// baseline names are read from disk and the logical map is layered on
    /// top.
    pub fn listing(&self) -> DirListVersion {
        let dir = match &self.kind {
            ArtifactKind::Dir(d) => d,
            _ => panic!("listing of non-directory artifact"),
        };
        let mut entries: BTreeMap<String, Option<ArtifactId>> = BTreeMap::new();
        if dir.opaque {
            if let Some(path) = &self.path {
                if let Ok(rd) = std::fs::read_dir(path) {
                    for ent in rd.flatten() {
                        if let Ok(name) = ent.file_name().into_string() {
                            entries.insert(name, None);
                        }
                    }
                }
            }
        }
        for (name, ent) in &dir.entries {
            match ent.target {
                Some(t) => {
                    entries.insert(name.clone(), Some(t));
                }
                None => {
                    entries.remove(name);
                }
            }
        }
        DirListVersion { entries, opaque: dir.opaque }
    }

    /// Check the artifact's content against an expected version.
    pub fn match_content(
        &self,
        versions: &mut VersionStore,
        expected: ContentVersionId,
    ) -> Match<ContentVersionId> {
        let observed = match &self.kind {
            ArtifactKind::Special => return Match::Matched,
            _ => self.current_content(versions),
        };
        match observed {
            Some(observed) if versions.content_matches(observed, expected) => Match::Matched,
            observed => Match::Mismatch { observed },
        }
    }

    pub fn match_metadata(
        &self,
        versions: &VersionStore,
        expected: MetadataVersionId,
    ) -> Match<MetadataVersionId> {
        match self.metadata.current() {
            Some(observed) if versions.metadata_matches(observed, expected) => Match::Matched,
            observed => Match::Mismatch { observed },
        }
    }

    /// Apply a new content version written by `writer`.
    pub fn update_content(
        &mut self,
        writer: CommandId,
        v: ContentVersionId,
        versions: &VersionStore,
    ) {
        self.content_writer = Some(writer);
        match &mut self.kind {
            ArtifactKind::File(f) => f.content.update(v),
            ArtifactKind::Symlink(s) => {
                if let ContentVersion::Symlink(sv) = versions.content(v) {
                    s.target = sv.target.clone();
                }
                s.content.update(v);
            }
            ArtifactKind::Dir(_) => {
                // Directory content changes arrive as AddEntry/RemoveEntry.
            }
            ArtifactKind::Pipe(p) => {
                if let ContentVersion::PipeWrite(w) = versions.content(v) {
                    p.writes = w.seq + 1;
                    p.last_writer = w.writer.or(Some(writer));
                }
            }
            ArtifactKind::Special => {}
        }
    }

    pub fn update_metadata(&mut self, writer: CommandId, v: MetadataVersionId) {
        self.metadata_writer = Some(writer);
        self.metadata.update(v);
    }

    /// Record the next write event on a pipe, returning its version.
    pub fn pipe_write(
        &mut self,
        writer: CommandId,
        versions: &mut VersionStore,
    ) -> ContentVersionId {
        let pipe = match &mut self.kind {
            ArtifactKind::Pipe(p) => p,
            _ => panic!("pipe_write on non-pipe artifact"),
        };
        let v = versions.push_content(ContentVersion::PipeWrite(PipeWriteVersion {
            writer: Some(writer),
            seq: pipe.writes,
        }));
        pipe.writes += 1;
        pipe.last_writer = Some(writer);
        self.content_writer = Some(writer);
        v
    }

    /// What this directory knows about `name`.
    pub fn dir_entry(&self, name: &str) -> EntryLookup {
        let dir = match &self.kind {
            ArtifactKind::Dir(d) => d,
            _ => return EntryLookup::Unknown,
        };
        match dir.entries.get(name) {
            Some(DirEntry { target: Some(t), .. }) => EntryLookup::Present(*t),
            Some(DirEntry { target: None, .. }) => EntryLookup::Removed,
            None if dir.opaque => EntryLookup::Unknown,
            None => EntryLookup::Removed,
        }
    }

    pub fn is_opaque_dir(&self) -> bool {
        matches!(&self.kind, ArtifactKind::Dir(d) if d.opaque)
    }

    /// Link `target` into this directory under `name`.
    pub fn add_entry(&mut self, writer: CommandId, name: &str, target: ArtifactId, committed: bool) {
        let dir = match &mut self.kind {
            ArtifactKind::Dir(d) => d,
            _ => panic!("add_entry on non-directory artifact"),
        };
        dir.entries.insert(name.to_string(), DirEntry { target: Some(target), committed });
        self.content_writer = Some(writer);
    }

    /// Remove `name` from this directory.
    pub fn remove_entry(&mut self, writer: CommandId, name: &str, committed: bool) {
        let dir = match &mut self.kind {
            ArtifactKind::Dir(d) => d,
            _ => panic!("remove_entry on non-directory artifact"),
        };
        dir.entries.insert(name.to_string(), DirEntry { target: None, committed });
        self.content_writer = Some(writer);
    }

    /// A traced command realized its write on disk itself; the logical
    /// version is the committed one.
    pub fn mark_content_committed(&mut self) {
        match &mut self.kind {
            ArtifactKind::File(f) => f.content.mark_committed(),
            ArtifactKind::Symlink(s) => s.content.mark_committed(),
            ArtifactKind::Dir(d) => {
                for ent in d.entries.values_mut() {
                    ent.committed = true;
                }
            }
            ArtifactKind::Pipe(_) | ArtifactKind::Special => {}
        }
        self.metadata.mark_committed();
    }

    /// The disk has been verified to hold `v`; make it the committed
    /// current version, dropping any pending state it supersedes.
    pub fn adopt_committed_content(&mut self, v: ContentVersionId) {
        match &mut self.kind {
            ArtifactKind::File(f) => f.content = Slot::committed(v),
            ArtifactKind::Symlink(s) => s.content = Slot::committed(v),
            _ => {}
        }
    }

    pub fn has_uncommitted_content(&self) -> bool {
        match &self.kind {
            ArtifactKind::File(f) => f.content.uncommitted.is_some(),
            ArtifactKind::Symlink(s) => s.content.uncommitted.is_some(),
            ArtifactKind::Dir(d) => d.entries.values().any(|e| !e.committed),
            ArtifactKind::Pipe(_) | ArtifactKind::Special => false,
        }
    }

    /// Force any uncommitted content onto the disk at `path`.
    pub fn commit_content_to(&mut self, versions: &VersionStore, path: &Path) -> std::io::Result<()> {
        match &mut self.kind {
            ArtifactKind::File(f) => {
                if let Some(v) = f.content.uncommitted {
                    versions.commit_content(v, path)?;
                    f.content.mark_committed();
                }
            }
            ArtifactKind::Symlink(s) => {
                if let Some(v) = s.content.uncommitted {
                    versions.commit_content(v, path)?;
                    s.content.mark_committed();
                }
            }
            ArtifactKind::Dir(d) => {
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                for ent in d.entries.values_mut() {
                    // Entry targets are committed through the target
                    // artifacts themselves; here we only note the links.
                    ent.committed = true;
                }
            }
            ArtifactKind::Pipe(_) | ArtifactKind::Special => {}
        }
        if let Some(v) = self.metadata.uncommitted {
            versions.commit_metadata(v, path)?;
            self.metadata.mark_committed();
        }
        Ok(())
    }

    /// Compare the artifact's final produced content against the disk.
    /// Returns the (produced, on-disk) pair when they differ.
    pub fn check_final_state(
        &self,
        versions: &mut VersionStore,
        path: &Path,
        hash: bool,
    ) -> Option<(ContentVersionId, Option<ContentVersionId>)> {
        let produced = match &self.kind {
            ArtifactKind::File(f) => f.content.current()?,
            ArtifactKind::Symlink(s) => s.content.current()?,
            // Directory and pipe final state is carried by their children
            // and consumers respectively.
            _ => return None,
        };
        let ondisk = match &self.kind {
            ArtifactKind::File(_) => match FileVersion::of_path(path, hash) {
                Ok(v) => Some(versions.push_content(ContentVersion::File(v))),
                Err(_) => None,
            },
            ArtifactKind::Symlink(_) => std::fs::read_link(path).ok().map(|t| {
                versions.push_content(ContentVersion::Symlink(crate::version::SymlinkVersion {
                    target: t.to_string_lossy().into_owned(),
                }))
            }),
            _ => None,
        };
        match ondisk {
            Some(ondisk) if versions.content_matches(produced, ondisk) => None,
            ondisk => Some((produced, ondisk)),
        }
    }

    /// Commit pending state and fingerprint the final version for the next
    /// run.  Returns the fingerprinted version now current.
    pub fn apply_final_state(
        &mut self,
        versions: &mut VersionStore,
        path: &Path,
        hash: bool,
    ) -> std::io::Result<Option<ContentVersionId>> {
        if matches!(self.kind, ArtifactKind::Pipe(_) | ArtifactKind::Special) {
            return Ok(None);
        }
        if !matches!(self.kind, ArtifactKind::File(_)) {
            // Symlinks and directories commit but carry no fingerprint.
            self.commit_content_to(versions, path)?;
            return Ok(None);
        }

        // If the disk already carries the produced content (the producer
        // was emulated and nothing touched the file), adopt it in place
        // rather than rewriting.
        let produced = match &self.kind {
            ArtifactKind::File(f) => f.content.current(),
            _ => unreachable!(),
        };
        if let Some(produced) = produced {
            let ondisk = FileVersion::of_path(path, hash).ok();
            let already = match (&ondisk, versions.content(produced)) {
                (Some(d), ContentVersion::File(p)) => p.matches(d),
                _ => false,
            };
            if !already {
                self.commit_content_to(versions, path)?;
            }
        }

        let fresh = FileVersion::of_path(path, hash)?;
        let id = versions.push_content(ContentVersion::File(fresh));
        if let ArtifactKind::File(f) = &mut self.kind {
            f.content = Slot::committed(id);
        }
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::MetadataVersion;

    fn store() -> VersionStore {
        VersionStore::new()
    }

    fn meta(versions: &mut VersionStore) -> MetadataVersionId {
        versions.push_metadata(MetadataVersion { uid: 1000, gid: 1000, mode: 0o644 })
    }

    #[test]
    fn file_update_supersedes_uncommitted() {
        let mut versions = store();
        let m = meta(&mut versions);
        let v0 = versions.push_content(ContentVersion::File(FileVersion::new_empty()));
        let v1 = versions.push_content(ContentVersion::File(FileVersion::new_empty()));
        let mut a = Artifact::anonymous_file(m, v0);
        a.update_content(CommandId(1), v1, &versions);
        match &a.kind {
            ArtifactKind::File(f) => assert_eq!(f.content.current(), Some(v1)),
            _ => unreachable!(),
        }
        assert_eq!(a.content_writer, Some(CommandId(1)));
        assert!(a.has_uncommitted_content());
    }

    #[test]
    fn match_content_same_version() {
        let mut versions = store();
        let m = meta(&mut versions);
        let v = versions.push_content(ContentVersion::File(FileVersion::new_empty()));
        let a = Artifact::file(Some("/in".into()), m, v);
        assert_eq!(a.match_content(&mut versions, v), Match::Matched);
    }

    #[test]
    fn pipe_write_then_read_matches_across_replay() {
        let mut versions = store();
        let m = meta(&mut versions);
        let mut pipe = Artifact::pipe(m);

        // First run: A writes, B reads.
        let w = pipe.pipe_write(CommandId(1), &mut versions);
        let r = pipe.current_content(&mut versions).unwrap();

        // Replay: applying the same recorded write leaves the read
        // observation identical.
        let mut replay = Artifact::pipe(m);
        replay.update_content(CommandId(1), w, &versions);
        assert_eq!(replay.match_content(&mut versions, r), Match::Matched);
    }

    #[test]
    fn pipe_read_differs_for_other_writer() {
        let mut versions = store();
        let m = meta(&mut versions);
        let mut pipe = Artifact::pipe(m);
        pipe.pipe_write(CommandId(1), &mut versions);
        let r = pipe.current_content(&mut versions).unwrap();

        let mut other = Artifact::pipe(m);
        other.pipe_write(CommandId(2), &mut versions);
        assert!(matches!(
            other.match_content(&mut versions, r),
            Match::Mismatch { .. }
        ));
    }

    #[test]
    fn dir_logical_entries_shadow_baseline() {
        let mut versions = store();
        let m = meta(&mut versions);
        let mut dir = Artifact::anonymous_dir(m);
        dir.add_entry(CommandId(1), "a.txt", ArtifactId(7), false);
        assert_eq!(dir.dir_entry("a.txt"), EntryLookup::Present(ArtifactId(7)));
        assert_eq!(dir.dir_entry("missing"), EntryLookup::Removed);

        dir.remove_entry(CommandId(1), "a.txt", false);
        assert_eq!(dir.dir_entry("a.txt"), EntryLookup::Removed);
    }

    #[test]
    fn dir_listing_change_is_a_mismatch() {
        let mut versions = store();
        let m = meta(&mut versions);
        let mut dir = Artifact::anonymous_dir(m);
        dir.add_entry(CommandId(1), "a.txt", ArtifactId(7), false);

        let recorded = dir.current_content(&mut versions).unwrap();
        assert_eq!(dir.match_content(&mut versions, recorded), Match::Matched);

        // A sibling appears between builds.
        dir.add_entry(CommandId(1), "b.txt", ArtifactId(8), false);
        assert!(matches!(
            dir.match_content(&mut versions, recorded),
            Match::Mismatch { .. }
        ));
    }

    #[test]
    fn opaque_dir_falls_through_to_unknown() {
        let mut versions = store();
        let m = meta(&mut versions);
        let dir = Artifact::dir_on_disk("/src".into(), m);
        assert_eq!(dir.dir_entry("anything"), EntryLookup::Unknown);
    }

    #[test]
    fn commit_and_final_state() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let out = tmp.path().join("out");
        let mut versions = store();
        let m = meta(&mut versions);

        let v = versions.push_content(ContentVersion::File(FileVersion::new_empty()));
        let mut a = Artifact::anonymous_file(m, v);
        a.path = Some(out.to_string_lossy().into_owned());
        a.update_content(CommandId(1), v, &versions);

        let finalv = a.apply_final_state(&mut versions, &out, false)?;
        assert!(finalv.is_some());
        assert!(out.exists());
        assert!(!a.has_uncommitted_content());

        // Untouched disk passes the final check.
        assert!(a.check_final_state(&mut versions, &out, false).is_none());

        // Deleting the output is a final mismatch.
        std::fs::remove_file(&out)?;
        assert!(a.check_final_state(&mut versions, &out, false).is_some());
        Ok(())
    }
}
