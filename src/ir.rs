//! The intermediate representation of a build: commands, per-command
//! references, and the closed set of trace steps a command can emit.
//!
//! A command corresponds to an exec() boundary during the build; these are
//! the units we can re-execute independently on a future build.  Everything
//! a command did to the filesystem is recorded as an ordered list of steps
//! that can later be replayed without running the command.

use crate::densemap::{declare_id, DenseMap};
use crate::smallmap::SmallMap;
use crate::version::{ContentVersionId, MetadataVersionId};

declare_id!(CommandId);

declare_id!(
    /// A handle to a resolved or not-yet-resolved filesystem object,
    /// unique within its defining command.
    RefId
);

/// Every command's reference table starts with the same six entries,
/// bound by its parent at launch.
pub const STDIN_REF: RefId = RefId(0);
pub const STDOUT_REF: RefId = RefId(1);
pub const STDERR_REF: RefId = RefId(2);
pub const ROOT_REF: RefId = RefId(3);
pub const CWD_REF: RefId = RefId(4);
pub const EXE_REF: RefId = RefId(5);
pub const RESERVED_REFS: usize = 6;

/// The read/write disposition of an inherited file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdFlags {
    pub read: bool,
    pub write: bool,
}

impl FdFlags {
    pub const READ: FdFlags = FdFlags { read: true, write: false };
    pub const WRITE: FdFlags = FdFlags { read: false, write: true };

    pub fn to_byte(self) -> u8 {
        (self.read as u8) | ((self.write as u8) << 1)
    }

    pub fn from_byte(b: u8) -> FdFlags {
        FdFlags {
            read: b & 1 != 0,
            write: b & 2 != 0,
        }
    }
}

/// Access flags on a path reference, the subset of open(2) semantics the
/// resolver honors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFlags {
    pub r: bool,
    pub w: bool,
    pub x: bool,
    pub nofollow: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    /// Mode for created files, before the umask is applied.
    pub mode: u32,
}

impl AccessFlags {
    pub fn read() -> AccessFlags {
        AccessFlags { r: true, ..Default::default() }
    }

    pub fn write() -> AccessFlags {
        AccessFlags { w: true, ..Default::default() }
    }

    pub fn exec() -> AccessFlags {
        AccessFlags { r: true, x: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        (self.r as u8)
            | ((self.w as u8) << 1)
            | ((self.x as u8) << 2)
            | ((self.nofollow as u8) << 3)
            | ((self.create as u8) << 4)
            | ((self.exclusive as u8) << 5)
            | ((self.truncate as u8) << 6)
    }

    pub fn from_byte(b: u8, mode: u32) -> AccessFlags {
        AccessFlags {
            r: b & 1 != 0,
            w: b & 2 != 0,
            x: b & 4 != 0,
            nofollow: b & 8 != 0,
            create: b & 16 != 0,
            exclusive: b & 32 != 0,
            truncate: b & 64 != 0,
            mode,
        }
    }
}

/// The special references every command starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Stdin,
    Stdout,
    Stderr,
    Root,
    Cwd,
    Tmp,
}

impl SpecialKind {
    pub fn to_byte(self) -> u8 {
        match self {
            SpecialKind::Stdin => 0,
            SpecialKind::Stdout => 1,
            SpecialKind::Stderr => 2,
            SpecialKind::Root => 3,
            SpecialKind::Cwd => 4,
            SpecialKind::Tmp => 5,
        }
    }

    pub fn from_byte(b: u8) -> Option<SpecialKind> {
        Some(match b {
            0 => SpecialKind::Stdin,
            1 => SpecialKind::Stdout,
            2 => SpecialKind::Stderr,
            3 => SpecialKind::Root,
            4 => SpecialKind::Cwd,
            5 => SpecialKind::Tmp,
            _ => return None,
        })
    }
}

/// Distinguishes predicates recorded while a command ran from predicates
/// recorded against the state the build left behind.  Keeping them apart
/// stops "input on the last run" from being conflated with "state observed
/// after the last run finished".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Build,
    PostBuild,
}

/// The sense of a CompareRefs predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefComparison {
    SameInstance,
    DifferentInstances,
}

/// One atomic event in a command's recorded behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The command references one of the well-known special artifacts.
    SpecialRef { kind: SpecialKind, out: RefId },
    /// The command creates an anonymous pipe.
    PipeRef { read_end: RefId, write_end: RefId },
    /// The command creates an anonymous file (e.g. an unlinked temp file).
    FileRef { mode: u32, out: RefId },
    /// The command creates an anonymous symlink.
    SymlinkRef { target: String, out: RefId },
    /// The command creates an anonymous directory.
    DirRef { mode: u32, out: RefId },
    /// The command resolves a path relative to a base reference.
    PathRef { base: RefId, path: String, flags: AccessFlags, out: RefId },
    /// Opens a liveness bracket for a reference.
    UsingRef { r: RefId },
    /// Closes the liveness bracket for a reference.
    DoneWithRef { r: RefId },
    /// Predicate: two references resolve to the same/different artifacts.
    CompareRefs { a: RefId, b: RefId, kind: RefComparison },
    /// Predicate: the reference resolved with exactly this errno (0 = ok).
    ExpectResult { scenario: Scenario, r: RefId, errno: i32 },
    /// Predicate: the referenced artifact's metadata matched a version.
    MatchMetadata { scenario: Scenario, r: RefId, version: MetadataVersionId },
    /// Predicate: the referenced artifact's content matched a version.
    MatchContent { scenario: Scenario, r: RefId, version: ContentVersionId },
    /// The command set the referenced artifact's metadata.
    UpdateMetadata { r: RefId, version: MetadataVersionId },
    /// The command wrote a new content version to the referenced artifact.
    UpdateContent { r: RefId, version: ContentVersionId },
    /// The command linked `target` into a directory under `name`.
    AddEntry { dir: RefId, name: String, target: RefId },
    /// The command unlinked `name` (resolving to `target`) from a directory.
    RemoveEntry { dir: RefId, name: String, target: RefId },
    /// The command launched a child; `refs` binds (parent ref, child ref)
    /// pairs into the child's reference namespace.
    Launch { child: CommandId, refs: Vec<(RefId, RefId)> },
    /// The command waited for a child, observing its exit status.
    Join { child: CommandId, exit: i32 },
    /// The command terminated.
    Exit { exit: i32 },
}

impl Step {
    /// A short tag for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Step::SpecialRef { .. } => "SpecialRef",
            Step::PipeRef { .. } => "PipeRef",
            Step::FileRef { .. } => "FileRef",
            Step::SymlinkRef { .. } => "SymlinkRef",
            Step::DirRef { .. } => "DirRef",
            Step::PathRef { .. } => "PathRef",
            Step::UsingRef { .. } => "UsingRef",
            Step::DoneWithRef { .. } => "DoneWithRef",
            Step::CompareRefs { .. } => "CompareRefs",
            Step::ExpectResult { .. } => "ExpectResult",
            Step::MatchMetadata { .. } => "MatchMetadata",
            Step::MatchContent { .. } => "MatchContent",
            Step::UpdateMetadata { .. } => "UpdateMetadata",
            Step::UpdateContent { .. } => "UpdateContent",
            Step::AddEntry { .. } => "AddEntry",
            Step::RemoveEntry { .. } => "RemoveEntry",
            Step::Launch { .. } => "Launch",
            Step::Join { .. } => "Join",
            Step::Exit { .. } => "Exit",
        }
    }
}

/// A unit of (re)execution discovered during the build.
#[derive(Debug, Clone)]
pub struct Command {
    /// Reference to the executable, in this command's own namespace.
    pub exe: RefId,
    pub args: Vec<String>,
    /// File descriptors set up at the start of this command's run.
    pub initial_fds: SmallMap<i32, (FdFlags, RefId)>,
    pub cwd: RefId,
    pub root: RefId,
    /// The steps this command emitted in the most recent trace.
    pub steps: Vec<Step>,
    /// Children in order of creation.
    pub children: Vec<CommandId>,
    /// Has this command ever actually run?
    pub executed: bool,
    /// The exit status recorded for this command's last execution.
    pub exit_status: Option<i32>,
}

impl Command {
    pub fn new(args: Vec<String>) -> Command {
        let initial_fds = [
            (0, (FdFlags::READ, STDIN_REF)),
            (1, (FdFlags::WRITE, STDOUT_REF)),
            (2, (FdFlags::WRITE, STDERR_REF)),
        ]
        .into_iter()
        .collect();
        Command {
            exe: EXE_REF,
            args,
            initial_fds,
            cwd: CWD_REF,
            root: ROOT_REF,
            steps: Vec::new(),
            children: Vec::new(),
            executed: false,
            exit_status: None,
        }
    }

    /// The content identity used to match commands across runs: a command
    /// in a new run that looks like this one IS this one.
    pub fn same_identity(&self, args: &[String], fds: &SmallMap<i32, (FdFlags, RefId)>) -> bool {
        self.args == args && self.initial_fds == *fds
    }

    /// A short printable name, truncated for progress output.
    pub fn short_name(&self, limit: usize) -> String {
        let full = self.full_name();
        if full.len() <= limit {
            return full;
        }
        let mut end = limit.saturating_sub(3);
        while end > 0 && !full.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &full[..end])
    }

    pub fn full_name(&self) -> String {
        self.args.join(" ")
    }

    /// Clear per-run state ahead of re-execution.
    pub fn reset(&mut self) {
        self.children.clear();
        self.steps.clear();
    }
}

/// The command arena.  Command 0 is always the launcher: a synthetic
/// command that sets up the root build script's references and launches it.
#[derive(Debug, Clone, Default)]
pub struct Commands {
    map: DenseMap<CommandId, Command>,
}

pub const LAUNCHER: CommandId = CommandId(0);

impl Commands {
    pub fn new() -> Commands {
        Commands { map: DenseMap::new() }
    }

    pub fn push(&mut self, cmd: Command) -> CommandId {
        self.map.push(cmd)
    }

    pub fn get(&self, id: CommandId) -> &Command {
        self.map.get(id)
    }

    pub fn get_mut(&mut self, id: CommandId) -> &mut Command {
        self.map.get_mut(id)
    }

    pub fn lookup(&self, id: CommandId) -> Option<&Command> {
        self.map.lookup(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CommandId> {
        self.map.ids()
    }

    /// Find a recorded child of `parent` matching the given content
    /// identity, so a re-executed parent reuses its children's history.
    pub fn find_matching_child(
        &self,
        parent: CommandId,
        args: &[String],
        fds: &SmallMap<i32, (FdFlags, RefId)>,
    ) -> Option<CommandId> {
        self.map
            .get(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.map.get(c).same_identity(args, fds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(args: &[&str]) -> Command {
        Command::new(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn identity_matches_same_args() {
        let a = sh(&["sh", "-c", "cc -o out main.c"]);
        let b = sh(&["sh", "-c", "cc -o out main.c"]);
        assert!(a.same_identity(&b.args, &b.initial_fds));
    }

    #[test]
    fn identity_differs_on_args() {
        let a = sh(&["sh", "-c", "cc -o out main.c"]);
        let b = sh(&["sh", "-c", "cc -o out other.c"]);
        assert!(!a.same_identity(&b.args, &b.initial_fds));
    }

    #[test]
    fn find_matching_child() {
        let mut cmds = Commands::new();
        let parent = cmds.push(sh(&["sh", "Buildfile"]));
        let child = cmds.push(sh(&["cc", "main.c"]));
        cmds.get_mut(parent).children.push(child);

        let probe = sh(&["cc", "main.c"]);
        assert_eq!(
            cmds.find_matching_child(parent, &probe.args, &probe.initial_fds),
            Some(child)
        );
        let other = sh(&["cc", "other.c"]);
        assert_eq!(
            cmds.find_matching_child(parent, &other.args, &other.initial_fds),
            None
        );
    }

    #[test]
    fn short_name_truncates() {
        let c = sh(&["averyveryverylongprogramname", "--with-args"]);
        let name = c.short_name(10);
        assert!(name.len() <= 10);
        assert!(name.ends_with("..."));
    }

    #[test]
    fn access_flags_round_trip() {
        let flags = AccessFlags {
            r: true,
            w: true,
            nofollow: true,
            create: true,
            mode: 0o644,
            ..Default::default()
        };
        assert_eq!(AccessFlags::from_byte(flags.to_byte(), 0o644), flags);
    }

    #[test]
    fn fd_flags_round_trip() {
        for flags in [FdFlags::READ, FdFlags::WRITE, FdFlags { read: true, write: true }] {
            assert_eq!(FdFlags::from_byte(flags.to_byte()), flags);
        }
    }
}
