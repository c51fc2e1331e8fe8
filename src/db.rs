//! The retrace database: the binary trace of the previous build, replayed
//! on the next run to decide what must re-execute.
//!
//! The format is a 16-byte header (magic, version) followed by tagged
//! records.  Commands, versions, strings, and paths are interned into
//! per-trace tables the first time they are referenced and named by 16-bit
//! IDs afterwards.  A trace that cannot be read (wrong magic, wrong
//! version, malformed record) is not an error: the caller falls back to the
//! default trace and runs the build from scratch.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::bail;

use crate::ir::{
    AccessFlags, Command, CommandId, Commands, FdFlags, RefComparison, RefId, Scenario,
    SpecialKind, Step, CWD_REF, EXE_REF, LAUNCHER, ROOT_REF, STDERR_REF, STDIN_REF, STDOUT_REF,
};
use crate::smallmap::SmallMap;
use crate::version::{
    ContentHash, ContentVersion, ContentVersionId, DirListVersion, FileVersion, Fingerprint,
    MetadataVersion, MetadataVersionId, PipeReadVersion, PipeWriteVersion, SymlinkVersion,
    VersionStore,
};

pub const TRACE_FILE: &str = ".retrace";
pub const TRACE_TEMP_FILE: &str = ".retrace.tmp";
pub const CACHE_DIR: &str = ".retrace-cache";

const MAGIC: u64 = u64::from_le_bytes(*b"retrace\0");
const FORMAT_VERSION: u64 = 1;

// Record tags.
const TAG_END: u8 = 0x00;
const TAG_STRING: u8 = 0x01;
const TAG_PATH: u8 = 0x02;
const TAG_COMMAND: u8 = 0x03;
const TAG_METADATA_VERSION: u8 = 0x04;
const TAG_CONTENT_VERSION: u8 = 0x05;
const TAG_START: u8 = 0x06;
const TAG_SPECIAL_REF: u8 = 0x10;
const TAG_PIPE_REF: u8 = 0x11;
const TAG_FILE_REF: u8 = 0x12;
const TAG_SYMLINK_REF: u8 = 0x13;
const TAG_DIR_REF: u8 = 0x14;
const TAG_PATH_REF: u8 = 0x15;
const TAG_USING_REF: u8 = 0x16;
const TAG_DONE_WITH_REF: u8 = 0x17;
const TAG_COMPARE_REFS: u8 = 0x18;
const TAG_EXPECT_RESULT: u8 = 0x19;
const TAG_MATCH_METADATA: u8 = 0x1a;
const TAG_MATCH_CONTENT: u8 = 0x1b;
const TAG_UPDATE_METADATA: u8 = 0x1c;
const TAG_UPDATE_CONTENT: u8 = 0x1d;
const TAG_ADD_ENTRY: u8 = 0x1e;
const TAG_REMOVE_ENTRY: u8 = 0x1f;
const TAG_LAUNCH: u8 = 0x20;
const TAG_JOIN: u8 = 0x21;
const TAG_EXIT: u8 = 0x22;

const NO_COMMAND: u16 = u16::MAX;
const NO_EXIT: i32 = i32::MIN;

/// Why a trace could not be used.
#[derive(Debug)]
pub enum TraceError {
    /// Wrong magic, wrong version, or malformed contents.  Recoverable by
    /// falling back to the default trace.
    Incompatible(String),
    Io(std::io::Error),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceError::Incompatible(msg) => write!(f, "incompatible trace: {}", msg),
            TraceError::Io(err) => write!(f, "trace io: {}", err),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> TraceError {
        // A short read means a truncated trace, which we treat like any
        // other malformed trace.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TraceError::Incompatible("unexpected end of file".to_string())
        } else {
            TraceError::Io(err)
        }
    }
}

/// A fully-loaded trace: the commands, the versions they reference, and
/// the interleaved step stream to replay.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub commands: Commands,
    pub versions: VersionStore,
    pub steps: Vec<(CommandId, Step)>,
}

impl Trace {
    /// The trace used when there is no usable saved trace: a synthetic
    /// launcher that sets up the root build script and runs it.
    pub fn default_trace(build_script: &str) -> Trace {
        let mut commands = Commands::new();

        let mut launcher = Command::new(vec!["retrace".to_string()]);
        launcher.executed = true;
        launcher.exit_status = Some(0);
        let launcher_id = commands.push(launcher);
        assert_eq!(launcher_id, LAUNCHER);

        let root = commands.push(Command::new(vec!["sh".to_string(), build_script.to_string()]));

        let steps = vec![
            (LAUNCHER, Step::SpecialRef { kind: SpecialKind::Stdin, out: STDIN_REF }),
            (LAUNCHER, Step::SpecialRef { kind: SpecialKind::Stdout, out: STDOUT_REF }),
            (LAUNCHER, Step::SpecialRef { kind: SpecialKind::Stderr, out: STDERR_REF }),
            (LAUNCHER, Step::SpecialRef { kind: SpecialKind::Root, out: ROOT_REF }),
            (LAUNCHER, Step::SpecialRef { kind: SpecialKind::Cwd, out: CWD_REF }),
            (
                LAUNCHER,
                // The script is run via sh, so it only needs to be
                // readable.
                Step::PathRef {
                    base: CWD_REF,
                    path: build_script.to_string(),
                    flags: AccessFlags::read(),
                    out: EXE_REF,
                },
            ),
            (LAUNCHER, Step::ExpectResult { scenario: Scenario::Build, r: EXE_REF, errno: 0 }),
            (
                LAUNCHER,
                Step::Launch {
                    child: root,
                    refs: vec![
                        (STDIN_REF, STDIN_REF),
                        (STDOUT_REF, STDOUT_REF),
                        (STDERR_REF, STDERR_REF),
                        (ROOT_REF, ROOT_REF),
                        (CWD_REF, CWD_REF),
                        (EXE_REF, EXE_REF),
                    ],
                },
            ),
            (LAUNCHER, Step::Join { child: root, exit: 0 }),
            (LAUNCHER, Step::Exit { exit: 0 }),
        ];

        for (cmd, step) in &steps {
            commands.get_mut(*cmd).steps.push(step.clone());
        }
        commands.get_mut(LAUNCHER).children.push(root);

        Trace { commands, versions: VersionStore::new(), steps }
    }
}

/// The shared state a sink needs to serialize steps: command payloads and
/// version payloads are emitted on first reference.
pub struct TraceCtx<'a> {
    pub commands: &'a Commands,
    pub versions: &'a mut VersionStore,
}

/// Something that accepts a stream of IR steps: the trace writer, the
/// in-memory buffer, or nothing at all.
pub trait IRSink {
    fn start(&mut self, ctx: &mut TraceCtx, root: CommandId) -> anyhow::Result<()>;
    fn step(&mut self, ctx: &mut TraceCtx, cmd: CommandId, step: &Step) -> anyhow::Result<()>;
    fn finish(&mut self, ctx: &mut TraceCtx) -> anyhow::Result<()>;
}

/// A sink that drops everything, used by the planning pass.
pub struct NullSink;

impl IRSink for NullSink {
    fn start(&mut self, _ctx: &mut TraceCtx, _root: CommandId) -> anyhow::Result<()> {
        Ok(())
    }
    fn step(&mut self, _ctx: &mut TraceCtx, _cmd: CommandId, _step: &Step) -> anyhow::Result<()> {
        Ok(())
    }
    fn finish(&mut self, _ctx: &mut TraceCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes a trace to disk.  Records land in a temp file that is renamed
/// over the real trace only on a clean finish, so an aborted build never
/// corrupts the previous trace.
pub struct TraceWriter {
    w: BufWriter<std::fs::File>,
    final_path: PathBuf,
    temp_path: PathBuf,
    commands: HashMap<CommandId, u16>,
    metadata_versions: HashMap<MetadataVersionId, u16>,
    content_versions: HashMap<ContentVersionId, u16>,
    strings: HashMap<String, u16>,
    paths: HashMap<String, u16>,
}

impl TraceWriter {
    pub fn create(dir: &Path) -> anyhow::Result<TraceWriter> {
        let final_path = dir.join(TRACE_FILE);
        let temp_path = dir.join(TRACE_TEMP_FILE);
        let mut w = BufWriter::new(std::fs::File::create(&temp_path)?);
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;
        Ok(TraceWriter {
            w,
            final_path,
            temp_path,
            commands: HashMap::new(),
            metadata_versions: HashMap::new(),
            content_versions: HashMap::new(),
            strings: HashMap::new(),
            paths: HashMap::new(),
        })
    }

    fn u8(&mut self, v: u8) -> std::io::Result<()> {
        self.w.write_all(&[v])
    }
    fn u16(&mut self, v: u16) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn u32(&mut self, v: u32) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn u64(&mut self, v: u64) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn i32(&mut self, v: i32) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn i64(&mut self, v: i64) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }

    fn rid(&mut self, r: RefId) -> anyhow::Result<()> {
        if r.0 > u16::MAX as usize {
            bail!("reference id {} too large for trace", r.0);
        }
        Ok(self.u16(r.0 as u16)?)
    }

    fn string_id(&mut self, s: &str) -> anyhow::Result<u16> {
        if let Some(&id) = self.strings.get(s) {
            return Ok(id);
        }
        let id = intern_id("strings", self.strings.len())?;
        self.u8(TAG_STRING)?;
        self.u16(s.len().try_into()?)?;
        self.w.write_all(s.as_bytes())?;
        self.strings.insert(s.to_string(), id);
        Ok(id)
    }

    fn path_id(&mut self, p: &str) -> anyhow::Result<u16> {
        if let Some(&id) = self.paths.get(p) {
            return Ok(id);
        }
        let id = intern_id("paths", self.paths.len())?;
        self.u8(TAG_PATH)?;
        self.u16(p.len().try_into()?)?;
        self.w.write_all(p.as_bytes())?;
        self.paths.insert(p.to_string(), id);
        Ok(id)
    }

    /// The table ID of a command, emitting its payload record on first use.
    fn command_id(&mut self, ctx: &mut TraceCtx, cmd: CommandId) -> anyhow::Result<u16> {
        if let Some(&id) = self.commands.get(&cmd) {
            return Ok(id);
        }
        let id = intern_id("commands", self.commands.len())?;
        self.commands.insert(cmd, id);

        let c = ctx.commands.get(cmd);
        let arg_ids: Vec<u16> = c
            .args
            .iter()
            .map(|a| self.string_id(a))
            .collect::<anyhow::Result<_>>()?;
        let fds: Vec<(i32, FdFlags, RefId)> =
            c.initial_fds.iter().map(|&(fd, (flags, r))| (fd, flags, r)).collect();

        self.u8(TAG_COMMAND)?;
        self.rid(ctx.commands.get(cmd).exe)?;
        self.u16(arg_ids.len().try_into()?)?;
        for a in arg_ids {
            self.u16(a)?;
        }
        self.u8(fds.len().try_into()?)?;
        for (fd, flags, r) in fds {
            self.u8(fd.try_into()?)?;
            self.u8(flags.to_byte())?;
            self.rid(r)?;
        }
        let c = ctx.commands.get(cmd);
        self.rid(c.cwd)?;
        self.rid(c.root)?;
        self.u8(c.executed as u8)?;
        self.i32(c.exit_status.unwrap_or(NO_EXIT))?;
        Ok(id)
    }

    fn metadata_version_id(
        &mut self,
        ctx: &mut TraceCtx,
        v: MetadataVersionId,
    ) -> anyhow::Result<u16> {
        if let Some(&id) = self.metadata_versions.get(&v) {
            return Ok(id);
        }
        let id = intern_id("metadata versions", self.metadata_versions.len())?;
        self.metadata_versions.insert(v, id);
        ctx.versions.set_metadata_write_id(v, id);

        let mv = *ctx.versions.metadata(v);
        self.u8(TAG_METADATA_VERSION)?;
        self.u32(mv.uid)?;
        self.u32(mv.gid)?;
        self.u32(mv.mode)?;
        Ok(id)
    }

    fn content_version_id(
        &mut self,
        ctx: &mut TraceCtx,
        v: ContentVersionId,
    ) -> anyhow::Result<u16> {
        if let Some(&id) = self.content_versions.get(&v) {
            return Ok(id);
        }
        let id = intern_id("content versions", self.content_versions.len())?;
        self.content_versions.insert(v, id);
        ctx.versions.set_content_write_id(v, id);

        let cv = ctx.versions.content(v).clone();
        self.u8(TAG_CONTENT_VERSION)?;
        match cv {
            ContentVersion::File(f) => {
                self.u8(0)?;
                let bits = (f.empty as u8)
                    | ((f.fingerprint.is_some() as u8) << 1)
                    | ((f.hash.is_some() as u8) << 2);
                self.u8(bits)?;
                if let Some(fp) = f.fingerprint {
                    self.i64(fp.mtime)?;
                    self.i64(fp.mtime_nsec)?;
                    self.u64(fp.size)?;
                }
                if let Some(h) = f.hash {
                    self.w.write_all(&h.0)?;
                }
            }
            ContentVersion::Symlink(s) => {
                self.u8(1)?;
                let pid = self.path_id(&s.target)?;
                self.u16(pid)?;
            }
            ContentVersion::Dir(d) => {
                self.u8(2)?;
                self.u8(d.opaque as u8)?;
                let names: Vec<u16> = d
                    .names()
                    .map(|n| self.string_id(n))
                    .collect::<anyhow::Result<_>>()?;
                self.u16(names.len().try_into()?)?;
                for n in names {
                    self.u16(n)?;
                }
            }
            ContentVersion::PipeWrite(p) => {
                self.u8(3)?;
                let wid = match p.writer {
                    Some(c) => self.command_id(ctx, c)?,
                    None => NO_COMMAND,
                };
                self.u16(wid)?;
                self.u32(p.seq)?;
            }
            ContentVersion::PipeRead(p) => {
                self.u8(4)?;
                let wid = match p.writer {
                    Some(c) => self.command_id(ctx, c)?,
                    None => NO_COMMAND,
                };
                self.u16(wid)?;
                self.u32(p.seq)?;
            }
        }
        Ok(id)
    }
}

fn intern_id(what: &str, len: usize) -> anyhow::Result<u16> {
    if len >= u16::MAX as usize {
        bail!("too many {} for one trace", what);
    }
    Ok(len as u16)
}

impl IRSink for TraceWriter {
    fn start(&mut self, ctx: &mut TraceCtx, root: CommandId) -> anyhow::Result<()> {
        let id = self.command_id(ctx, root)?;
        self.u8(TAG_START)?;
        self.u16(id)?;
        Ok(())
    }

    fn step(&mut self, ctx: &mut TraceCtx, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
        let cmd_id = self.command_id(ctx, cmd)?;
        match step {
            Step::SpecialRef { kind, out } => {
                self.u8(TAG_SPECIAL_REF)?;
                self.u16(cmd_id)?;
                self.u8(kind.to_byte())?;
                self.rid(*out)?;
            }
            Step::PipeRef { read_end, write_end } => {
                self.u8(TAG_PIPE_REF)?;
                self.u16(cmd_id)?;
                self.rid(*read_end)?;
                self.rid(*write_end)?;
            }
            Step::FileRef { mode, out } => {
                self.u8(TAG_FILE_REF)?;
                self.u16(cmd_id)?;
                self.u32(*mode)?;
                self.rid(*out)?;
            }
            Step::SymlinkRef { target, out } => {
                let pid = self.path_id(target)?;
                self.u8(TAG_SYMLINK_REF)?;
                self.u16(cmd_id)?;
                self.u16(pid)?;
                self.rid(*out)?;
            }
            Step::DirRef { mode, out } => {
                self.u8(TAG_DIR_REF)?;
                self.u16(cmd_id)?;
                self.u32(*mode)?;
                self.rid(*out)?;
            }
            Step::PathRef { base, path, flags, out } => {
                let pid = self.path_id(path)?;
                self.u8(TAG_PATH_REF)?;
                self.u16(cmd_id)?;
                self.rid(*base)?;
                self.u16(pid)?;
                self.u8(flags.to_byte())?;
                self.u32(flags.mode)?;
                self.rid(*out)?;
            }
            Step::UsingRef { r } => {
                self.u8(TAG_USING_REF)?;
                self.u16(cmd_id)?;
                self.rid(*r)?;
            }
            Step::DoneWithRef { r } => {
                self.u8(TAG_DONE_WITH_REF)?;
                self.u16(cmd_id)?;
                self.rid(*r)?;
            }
            Step::CompareRefs { a, b, kind } => {
                self.u8(TAG_COMPARE_REFS)?;
                self.u16(cmd_id)?;
                self.rid(*a)?;
                self.rid(*b)?;
                self.u8(matches!(kind, RefComparison::SameInstance) as u8)?;
            }
            Step::ExpectResult { scenario, r, errno } => {
                self.u8(TAG_EXPECT_RESULT)?;
                self.u16(cmd_id)?;
                self.u8(matches!(scenario, Scenario::PostBuild) as u8)?;
                self.rid(*r)?;
                self.i32(*errno)?;
            }
            Step::MatchMetadata { scenario, r, version } => {
                let vid = self.metadata_version_id(ctx, *version)?;
                self.u8(TAG_MATCH_METADATA)?;
                self.u16(cmd_id)?;
                self.u8(matches!(scenario, Scenario::PostBuild) as u8)?;
                self.rid(*r)?;
                self.u16(vid)?;
            }
            Step::MatchContent { scenario, r, version } => {
                let vid = self.content_version_id(ctx, *version)?;
                self.u8(TAG_MATCH_CONTENT)?;
                self.u16(cmd_id)?;
                self.u8(matches!(scenario, Scenario::PostBuild) as u8)?;
                self.rid(*r)?;
                self.u16(vid)?;
            }
            Step::UpdateMetadata { r, version } => {
                let vid = self.metadata_version_id(ctx, *version)?;
                self.u8(TAG_UPDATE_METADATA)?;
                self.u16(cmd_id)?;
                self.rid(*r)?;
                self.u16(vid)?;
            }
            Step::UpdateContent { r, version } => {
                let vid = self.content_version_id(ctx, *version)?;
                self.u8(TAG_UPDATE_CONTENT)?;
                self.u16(cmd_id)?;
                self.rid(*r)?;
                self.u16(vid)?;
            }
            Step::AddEntry { dir, name, target } => {
                let nid = self.string_id(name)?;
                self.u8(TAG_ADD_ENTRY)?;
                self.u16(cmd_id)?;
                self.rid(*dir)?;
                self.u16(nid)?;
                self.rid(*target)?;
            }
            Step::RemoveEntry { dir, name, target } => {
                let nid = self.string_id(name)?;
                self.u8(TAG_REMOVE_ENTRY)?;
                self.u16(cmd_id)?;
                self.rid(*dir)?;
                self.u16(nid)?;
                self.rid(*target)?;
            }
            Step::Launch { child, refs } => {
                let child_id = self.command_id(ctx, *child)?;
                self.u8(TAG_LAUNCH)?;
                self.u16(cmd_id)?;
                self.u16(child_id)?;
                self.u16(refs.len().try_into()?)?;
                for (parent_ref, child_ref) in refs {
                    self.rid(*parent_ref)?;
                    self.rid(*child_ref)?;
                }
            }
            Step::Join { child, exit } => {
                let child_id = self.command_id(ctx, *child)?;
                self.u8(TAG_JOIN)?;
                self.u16(cmd_id)?;
                self.u16(child_id)?;
                self.i32(*exit)?;
            }
            Step::Exit { exit } => {
                self.u8(TAG_EXIT)?;
                self.u16(cmd_id)?;
                self.i32(*exit)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, _ctx: &mut TraceCtx) -> anyhow::Result<()> {
        self.u8(TAG_END)?;
        self.w.flush()?;
        std::fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }
}

struct TraceReader<R> {
    r: R,
    strings: Vec<String>,
    paths: Vec<String>,
    commands: Vec<CommandId>,
    metadata_versions: Vec<MetadataVersionId>,
    content_versions: Vec<ContentVersionId>,
}

impl<R: Read> TraceReader<R> {
    fn u8(&mut self) -> Result<u8, TraceError> {
        let mut buf = [0u8; 1];
        self.r.read_exact(&mut buf)?;
        Ok(buf[0])
    }
    fn u16(&mut self) -> Result<u16, TraceError> {
        let mut buf = [0u8; 2];
        self.r.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    fn u32(&mut self) -> Result<u32, TraceError> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    fn u64(&mut self) -> Result<u64, TraceError> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
    fn i32(&mut self) -> Result<i32, TraceError> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
    fn i64(&mut self) -> Result<i64, TraceError> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn rid(&mut self) -> Result<RefId, TraceError> {
        Ok(RefId(self.u16()? as usize))
    }

    fn table_str(&mut self, what: &'static str) -> Result<String, TraceError> {
        let id = self.u16()? as usize;
        self.strings
            .get(id)
            .cloned()
            .ok_or_else(|| TraceError::Incompatible(format!("dangling {} id {}", what, id)))
    }

    fn table_path(&mut self) -> Result<String, TraceError> {
        let id = self.u16()? as usize;
        self.paths
            .get(id)
            .cloned()
            .ok_or_else(|| TraceError::Incompatible(format!("dangling path id {}", id)))
    }

    fn table_command(&mut self) -> Result<CommandId, TraceError> {
        let id = self.u16()? as usize;
        self.commands
            .get(id)
            .copied()
            .ok_or_else(|| TraceError::Incompatible(format!("dangling command id {}", id)))
    }

    fn opt_table_command(&mut self) -> Result<Option<CommandId>, TraceError> {
        let id = self.u16()? as usize;
        if id == NO_COMMAND as usize {
            return Ok(None);
        }
        self.commands
            .get(id)
            .copied()
            .map(Some)
            .ok_or_else(|| TraceError::Incompatible(format!("dangling command id {}", id)))
    }

    fn scenario(&mut self) -> Result<Scenario, TraceError> {
        Ok(if self.u8()? != 0 { Scenario::PostBuild } else { Scenario::Build })
    }

    fn inline_str(&mut self) -> Result<String, TraceError> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| TraceError::Incompatible("bad utf-8".to_string()))
    }
}

/// Read a trace from `path`.  Any malformation is reported as
/// `TraceError::Incompatible` so the caller can fall back to the default
/// trace.
pub fn read_trace(path: &Path) -> Result<Trace, TraceError> {
    let f = std::fs::File::open(path).map_err(TraceError::Io)?;
    let mut r = TraceReader {
        r: BufReader::new(f),
        strings: Vec::new(),
        paths: Vec::new(),
        commands: Vec::new(),
        metadata_versions: Vec::new(),
        content_versions: Vec::new(),
    };

    let magic = r.u64()?;
    if magic != MAGIC {
        return Err(TraceError::Incompatible("bad magic number".to_string()));
    }
    let version = r.u64()?;
    if version != FORMAT_VERSION {
        return Err(TraceError::Incompatible(format!(
            "format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    let mut trace = Trace::default();

    loop {
        let tag = r.u8()?;
        match tag {
            TAG_END => break,
            TAG_STRING => {
                let s = r.inline_str()?;
                r.strings.push(s);
            }
            TAG_PATH => {
                let s = r.inline_str()?;
                r.paths.push(s);
            }
            TAG_COMMAND => {
                let exe = r.rid()?;
                let argc = r.u16()? as usize;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(r.table_str("string")?);
                }
                let nfds = r.u8()? as usize;
                let mut fds = SmallMap::new();
                for _ in 0..nfds {
                    let fd = r.u8()? as i32;
                    let flags = FdFlags::from_byte(r.u8()?);
                    let rid = r.rid()?;
                    fds.insert(fd, (flags, rid));
                }
                let cwd = r.rid()?;
                let root = r.rid()?;
                let executed = r.u8()? != 0;
                let exit = r.i32()?;

                let mut cmd = Command::new(args);
                cmd.exe = exe;
                cmd.initial_fds = fds;
                cmd.cwd = cwd;
                cmd.root = root;
                cmd.executed = executed;
                cmd.exit_status = (exit != NO_EXIT).then_some(exit);
                let id = trace.commands.push(cmd);
                r.commands.push(id);
            }
            TAG_METADATA_VERSION => {
                let uid = r.u32()?;
                let gid = r.u32()?;
                let mode = r.u32()?;
                let id = trace.versions.push_metadata(MetadataVersion { uid, gid, mode });
                trace.versions.set_metadata_read_id(id, r.metadata_versions.len() as u16);
                r.metadata_versions.push(id);
            }
            TAG_CONTENT_VERSION => {
                let kind = r.u8()?;
                let v = match kind {
                    0 => {
                        let bits = r.u8()?;
                        let empty = bits & 1 != 0;
                        let fingerprint = if bits & 2 != 0 {
                            Some(Fingerprint {
                                mtime: r.i64()?,
                                mtime_nsec: r.i64()?,
                                size: r.u64()?,
                            })
                        } else {
                            None
                        };
                        let hash = if bits & 4 != 0 {
                            let mut h = [0u8; 32];
                            r.r.read_exact(&mut h).map_err(TraceError::from)?;
                            Some(ContentHash(h))
                        } else {
                            None
                        };
                        ContentVersion::File(FileVersion { empty, fingerprint, hash })
                    }
                    1 => ContentVersion::Symlink(SymlinkVersion { target: r.table_path()? }),
                    2 => {
                        let opaque = r.u8()? != 0;
                        let count = r.u16()? as usize;
                        let mut entries = std::collections::BTreeMap::new();
                        for _ in 0..count {
                            entries.insert(r.table_str("dir entry")?, None);
                        }
                        ContentVersion::Dir(DirListVersion { entries, opaque })
                    }
                    3 => ContentVersion::PipeWrite(PipeWriteVersion {
                        writer: r.opt_table_command()?,
                        seq: r.u32()?,
                    }),
                    4 => ContentVersion::PipeRead(PipeReadVersion {
                        writer: r.opt_table_command()?,
                        seq: r.u32()?,
                    }),
                    k => {
                        return Err(TraceError::Incompatible(format!("bad version kind {}", k)))
                    }
                };
                let id = trace.versions.push_content(v);
                trace.versions.set_content_read_id(id, r.content_versions.len() as u16);
                r.content_versions.push(id);
            }
            TAG_START => {
                let root = r.table_command()?;
                if root != LAUNCHER {
                    return Err(TraceError::Incompatible("root is not command 0".to_string()));
                }
            }
            step_tag => {
                let cmd = r.table_command()?;
                let step = read_step(&mut r, step_tag)?;
                trace.commands.get_mut(cmd).steps.push(step.clone());
                if let Step::Launch { child, .. } = step {
                    trace.commands.get_mut(cmd).children.push(child);
                }
                trace.steps.push((cmd, step));
            }
        }
    }

    Ok(trace)
}

fn read_step<R: Read>(r: &mut TraceReader<R>, tag: u8) -> Result<Step, TraceError> {
    let step = match tag {
        TAG_SPECIAL_REF => {
            let kind = SpecialKind::from_byte(r.u8()?)
                .ok_or_else(|| TraceError::Incompatible("bad special kind".to_string()))?;
            Step::SpecialRef { kind, out: r.rid()? }
        }
        TAG_PIPE_REF => Step::PipeRef { read_end: r.rid()?, write_end: r.rid()? },
        TAG_FILE_REF => Step::FileRef { mode: r.u32()?, out: r.rid()? },
        TAG_SYMLINK_REF => Step::SymlinkRef { target: r.table_path()?, out: r.rid()? },
        TAG_DIR_REF => Step::DirRef { mode: r.u32()?, out: r.rid()? },
        TAG_PATH_REF => {
            let base = r.rid()?;
            let path = r.table_path()?;
            let bits = r.u8()?;
            let mode = r.u32()?;
            Step::PathRef { base, path, flags: AccessFlags::from_byte(bits, mode), out: r.rid()? }
        }
        TAG_USING_REF => Step::UsingRef { r: r.rid()? },
        TAG_DONE_WITH_REF => Step::DoneWithRef { r: r.rid()? },
        TAG_COMPARE_REFS => {
            let a = r.rid()?;
            let b = r.rid()?;
            let kind = if r.u8()? != 0 {
                RefComparison::SameInstance
            } else {
                RefComparison::DifferentInstances
            };
            Step::CompareRefs { a, b, kind }
        }
        TAG_EXPECT_RESULT => Step::ExpectResult {
            scenario: r.scenario()?,
            r: r.rid()?,
            errno: r.i32()?,
        },
        TAG_MATCH_METADATA => {
            let scenario = r.scenario()?;
            let rr = r.rid()?;
            let id = r.u16()? as usize;
            let version = r
                .metadata_versions
                .get(id)
                .copied()
                .ok_or_else(|| TraceError::Incompatible(format!("dangling metadata id {}", id)))?;
            Step::MatchMetadata { scenario, r: rr, version }
        }
        TAG_MATCH_CONTENT => {
            let scenario = r.scenario()?;
            let rr = r.rid()?;
            let id = r.u16()? as usize;
            let version = r
                .content_versions
                .get(id)
                .copied()
                .ok_or_else(|| TraceError::Incompatible(format!("dangling content id {}", id)))?;
            Step::MatchContent { scenario, r: rr, version }
        }
        TAG_UPDATE_METADATA => {
            let rr = r.rid()?;
            let id = r.u16()? as usize;
            let version = r
                .metadata_versions
                .get(id)
                .copied()
                .ok_or_else(|| TraceError::Incompatible(format!("dangling metadata id {}", id)))?;
            Step::UpdateMetadata { r: rr, version }
        }
        TAG_UPDATE_CONTENT => {
            let rr = r.rid()?;
            let id = r.u16()? as usize;
            let version = r
                .content_versions
                .get(id)
                .copied()
                .ok_or_else(|| TraceError::Incompatible(format!("dangling content id {}", id)))?;
            Step::UpdateContent { r: rr, version }
        }
        TAG_ADD_ENTRY => Step::AddEntry {
            dir: r.rid()?,
            name: r.table_str("entry name")?,
            target: r.rid()?,
        },
        TAG_REMOVE_ENTRY => Step::RemoveEntry {
            dir: r.rid()?,
            name: r.table_str("entry name")?,
            target: r.rid()?,
        },
        TAG_LAUNCH => {
            let child = r.table_command()?;
            let n = r.u16()? as usize;
            let mut refs = Vec::with_capacity(n);
            for _ in 0..n {
                refs.push((r.rid()?, r.rid()?));
            }
            Step::Launch { child, refs }
        }
        TAG_JOIN => Step::Join { child: r.table_command()?, exit: r.i32()? },
        TAG_EXIT => Step::Exit { exit: r.i32()? },
        t => return Err(TraceError::Incompatible(format!("unknown record tag {:#x}", t))),
    };
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a trace out and read it back; steps must round-trip.
    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut trace = Trace::default_trace("Buildfile");

        // Give the root command some recorded behavior worth preserving.
        let root = CommandId(1);
        let v = trace
            .versions
            .push_content(ContentVersion::File(FileVersion::new_empty()));
        let extra = vec![
            (
                root,
                Step::PathRef {
                    base: CWD_REF,
                    path: "out".to_string(),
                    flags: AccessFlags { w: true, create: true, mode: 0o666, ..Default::default() },
                    out: RefId(6),
                },
            ),
            (root, Step::ExpectResult { scenario: Scenario::Build, r: RefId(6), errno: 0 }),
            (root, Step::UpdateContent { r: RefId(6), version: v }),
            (root, Step::DoneWithRef { r: RefId(6) }),
            (root, Step::Exit { exit: 0 }),
        ];
        // Splice before the launcher's Join/Exit tail.
        let tail = trace.steps.split_off(trace.steps.len() - 2);
        trace.steps.extend(extra);
        trace.steps.extend(tail);

        let mut writer = TraceWriter::create(dir.path())?;
        let mut versions = trace.versions.clone();
        let mut ctx = TraceCtx { commands: &trace.commands, versions: &mut versions };
        writer.start(&mut ctx, LAUNCHER)?;
        for (cmd, step) in &trace.steps {
            writer.step(&mut ctx, *cmd, step)?;
        }
        writer.finish(&mut ctx)?;

        let back = read_trace(&dir.path().join(TRACE_FILE)).map_err(anyhow::Error::new)?;
        assert_eq!(back.commands.len(), trace.commands.len());
        assert_eq!(back.steps.len(), trace.steps.len());
        for ((ca, sa), (cb, sb)) in trace.steps.iter().zip(back.steps.iter()) {
            assert_eq!(ca, cb);
            assert_eq!(sa.name(), sb.name());
        }
        // The root command's args survived.
        assert_eq!(back.commands.get(root).args, vec!["sh", "Buildfile"]);
        assert!(!back.commands.get(root).executed);
        Ok(())
    }

    #[test]
    fn truncated_trace_is_incompatible() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(TRACE_FILE);
        std::fs::write(&path, &MAGIC.to_le_bytes()[..4])?;
        match read_trace(&path) {
            Err(TraceError::Incompatible(_)) => {}
            other => panic!("expected incompatible, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn wrong_magic_is_incompatible() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(TRACE_FILE);
        let mut bytes = Vec::new();
        bytes.extend(0xdeadbeefdeadbeefu64.to_le_bytes());
        bytes.extend(FORMAT_VERSION.to_le_bytes());
        bytes.push(TAG_END);
        std::fs::write(&path, bytes)?;
        assert!(matches!(read_trace(&path), Err(TraceError::Incompatible(_))));
        Ok(())
    }

    #[test]
    fn wrong_version_is_incompatible() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(TRACE_FILE);
        let mut bytes = Vec::new();
        bytes.extend(MAGIC.to_le_bytes());
        bytes.extend(99u64.to_le_bytes());
        bytes.push(TAG_END);
        std::fs::write(&path, bytes)?;
        assert!(matches!(read_trace(&path), Err(TraceError::Incompatible(_))));
        Ok(())
    }

    #[test]
    fn default_trace_shape() {
        let trace = Trace::default_trace("Buildfile");
        assert_eq!(trace.commands.len(), 2);
        assert!(trace.commands.get(LAUNCHER).executed);
        assert!(!trace.commands.get(CommandId(1)).executed);
        // The launcher's final steps are launch, join, exit.
        let names: Vec<&str> = trace.steps.iter().map(|(_, s)| s.name()).collect();
        assert_eq!(
            &names[names.len() - 3..],
            &["Launch", "Join", "Exit"]
        );
    }
}
