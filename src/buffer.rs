//! A temporary holding pen for IR steps: the tracer accumulates steps here
//! before the engine decides whether to keep them.
//!
//! The buffer is backed by an unlinked temp file, so an interrupted build
//! cannot leave it behind.  It is a one-shot state machine: Filling until
//! drained into a sink, then spent.  Unlike the real trace, records in the
//! buffer name commands and versions by their arena IDs directly; the
//! interning tables belong to the on-disk format only.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use anyhow::bail;

use crate::db::{IRSink, TraceCtx};
use crate::ir::{AccessFlags, CommandId, RefComparison, RefId, Scenario, SpecialKind, Step};
use crate::version::{ContentVersionId, MetadataVersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Filling,
    Draining,
    Drained,
}

pub struct IRBuffer {
    mode: Mode,
    w: Option<BufWriter<std::fs::File>>,
    steps: usize,
}

impl IRBuffer {
    pub fn new() -> anyhow::Result<IRBuffer> {
        // tempfile() creates an already-unlinked file, so the backing
        // storage disappears with the handle on every exit path.
        let file = tempfile::tempfile()?;
        Ok(IRBuffer {
            mode: Mode::Filling,
            w: Some(BufWriter::new(file)),
            steps: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Stream the buffered steps into `sink`, consuming the buffer.
    pub fn send_to(&mut self, ctx: &mut TraceCtx, sink: &mut dyn IRSink) -> anyhow::Result<()> {
        if self.mode != Mode::Filling {
            bail!("IR buffer drained twice");
        }
        self.mode = Mode::Draining;

        let mut w = self.w.take().unwrap();
        w.flush()?;
        let mut file = w.into_inner()?;
        file.seek(SeekFrom::Start(0))?;
        let mut r = BufReader::new(file);

        for _ in 0..self.steps {
            let (cmd, step) = decode_step(&mut r)?;
            sink.step(ctx, cmd, &step)?;
        }

        self.mode = Mode::Drained;
        Ok(())
    }
}

impl IRSink for IRBuffer {
    fn start(&mut self, _ctx: &mut TraceCtx, _root: CommandId) -> anyhow::Result<()> {
        Ok(())
    }

    fn step(&mut self, _ctx: &mut TraceCtx, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
        if self.mode != Mode::Filling {
            bail!("IR buffer is no longer filling");
        }
        let w = self.w.as_mut().unwrap();
        encode_step(w, cmd, step)?;
        self.steps += 1;
        Ok(())
    }

    fn finish(&mut self, _ctx: &mut TraceCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

fn u32_of(n: usize) -> u32 {
    n as u32
}

fn w_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}
fn w_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
fn w_i32(w: &mut impl Write, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
fn w_rid(w: &mut impl Write, r: RefId) -> std::io::Result<()> {
    w_u32(w, u32_of(r.0))
}
fn w_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    w_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn r_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}
fn r_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
fn r_i32(r: &mut impl Read) -> std::io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}
fn r_rid(r: &mut impl Read) -> std::io::Result<RefId> {
    Ok(RefId(r_u32(r)? as usize))
}
fn r_str(r: &mut impl Read) -> anyhow::Result<String> {
    let len = r_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn encode_step(w: &mut impl Write, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
    w_u32(w, u32_of(cmd.0))?;
    match step {
        Step::SpecialRef { kind, out } => {
            w_u8(w, 0)?;
            w_u8(w, kind.to_byte())?;
            w_rid(w, *out)?;
        }
        Step::PipeRef { read_end, write_end } => {
            w_u8(w, 1)?;
            w_rid(w, *read_end)?;
            w_rid(w, *write_end)?;
        }
        Step::FileRef { mode, out } => {
            w_u8(w, 2)?;
            w_u32(w, *mode)?;
            w_rid(w, *out)?;
        }
        Step::SymlinkRef { target, out } => {
            w_u8(w, 3)?;
            w_str(w, target)?;
            w_rid(w, *out)?;
        }
        Step::DirRef { mode, out } => {
            w_u8(w, 4)?;
            w_u32(w, *mode)?;
            w_rid(w, *out)?;
        }
        Step::PathRef { base, path, flags, out } => {
            w_u8(w, 5)?;
            w_rid(w, *base)?;
            w_str(w, path)?;
            w_u8(w, flags.to_byte())?;
            w_u32(w, flags.mode)?;
            w_rid(w, *out)?;
        }
        Step::UsingRef { r } => {
            w_u8(w, 6)?;
            w_rid(w, *r)?;
        }
        Step::DoneWithRef { r } => {
            w_u8(w, 7)?;
            w_rid(w, *r)?;
        }
        Step::CompareRefs { a, b, kind } => {
            w_u8(w, 8)?;
            w_rid(w, *a)?;
            w_rid(w, *b)?;
            w_u8(w, matches!(kind, RefComparison::SameInstance) as u8)?;
        }
        Step::ExpectResult { scenario, r, errno } => {
            w_u8(w, 9)?;
            w_u8(w, matches!(scenario, Scenario::PostBuild) as u8)?;
            w_rid(w, *r)?;
            w_i32(w, *errno)?;
        }
        Step::MatchMetadata { scenario, r, version } => {
            w_u8(w, 10)?;
            w_u8(w, matches!(scenario, Scenario::PostBuild) as u8)?;
            w_rid(w, *r)?;
            w_u32(w, u32_of(version.0))?;
        }
        Step::MatchContent { scenario, r, version } => {
            w_u8(w, 11)?;
            w_u8(w, matches!(scenario, Scenario::PostBuild) as u8)?;
            w_rid(w, *r)?;
            w_u32(w, u32_of(version.0))?;
        }
        Step::UpdateMetadata { r, version } => {
            w_u8(w, 12)?;
            w_rid(w, *r)?;
            w_u32(w, u32_of(version.0))?;
        }
        Step::UpdateContent { r, version } => {
            w_u8(w, 13)?;
            w_rid(w, *r)?;
            w_u32(w, u32_of(version.0))?;
        }
        Step::AddEntry { dir, name, target } => {
            w_u8(w, 14)?;
            w_rid(w, *dir)?;
            w_str(w, name)?;
            w_rid(w, *target)?;
        }
        Step::RemoveEntry { dir, name, target } => {
            w_u8(w, 15)?;
            w_rid(w, *dir)?;
            w_str(w, name)?;
            w_rid(w, *target)?;
        }
        Step::Launch { child, refs } => {
            w_u8(w, 16)?;
            w_u32(w, u32_of(child.0))?;
            w_u32(w, refs.len() as u32)?;
            for (a, b) in refs {
                w_rid(w, *a)?;
                w_rid(w, *b)?;
            }
        }
        Step::Join { child, exit } => {
            w_u8(w, 17)?;
            w_u32(w, u32_of(child.0))?;
            w_i32(w, *exit)?;
        }
        Step::Exit { exit } => {
            w_u8(w, 18)?;
            w_i32(w, *exit)?;
        }
    }
    Ok(())
}

fn decode_step(r: &mut impl Read) -> anyhow::Result<(CommandId, Step)> {
    let cmd = CommandId(r_u32(r)? as usize);
    let tag = r_u8(r)?;
    let step = match tag {
        0 => {
            let kind = SpecialKind::from_byte(r_u8(r)?)
                .ok_or_else(|| anyhow::anyhow!("bad special kind in buffer"))?;
            Step::SpecialRef { kind, out: r_rid(r)? }
        }
        1 => Step::PipeRef { read_end: r_rid(r)?, write_end: r_rid(r)? },
        2 => Step::FileRef { mode: r_u32(r)?, out: r_rid(r)? },
        3 => Step::SymlinkRef { target: r_str(r)?, out: r_rid(r)? },
        4 => Step::DirRef { mode: r_u32(r)?, out: r_rid(r)? },
        5 => {
            let base = r_rid(r)?;
            let path = r_str(r)?;
            let bits = r_u8(r)?;
            let mode = r_u32(r)?;
            Step::PathRef { base, path, flags: AccessFlags::from_byte(bits, mode), out: r_rid(r)? }
        }
        6 => Step::UsingRef { r: r_rid(r)? },
        7 => Step::DoneWithRef { r: r_rid(r)? },
        8 => {
            let a = r_rid(r)?;
            let b = r_rid(r)?;
            let kind = if r_u8(r)? != 0 {
                RefComparison::SameInstance
            } else {
                RefComparison::DifferentInstances
            };
            Step::CompareRefs { a, b, kind }
        }
        9 => {
            let scenario = if r_u8(r)? != 0 { Scenario::PostBuild } else { Scenario::Build };
            Step::ExpectResult { scenario, r: r_rid(r)?, errno: r_i32(r)? }
        }
        10 => {
            let scenario = if r_u8(r)? != 0 { Scenario::PostBuild } else { Scenario::Build };
            Step::MatchMetadata {
                scenario,
                r: r_rid(r)?,
                version: MetadataVersionId(r_u32(r)? as usize),
            }
        }
        11 => {
            let scenario = if r_u8(r)? != 0 { Scenario::PostBuild } else { Scenario::Build };
            Step::MatchContent {
                scenario,
                r: r_rid(r)?,
                version: ContentVersionId(r_u32(r)? as usize),
            }
        }
        12 => Step::UpdateMetadata {
            r: r_rid(r)?,
            version: MetadataVersionId(r_u32(r)? as usize),
        },
        13 => Step::UpdateContent {
            r: r_rid(r)?,
            version: ContentVersionId(r_u32(r)? as usize),
        },
        14 => Step::AddEntry { dir: r_rid(r)?, name: r_str(r)?, target: r_rid(r)? },
        15 => Step::RemoveEntry { dir: r_rid(r)?, name: r_str(r)?, target: r_rid(r)? },
        16 => {
            let child = CommandId(r_u32(r)? as usize);
            let n = r_u32(r)? as usize;
            let mut refs = Vec::with_capacity(n);
            for _ in 0..n {
                refs.push((r_rid(r)?, r_rid(r)?));
            }
            Step::Launch { child, refs }
        }
        17 => Step::Join { child: CommandId(r_u32(r)? as usize), exit: r_i32(r)? },
        18 => Step::Exit { exit: r_i32(r)? },
        t => bail!("unknown buffer tag {}", t),
    };
    Ok((cmd, step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Commands;
    use crate::version::VersionStore;

    /// A sink that collects steps in memory.
    struct Collect(Vec<(CommandId, Step)>);

    impl IRSink for Collect {
        fn start(&mut self, _ctx: &mut TraceCtx, _root: CommandId) -> anyhow::Result<()> {
            Ok(())
        }
        fn step(&mut self, _ctx: &mut TraceCtx, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
            self.0.push((cmd, step.clone()));
            Ok(())
        }
        fn finish(&mut self, _ctx: &mut TraceCtx) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fill_then_drain() -> anyhow::Result<()> {
        let commands = Commands::new();
        let mut versions = VersionStore::new();
        let mut ctx = TraceCtx { commands: &commands, versions: &mut versions };

        let mut buf = IRBuffer::new()?;
        let steps = vec![
            (CommandId(1), Step::SpecialRef { kind: SpecialKind::Cwd, out: RefId(4) }),
            (
                CommandId(1),
                Step::PathRef {
                    base: RefId(4),
                    path: "out".to_string(),
                    flags: AccessFlags::write(),
                    out: RefId(6),
                },
            ),
            (CommandId(1), Step::Exit { exit: 0 }),
        ];
        for (cmd, step) in &steps {
            buf.step(&mut ctx, *cmd, step)?;
        }
        assert_eq!(buf.len(), 3);

        let mut out = Collect(Vec::new());
        buf.send_to(&mut ctx, &mut out)?;
        assert_eq!(out.0, steps);
        Ok(())
    }

    #[test]
    fn drain_twice_is_rejected() -> anyhow::Result<()> {
        let commands = Commands::new();
        let mut versions = VersionStore::new();
        let mut ctx = TraceCtx { commands: &commands, versions: &mut versions };

        let mut buf = IRBuffer::new()?;
        let mut out = Collect(Vec::new());
        buf.send_to(&mut ctx, &mut out)?;
        assert!(buf.send_to(&mut ctx, &mut out).is_err());
        Ok(())
    }

    #[test]
    fn fill_after_drain_is_rejected() -> anyhow::Result<()> {
        let commands = Commands::new();
        let mut versions = VersionStore::new();
        let mut ctx = TraceCtx { commands: &commands, versions: &mut versions };

        let mut buf = IRBuffer::new()?;
        let mut out = Collect(Vec::new());
        buf.send_to(&mut ctx, &mut out)?;
        assert!(buf
            .step(&mut ctx, CommandId(0), &Step::Exit { exit: 0 })
            .is_err());
        Ok(())
    }
}
