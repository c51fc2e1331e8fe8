//! The build engine: replays the previous trace against the current
//! environment, emulating every command the plan trusts and re-executing
//! the rest, while emitting the trace of this run.
//!
//! Each step is applied the same way regardless of where it came from; the
//! difference between emulation and tracing is only whether predicates are
//! checked (emulated steps assert the recorded world still holds) or
//! recorded (traced steps describe the world as just observed).

use std::collections::{HashMap, HashSet};

use anyhow::bail;

use crate::artifact::{ArtifactId, ArtifactKind, Match};
use crate::canon;
use crate::db::{IRSink, TraceCtx};
use crate::env::Env;
use crate::ir::{
    AccessFlags, CommandId, Commands, RefComparison, RefId, Scenario, Step, LAUNCHER, ROOT_REF,
};
use crate::observer::{AnyVersion, BuildObserver, InputKind};
use crate::plan::RebuildPlan;
use crate::resolve;
use crate::signal;
use crate::tracer::{Tracer, TracerOutput};
use crate::version::BlobCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provenance {
    /// Replayed from the input trace; predicates are checked.
    Emulated,
    /// Fresh from the tracer; predicates are observations.
    Traced,
}

/// A live reference in some command's table.
#[derive(Debug, Clone)]
struct RefSlot {
    resolution: Result<ArtifactId, i32>,
    flags: AccessFlags,
    /// Liveness bracket count; zero means DoneWithRef closed it.
    uses: u32,
}

type RefTable = Vec<Option<RefSlot>>;

/// A PostBuild predicate postponed until the end of replay.
struct DeferredCheck {
    artifact: Option<ArtifactId>,
    expected: AnyVersion,
}

/// What a finished engine pass reports back.
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    /// Number of commands actually re-executed.
    pub traced: usize,
    /// Whether any re-executed command failed.
    pub failed: bool,
}

pub struct Engine<'a> {
    commands: Commands,
    env: Env,
    steps: Vec<(CommandId, Step)>,
    plan: RebuildPlan,
    cache: BlobCache,
    tracer: &'a mut dyn Tracer,
    out: &'a mut dyn IRSink,
    observers: Vec<&'a mut dyn BuildObserver>,
    refs: HashMap<CommandId, RefTable>,
    running: HashSet<CommandId>,
    exited: HashSet<CommandId>,
    /// Commands whose recorded steps in the input stream are superseded by
    /// fresh tracing this run.
    skipped: HashSet<CommandId>,
    deferred: Vec<DeferredCheck>,
    /// Whether this pass realizes results on disk (the execution pass) or
    /// only observes (the planning pass).
    commit: bool,
    /// Replay is past the launcher's Join; the remaining launcher steps
    /// are last run's final-state predicates.
    postbuild_zone: bool,
    traced_count: usize,
    failed: bool,
}

impl<'a> Engine<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commands: Commands,
        steps: Vec<(CommandId, Step)>,
        env: Env,
        plan: RebuildPlan,
        cache: BlobCache,
        tracer: &'a mut dyn Tracer,
        out: &'a mut dyn IRSink,
        commit: bool,
    ) -> Engine<'a> {
        Engine {
            commands,
            env,
            steps,
            plan,
            cache,
            tracer,
            out,
            observers: Vec::new(),
            refs: HashMap::new(),
            running: HashSet::new(),
            exited: HashSet::new(),
            skipped: HashSet::new(),
            deferred: Vec::new(),
            commit,
            postbuild_zone: false,
            traced_count: 0,
            failed: false,
        }
    }

    pub fn add_observer(&mut self, o: &'a mut dyn BuildObserver) {
        self.observers.push(o);
    }

    /// Tear down the engine, handing back the final command table and
    /// environment.
    pub fn into_parts(self) -> (Commands, Env) {
        (self.commands, self.env)
    }

    /// Replay the whole input stream.
    pub fn run(&mut self) -> anyhow::Result<Outcome> {
        {
            let mut ctx = TraceCtx { commands: &self.commands, versions: &mut self.env.versions };
            self.out.start(&mut ctx, LAUNCHER)?;
        }
        self.refs.insert(LAUNCHER, Vec::new());
        self.running.insert(LAUNCHER);

        let steps = std::mem::take(&mut self.steps);
        for (cmd, step) in &steps {
            if signal::was_interrupted() {
                bail!("interrupted");
            }
            if self.skipped.contains(cmd) {
                continue;
            }
            self.apply_step(*cmd, step, Provenance::Emulated)?;
        }

        {
            let mut ctx = TraceCtx { commands: &self.commands, versions: &mut self.env.versions };
            self.out.finish(&mut ctx)?;
        }
        Ok(Outcome { traced: self.traced_count, failed: self.failed })
    }

    /****** reference tables ******/

    fn slot(&self, cmd: CommandId, r: RefId) -> anyhow::Result<&RefSlot> {
        match self.refs.get(&cmd).and_then(|t| t.get(r.0)).and_then(|s| s.as_ref()) {
            Some(slot) if slot.uses > 0 => Ok(slot),
            _ => bail!("command {}: dangling reference {}", cmd, r),
        }
    }

    fn resolution(&self, cmd: CommandId, r: RefId) -> anyhow::Result<Result<ArtifactId, i32>> {
        Ok(self.slot(cmd, r)?.resolution)
    }

    fn errno_of(&self, cmd: CommandId, r: RefId) -> anyhow::Result<i32> {
        Ok(match self.resolution(cmd, r)? {
            Ok(_) => 0,
            Err(errno) => errno,
        })
    }

    fn set_ref(
        &mut self,
        cmd: CommandId,
        r: RefId,
        resolution: Result<ArtifactId, i32>,
        flags: AccessFlags,
    ) -> anyhow::Result<()> {
        let table = self.refs.entry(cmd).or_default();
        if table.len() <= r.0 {
            table.resize(r.0 + 1, None);
        }
        if matches!(&table[r.0], Some(slot) if slot.uses > 0) {
            bail!("command {}: reference {} redefined while live", cmd, r);
        }
        table[r.0] = Some(RefSlot { resolution, flags, uses: 1 });
        Ok(())
    }

    fn alloc_ref(&mut self, cmd: CommandId) -> RefId {
        RefId(self.refs.entry(cmd).or_default().len())
    }

    /****** observers ******/

    fn observe_input(&mut self, cmd: CommandId, a: ArtifactId, v: Option<AnyVersion>, kind: InputKind) {
        for o in self.observers.iter_mut() {
            o.input(cmd, a, v, kind);
        }
    }

    fn observe_output(&mut self, cmd: CommandId, a: ArtifactId, v: AnyVersion) {
        for o in self.observers.iter_mut() {
            o.output(cmd, a, v);
        }
    }

    fn observe_mismatch(
        &mut self,
        cmd: CommandId,
        a: ArtifactId,
        observed: Option<AnyVersion>,
        expected: AnyVersion,
    ) {
        for o in self.observers.iter_mut() {
            o.mismatch(cmd, a, observed, expected);
        }
    }

    fn observe_change(&mut self, cmd: CommandId, step: &Step) {
        for o in self.observers.iter_mut() {
            o.command_change(cmd, step);
        }
    }

    fn observe_final_mismatch(&mut self, a: ArtifactId, produced: AnyVersion, ondisk: Option<AnyVersion>) {
        for o in self.observers.iter_mut() {
            o.final_mismatch(a, produced, ondisk);
        }
    }

    /****** trace output ******/

    /// Emit a step into the output trace.  Launcher steps in the postbuild
    /// zone are suppressed: last run's final-state predicates are
    /// regenerated fresh at the end of this run.
    fn emit(&mut self, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
        if self.postbuild_zone && cmd == LAUNCHER && !matches!(step, Step::Exit { .. }) {
            return Ok(());
        }
        self.emit_raw(cmd, step)
    }

    fn emit_raw(&mut self, cmd: CommandId, step: &Step) -> anyhow::Result<()> {
        let mut ctx = TraceCtx { commands: &self.commands, versions: &mut self.env.versions };
        self.out.step(&mut ctx, cmd, step)
    }

    /****** step application ******/

    fn apply_step(&mut self, cmd: CommandId, step: &Step, prov: Provenance) -> anyhow::Result<()> {
        if self.exited.contains(&cmd) {
            bail!("command {} acted after exit, at step {}", cmd, step.name());
        }
        if !self.running.contains(&cmd) {
            bail!("command {} acted before launch, at step {}", cmd, step.name());
        }

        match step {
            Step::SpecialRef { kind, out } => {
                let aid = self.env.special(*kind);
                self.set_ref(cmd, *out, Ok(aid), AccessFlags::default())?;
                self.emit(cmd, step)?;
            }
            Step::PipeRef { read_end, write_end } => {
                let aid = self.env.create_pipe();
                self.set_ref(cmd, *read_end, Ok(aid), AccessFlags::read())?;
                self.set_ref(cmd, *write_end, Ok(aid), AccessFlags::write())?;
                self.emit(cmd, step)?;
            }
            Step::FileRef { mode, out } => {
                let aid = self.env.create_file(*mode);
                self.set_ref(cmd, *out, Ok(aid), AccessFlags::write())?;
                self.emit(cmd, step)?;
            }
            Step::SymlinkRef { target, out } => {
                let aid = self.env.create_symlink(target);
                self.set_ref(cmd, *out, Ok(aid), AccessFlags::write())?;
                self.emit(cmd, step)?;
            }
            Step::DirRef { mode, out } => {
                let aid = self.env.create_dir(*mode);
                self.set_ref(cmd, *out, Ok(aid), AccessFlags::write())?;
                self.emit(cmd, step)?;
            }
            Step::PathRef { base, path, flags, out } => {
                let res = match self.resolution(cmd, *base)? {
                    Ok(dir) => resolve::resolve(&mut self.env, cmd, dir, path, *flags),
                    Err(errno) => resolve::Resolution {
                        result: Err(errno),
                        created: false,
                        dirs: Vec::new(),
                    },
                };
                for d in &res.dirs {
                    self.observe_input(cmd, *d, None, InputKind::Resolution);
                }
                if res.created {
                    if let Ok(aid) = res.result {
                        if let Some(v) = self.env.current_content(aid) {
                            self.observe_output(cmd, aid, AnyVersion::Content(v));
                        }
                    }
                }
                self.set_ref(cmd, *out, res.result, *flags)?;
                self.emit(cmd, step)?;
            }
            Step::UsingRef { r } => {
                let table = self.refs.get_mut(&cmd);
                match table.and_then(|t| t.get_mut(r.0)).and_then(|s| s.as_mut()) {
                    Some(slot) if slot.uses > 0 => slot.uses += 1,
                    _ => bail!("command {}: UsingRef on dead reference {}", cmd, r),
                }
                self.emit(cmd, step)?;
            }
            Step::DoneWithRef { r } => {
                let table = self.refs.get_mut(&cmd);
                match table.and_then(|t| t.get_mut(r.0)).and_then(|s| s.as_mut()) {
                    Some(slot) if slot.uses > 0 => slot.uses -= 1,
                    _ => bail!("command {}: DoneWithRef on dead reference {}", cmd, r),
                }
                self.emit(cmd, step)?;
            }
            Step::CompareRefs { a, b, kind } => {
                if prov == Provenance::Emulated {
                    let ra = self.resolution(cmd, *a)?;
                    let rb = self.resolution(cmd, *b)?;
                    let same = matches!((ra, rb), (Ok(x), Ok(y)) if x == y);
                    let holds = match kind {
                        RefComparison::SameInstance => same,
                        RefComparison::DifferentInstances => !same,
                    };
                    if !holds {
                        self.observe_change(cmd, step);
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::ExpectResult { scenario, r, errno } => {
                if *scenario == Scenario::Build && prov == Provenance::Emulated {
                    let observed = self.errno_of(cmd, *r)?;
                    if observed != *errno {
                        self.observe_change(cmd, step);
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::MatchMetadata { scenario, r, version } => {
                let res = self.resolution(cmd, *r)?;
                if *scenario == Scenario::PostBuild {
                    self.deferred.push(DeferredCheck {
                        artifact: res.ok(),
                        expected: AnyVersion::Metadata(*version),
                    });
                    return Ok(());
                }
                match res {
                    Ok(aid) => {
                        self.observe_input(cmd, aid, Some(AnyVersion::Metadata(*version)), InputKind::Metadata);
                        if prov == Provenance::Emulated {
                            if let Match::Mismatch { observed } =
                                self.env.match_artifact_metadata(aid, *version)
                            {
                                self.observe_mismatch(
                                    cmd,
                                    aid,
                                    observed.map(AnyVersion::Metadata),
                                    AnyVersion::Metadata(*version),
                                );
                            }
                        }
                    }
                    Err(_) => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::MatchContent { scenario, r, version } => {
                let res = self.resolution(cmd, *r)?;
                if *scenario == Scenario::PostBuild {
                    self.deferred.push(DeferredCheck {
                        artifact: res.ok(),
                        expected: AnyVersion::Content(*version),
                    });
                    return Ok(());
                }
                match res {
                    Ok(aid) => {
                        self.observe_input(cmd, aid, Some(AnyVersion::Content(*version)), InputKind::Content);
                        if prov == Provenance::Emulated {
                            if let Match::Mismatch { observed } =
                                self.env.match_artifact_content(aid, *version)
                            {
                                self.observe_mismatch(
                                    cmd,
                                    aid,
                                    observed.map(AnyVersion::Content),
                                    AnyVersion::Content(*version),
                                );
                            }
                        }
                    }
                    Err(_) => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::UpdateMetadata { r, version } => {
                match self.resolution(cmd, *r)? {
                    Ok(aid) => {
                        self.env.artifact_mut(aid).update_metadata(cmd, *version);
                        if prov == Provenance::Traced {
                            self.env.artifact_mut(aid).metadata.mark_committed();
                        }
                        self.observe_output(cmd, aid, AnyVersion::Metadata(*version));
                    }
                    Err(_) => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::UpdateContent { r, version } => {
                match self.resolution(cmd, *r)? {
                    Ok(aid) => {
                        self.env.update_artifact_content(aid, cmd, *version);
                        if prov == Provenance::Traced {
                            self.env.artifact_mut(aid).mark_content_committed();
                        }
                        self.observe_output(cmd, aid, AnyVersion::Content(*version));
                    }
                    Err(_) => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::AddEntry { dir, name, target } => {
                let dres = self.resolution(cmd, *dir)?;
                let tres = self.resolution(cmd, *target)?;
                match (dres, tres) {
                    // The recorded directory may have been replaced on
                    // disk by some other kind of object since last run;
                    // that is a change, not a directory edit.
                    (Ok(d), Ok(t)) if self.env.artifact(d).is_dir() => {
                        self.env.artifact_mut(d).add_entry(cmd, name, t, prov == Provenance::Traced);
                        if let Some(dp) = self.env.artifact(d).path.clone() {
                            self.env.install(&canon::join(&dp, name), t);
                        }
                        if let Some(v) = self.env.current_content(d) {
                            self.observe_output(cmd, d, AnyVersion::Content(v));
                        }
                    }
                    _ => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::RemoveEntry { dir, name, target } => {
                let dres = self.resolution(cmd, *dir)?;
                let _ = self.resolution(cmd, *target)?;
                match dres {
                    Ok(d) if self.env.artifact(d).is_dir() => {
                        self.env.artifact_mut(d).remove_entry(cmd, name, prov == Provenance::Traced);
                        if let Some(dp) = self.env.artifact(d).path.clone() {
                            self.env.remove(&canon::join(&dp, name));
                        }
                        if let Some(v) = self.env.current_content(d) {
                            self.observe_output(cmd, d, AnyVersion::Content(v));
                        }
                    }
                    _ => {
                        if prov == Provenance::Emulated {
                            self.observe_change(cmd, step);
                        }
                    }
                }
                self.emit(cmd, step)?;
            }
            Step::Launch { child, refs } => {
                self.handle_launch(cmd, *child, refs, prov, step)?;
            }
            Step::Join { child, exit } => {
                let actual = self.commands.get(*child).exit_status.unwrap_or(*exit);
                if prov == Provenance::Emulated && actual != *exit {
                    self.observe_change(cmd, step);
                }
                self.emit(cmd, &Step::Join { child: *child, exit: actual })?;
                if cmd == LAUNCHER {
                    self.postbuild_zone = true;
                }
            }
            Step::Exit { exit } => {
                if cmd == LAUNCHER {
                    self.finish_build()?;
                }
                self.commands.get_mut(cmd).exit_status = Some(*exit);
                // Release every reference this command still holds,
                // whatever state the command ended in.
                self.refs.insert(cmd, Vec::new());
                self.running.remove(&cmd);
                self.exited.insert(cmd);
                self.emit(cmd, step)?;
            }
        }
        Ok(())
    }

    fn handle_launch(
        &mut self,
        parent: CommandId,
        child: CommandId,
        refs: &[(RefId, RefId)],
        prov: Provenance,
        step: &Step,
    ) -> anyhow::Result<()> {
        // Bind the child's initial references from the parent's table,
        // regardless of which mode either command is in.
        let mut table: RefTable = Vec::new();
        for (pref, cref) in refs {
            let slot = self.slot(parent, *pref)?.clone();
            if table.len() <= cref.0 {
                table.resize(cref.0 + 1, None);
            }
            table[cref.0] = Some(RefSlot { uses: 1, ..slot });
        }
        self.refs.insert(child, table);
        self.running.insert(child);
        if !self.commands.get(parent).children.contains(&child) {
            self.commands.get_mut(parent).children.push(child);
        }

        for o in self.observers.iter_mut() {
            o.launch(parent, child);
        }
        if !self.commands.get(child).executed {
            for o in self.observers.iter_mut() {
                o.command_never_run(child);
            }
        }
        // A command that failed last time cannot be trusted to emulate;
        // give it another chance to run.
        let failed_before = self
            .commands
            .get(child)
            .steps
            .iter()
            .any(|s| matches!(s, Step::Exit { exit } if *exit != 0));
        if prov == Provenance::Emulated && failed_before {
            self.observe_change(child, step);
        }

        // The child's payload is serialized when the Launch record is
        // emitted, so its executed flag must be settled first.
        let will_run = prov == Provenance::Traced
            || (prov == Provenance::Emulated && self.plan.must_run(child));
        if will_run {
            self.commands.get_mut(child).executed = true;
        }

        self.emit(parent, step)?;

        if prov == Provenance::Emulated && self.plan.must_run(child) {
            self.mark_skipped(child);
            self.run_traced(child)?;
        }
        Ok(())
    }

    /// The recorded steps of `cmd` and everything below it are stale once
    /// we re-execute it; drop them from the input stream.
    fn mark_skipped(&mut self, cmd: CommandId) {
        if !self.skipped.insert(cmd) {
            return;
        }
        let children = self.commands.get(cmd).children.clone();
        for child in children {
            self.mark_skipped(child);
        }
    }

    /// Re-execute a command through the tracer and fold its fresh IR into
    /// the build.
    fn run_traced(&mut self, cmd: CommandId) -> anyhow::Result<()> {
        self.traced_count += 1;
        let recorded = self.commands.get(cmd).steps.clone();
        self.commands.get_mut(cmd).reset();

        let output = self.tracer.trace(cmd, &mut self.commands, &mut self.env)?;

        match output {
            TracerOutput::Steps(steps) => {
                for (c, s) in steps {
                    self.apply_step(c, &s, Provenance::Traced)?;
                }
            }
            TracerOutput::ExitStatus(status) => {
                self.refresh_recorded(cmd, &recorded, status)?;
            }
        }

        if self.commands.get(cmd).exit_status.map_or(false, |s| s != 0) {
            self.failed = true;
        }
        Ok(())
    }

    /// A command re-ran without syscall interception.  Re-emit its recorded
    /// steps with every observation refreshed against the disk the process
    /// just left behind.
    fn refresh_recorded(
        &mut self,
        cmd: CommandId,
        recorded: &[Step],
        actual_exit: i32,
    ) -> anyhow::Result<()> {
        let mut exited = false;
        for step in recorded {
            match step {
                // Last run's final-state predicates are regenerated at the
                // end of this run.
                Step::ExpectResult { scenario: Scenario::PostBuild, .. }
                | Step::MatchMetadata { scenario: Scenario::PostBuild, .. }
                | Step::MatchContent { scenario: Scenario::PostBuild, .. } => {}

                Step::ExpectResult { scenario: Scenario::Build, r, .. } => {
                    let observed = self.errno_of(cmd, *r)?;
                    let fresh =
                        Step::ExpectResult { scenario: Scenario::Build, r: *r, errno: observed };
                    self.apply_step(cmd, &fresh, Provenance::Traced)?;
                }
                Step::MatchContent { scenario: Scenario::Build, r, .. } => {
                    if let Ok(aid) = self.resolution(cmd, *r)? {
                        self.env.refresh_from_disk(aid);
                        if let Some(v) = self.env.current_content(aid) {
                            let fresh = Step::MatchContent {
                                scenario: Scenario::Build,
                                r: *r,
                                version: v,
                            };
                            self.apply_step(cmd, &fresh, Provenance::Traced)?;
                        }
                    }
                }
                Step::MatchMetadata { scenario: Scenario::Build, r, .. } => {
                    if let Ok(aid) = self.resolution(cmd, *r)? {
                        self.env.refresh_from_disk(aid);
                        if let Some(v) = self.env.current_metadata(aid) {
                            let fresh = Step::MatchMetadata {
                                scenario: Scenario::Build,
                                r: *r,
                                version: v,
                            };
                            self.apply_step(cmd, &fresh, Provenance::Traced)?;
                        }
                    }
                }
                Step::UpdateContent { r, version } => {
                    if let Ok(aid) = self.resolution(cmd, *r)? {
                        let fresh = if matches!(self.env.artifact(aid).kind, ArtifactKind::Pipe(_))
                        {
                            self.env.pipe_write(aid, cmd)
                        } else if self.env.artifact(aid).path.is_some() {
                            self.env.refresh_from_disk(aid);
                            self.env.current_content(aid).unwrap_or(*version)
                        } else {
                            *version
                        };
                        let fresh = Step::UpdateContent { r: *r, version: fresh };
                        self.apply_step(cmd, &fresh, Provenance::Traced)?;
                    }
                }
                Step::UpdateMetadata { r, version } => {
                    if let Ok(aid) = self.resolution(cmd, *r)? {
                        let fresh = if self.env.artifact(aid).path.is_some() {
                            self.env.refresh_from_disk(aid);
                            self.env.current_metadata(aid).unwrap_or(*version)
                        } else {
                            *version
                        };
                        let fresh = Step::UpdateMetadata { r: *r, version: fresh };
                        self.apply_step(cmd, &fresh, Provenance::Traced)?;
                    }
                }
                Step::Launch { child, .. } => {
                    self.apply_step(cmd, step, Provenance::Traced)?;
                    // The whole subtree re-ran inside this process; refresh
                    // each recorded child in turn.
                    let child = *child;
                    let child_recorded = self.commands.get(child).steps.clone();
                    self.commands.get_mut(child).reset();
                    self.commands.get_mut(child).executed = true;
                    let child_exit = child_recorded
                        .iter()
                        .find_map(|s| match s {
                            Step::Exit { exit } => Some(*exit),
                            _ => None,
                        })
                        .unwrap_or(0);
                    self.refresh_recorded(child, &child_recorded, child_exit)?;
                }
                Step::Exit { .. } => {
                    self.apply_step(cmd, &Step::Exit { exit: actual_exit }, Provenance::Traced)?;
                    exited = true;
                }
                // Reference creation, brackets, comparisons, and directory
                // edits replay as fresh observations.
                _ => self.apply_step(cmd, step, Provenance::Traced)?,
            }
        }
        if !exited {
            self.apply_step(cmd, &Step::Exit { exit: actual_exit }, Provenance::Traced)?;
        }
        Ok(())
    }

    /****** end of build ******/

    /// Runs when the launcher exits: evaluate last run's final-state
    /// predicates, then walk every touched artifact, committing (execution
    /// pass) or checking (planning pass) its final state.
    fn finish_build(&mut self) -> anyhow::Result<()> {
        let deferred = std::mem::take(&mut self.deferred);
        for check in deferred {
            let aid = match check.artifact {
                Some(a) => a,
                None => continue,
            };
            // An output rewritten by a traced producer is expected to have
            // changed since last run.
            if let Some(w) = self.env.artifact(aid).content_writer {
                if self.skipped.contains(&w) {
                    continue;
                }
            }
            match check.expected {
                AnyVersion::Content(expected) => {
                    let ondisk = self.env.observe_on_disk(aid);
                    let holds = matches!(ondisk, Some(d)
                        if self.env.versions.content_matches(expected, d));
                    if holds {
                        // The disk still carries the state the last run
                        // produced; adopt it as committed.
                        self.env.artifact_mut(aid).adopt_committed_content(expected);
                    } else {
                        self.observe_final_mismatch(
                            aid,
                            AnyVersion::Content(expected),
                            ondisk.map(AnyVersion::Content),
                        );
                    }
                }
                AnyVersion::Metadata(expected) => {
                    let ondisk = self.env.observe_metadata_on_disk(aid);
                    let holds = matches!(ondisk, Some(d)
                        if self.env.versions.metadata_matches(expected, d));
                    if !holds {
                        self.observe_final_mismatch(
                            aid,
                            AnyVersion::Metadata(expected),
                            ondisk.map(AnyVersion::Metadata),
                        );
                    }
                }
            }
        }

        for (path, aid) in self.env.path_bindings() {
            let touched = {
                let a = self.env.artifact(aid);
                a.content_writer.is_some() || a.has_uncommitted_content()
            };
            if !touched {
                continue;
            }
            if self.commit {
                match self.env.apply_final(aid, &path) {
                    Ok(Some(final_v)) => {
                        if let Err(err) =
                            self.env.versions.cache(final_v, std::path::Path::new(&path), &self.cache)
                        {
                            eprintln!("retrace: warning: cannot cache {}: {}", path, err);
                        }
                        self.emit_final_state(aid, &path, final_v)?;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Reported, not fatal: the next plan reruns the
                        // producer.
                        eprintln!("retrace: warning: cannot realize {}: {}", path, err);
                        if let Some(produced) = self.env.current_content(aid) {
                            self.observe_final_mismatch(aid, AnyVersion::Content(produced), None);
                        }
                    }
                }
            } else if let Some((produced, ondisk)) = self.env.check_final(aid, &path) {
                self.observe_final_mismatch(
                    aid,
                    AnyVersion::Content(produced),
                    ondisk.map(AnyVersion::Content),
                );
            }
        }
        Ok(())
    }

    /// Record a final-state predicate for the next run: a fresh path
    /// reference in the launcher's namespace and a PostBuild content match.
    fn emit_final_state(&mut self, aid: ArtifactId, path: &str, v: crate::version::ContentVersionId) -> anyhow::Result<()> {
        let r = self.alloc_ref(LAUNCHER);
        let rel = path.strip_prefix('/').unwrap_or(path).to_string();
        self.set_ref(LAUNCHER, r, Ok(aid), AccessFlags::read())?;
        self.emit_raw(
            LAUNCHER,
            &Step::PathRef { base: ROOT_REF, path: rel, flags: AccessFlags::read(), out: r },
        )?;
        self.emit_raw(
            LAUNCHER,
            &Step::MatchContent { scenario: Scenario::PostBuild, r, version: v },
        )?;
        self.emit_raw(LAUNCHER, &Step::DoneWithRef { r })?;
        Ok(())
    }
}
