//! Engine integration tests: a scripted tracer stands in for the syscall
//! front-end, feeding the engine the IR a real trace would produce, so the
//! replay/emulation machinery can be exercised end to end against a temp
//! directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use retrace::db::{self, NullSink, Trace, TraceWriter};
use retrace::engine::{Engine, Outcome};
use retrace::env::Env;
use retrace::ir::{
    AccessFlags, Command, CommandId, Commands, RefId, Scenario, Step, CWD_REF, EXE_REF, ROOT_REF,
    STDERR_REF, STDIN_REF, STDOUT_REF,
};
use retrace::plan::{RebuildPlan, RebuildPlanner};
use retrace::tracer::{NeverTracer, Tracer, TracerOutput};
use retrace::version::{
    BlobCache, ContentVersion, ContentVersionId, DirListVersion, FileVersion, FingerprintLevel,
    PipeReadVersion, PipeWriteVersion,
};

type Script<'f> =
    Box<dyn FnMut(CommandId, &mut Commands, &mut Env) -> anyhow::Result<Vec<(CommandId, Step)>> + 'f>;

/// A tracer that "executes" a command by running a scripted closure, which
/// performs the command's real filesystem effects and returns the IR a
/// syscall tracer would have observed.
struct ScriptedTracer<'f> {
    script: Script<'f>,
    runs: usize,
}

impl<'f> ScriptedTracer<'f> {
    fn new(script: Script<'f>) -> Self {
        ScriptedTracer { script, runs: 0 }
    }
}

impl Tracer for ScriptedTracer<'_> {
    fn trace(
        &mut self,
        cmd: CommandId,
        commands: &mut Commands,
        env: &mut Env,
    ) -> anyhow::Result<TracerOutput> {
        self.runs += 1;
        Ok(TracerOutput::Steps((self.script)(cmd, commands, env)?))
    }
}

/// Manages a temporary directory holding a build's inputs, outputs, and
/// saved trace.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<TestSpace> {
        Ok(TestSpace { dir: tempfile::tempdir()? })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.path(name), content)
    }

    fn read(&self, name: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.path(name))
    }

    fn load_trace(&self) -> Trace {
        match db::read_trace(&self.path(db::TRACE_FILE)) {
            Ok(t) => t,
            Err(_) => Trace::default_trace("Buildfile"),
        }
    }

    /// One full retrace run: planning pass, then execution pass with the
    /// given tracer.  Returns the plan and the execution outcome.
    fn build(&self, tracer: &mut dyn Tracer) -> anyhow::Result<(RebuildPlan, Outcome)> {
        let cwd = self.dir.path().to_string_lossy().into_owned();
        let trace = self.load_trace();

        let mut planner = RebuildPlanner::new();
        let plan = {
            let Trace { commands, versions, steps } = trace.clone();
            let env = Env::new(versions, cwd.clone(), FingerprintLevel::Local);
            let mut never = NeverTracer;
            let mut sink = NullSink;
            let mut engine = Engine::new(
                commands,
                steps,
                env,
                RebuildPlan::new(),
                BlobCache::new(self.path(db::CACHE_DIR)),
                &mut never,
                &mut sink,
                false,
            );
            engine.add_observer(&mut planner);
            engine.run()?;
            let (_commands, mut env) = engine.into_parts();
            planner.make_plan(&mut env, &[], &[])
        };

        let Trace { commands, versions, steps } = trace;
        let env = Env::new(versions, cwd, FingerprintLevel::Local);
        let mut writer = TraceWriter::create(self.dir.path())?;
        let mut engine = Engine::new(
            commands,
            steps,
            env,
            plan.clone(),
            BlobCache::new(self.path(db::CACHE_DIR)),
            tracer,
            &mut writer,
            true,
        );
        let outcome = engine.run()?;
        Ok((plan, outcome))
    }
}

fn file_version(env: &mut Env, path: &Path) -> anyhow::Result<ContentVersionId> {
    let v = FileVersion::of_path(path, true)?;
    Ok(env.versions.push_content(ContentVersion::File(v)))
}

fn write_flags() -> AccessFlags {
    AccessFlags { w: true, create: true, mode: 0o666, ..Default::default() }
}

/// The root command for these tests is always command 1: the default
/// trace's launcher is 0 and its single child is the build script.
const ROOT: CommandId = CommandId(1);

/// A script that writes "hello\n" to out, recording the same IR a traced
/// `sh Buildfile` run would produce.
fn write_out_script(dir: PathBuf) -> Script<'static> {
    Box::new(move |cmd, _commands, env| {
        let out = dir.join("out");
        std::fs::write(&out, "hello\n")?;
        let v = file_version(env, &out)?;
        Ok(vec![
            (
                cmd,
                Step::PathRef { base: CWD_REF, path: "out".into(), flags: write_flags(), out: RefId(6) },
            ),
            (cmd, Step::ExpectResult { scenario: Scenario::Build, r: RefId(6), errno: 0 }),
            (cmd, Step::UpdateContent { r: RefId(6), version: v }),
            (cmd, Step::DoneWithRef { r: RefId(6) }),
            (cmd, Step::Exit { exit: 0 }),
        ])
    })
}

/// A script that reads in.txt and writes its uppercased content to out.
fn copy_script(dir: PathBuf) -> Script<'static> {
    Box::new(move |cmd, _commands, env| {
        let input = std::fs::read_to_string(dir.join("in.txt"))?;
        let vin = file_version(env, &dir.join("in.txt"))?;
        std::fs::write(dir.join("out"), input.to_uppercase())?;
        let vout = file_version(env, &dir.join("out"))?;
        Ok(vec![
            (
                cmd,
                Step::PathRef {
                    base: CWD_REF,
                    path: "in.txt".into(),
                    flags: AccessFlags::read(),
                    out: RefId(6),
                },
            ),
            (cmd, Step::ExpectResult { scenario: Scenario::Build, r: RefId(6), errno: 0 }),
            (cmd, Step::MatchContent { scenario: Scenario::Build, r: RefId(6), version: vin }),
            (cmd, Step::DoneWithRef { r: RefId(6) }),
            (
                cmd,
                Step::PathRef { base: CWD_REF, path: "out".into(), flags: write_flags(), out: RefId(7) },
            ),
            (cmd, Step::ExpectResult { scenario: Scenario::Build, r: RefId(7), errno: 0 }),
            (cmd, Step::UpdateContent { r: RefId(7), version: vout }),
            (cmd, Step::DoneWithRef { r: RefId(7) }),
            (cmd, Step::Exit { exit: 0 }),
        ])
    })
}

/// S1: a first build with no prior trace runs the root command and records
/// its behavior.
#[test]
fn first_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    let (plan, outcome) = space.build(&mut tracer)?;

    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    assert!(!outcome.failed);
    assert_eq!(tracer.runs, 1);
    assert_eq!(space.read("out")?, "hello\n");

    // The recorded trace holds the command's observed behavior.
    let trace = db::read_trace(&space.path(db::TRACE_FILE)).map_err(anyhow::Error::new)?;
    let names: Vec<&str> = trace.steps.iter().map(|(_, s)| s.name()).collect();
    for expected in ["SpecialRef", "PathRef", "UpdateContent", "Exit"] {
        assert!(names.contains(&expected), "trace is missing {}", expected);
    }
    assert_eq!(trace.commands.get(ROOT).args, vec!["sh", "Buildfile"]);
    assert!(trace.commands.get(ROOT).executed);
    Ok(())
}

/// S2: rebuilding with nothing changed runs no commands at all.
#[test]
fn noop_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    space.build(&mut tracer)?;

    // Second run: the tracer must not be consulted.
    let mut never = NeverTracer;
    let (plan, outcome) = space.build(&mut never)?;
    assert!(plan.is_empty());
    assert_eq!(outcome.traced, 0);
    assert_eq!(space.read("out")?, "hello\n");
    Ok(())
}

/// The no-change fixpoint holds over repeated runs.
#[test]
fn noop_rebuild_is_stable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    space.build(&mut tracer)?;

    for _ in 0..3 {
        let mut never = NeverTracer;
        let (_, outcome) = space.build(&mut never)?;
        assert_eq!(outcome.traced, 0);
    }
    Ok(())
}

/// S3: changing a tracked input reruns the command that read it.
#[test]
fn input_change_reruns_consumer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "tr a-z A-Z < in.txt > out\n")?;
    space.write("in.txt", "one\n")?;

    let mut tracer = ScriptedTracer::new(copy_script(space.dir.path().to_path_buf()));
    let (_, outcome) = space.build(&mut tracer)?;
    assert_eq!(outcome.traced, 1);
    assert_eq!(space.read("out")?, "ONE\n");

    // Unchanged input: emulate.
    let mut never = NeverTracer;
    let (_, outcome) = space.build(&mut never)?;
    assert_eq!(outcome.traced, 0);

    // Changed input: rerun, regenerating the output.
    space.write("in.txt", "two two\n")?;
    let mut tracer = ScriptedTracer::new(copy_script(space.dir.path().to_path_buf()));
    let (plan, outcome) = space.build(&mut tracer)?;
    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    assert_eq!(space.read("out")?, "TWO TWO\n");
    Ok(())
}

/// A script that records a dependency on the listing of data/.
fn list_dir_script(dir: PathBuf) -> Script<'static> {
    Box::new(move |cmd, _commands, env| {
        let mut entries = BTreeMap::new();
        for ent in std::fs::read_dir(dir.join("data"))? {
            entries.insert(ent?.file_name().to_string_lossy().into_owned(), None);
        }
        let vlist = env
            .versions
            .push_content(ContentVersion::Dir(DirListVersion { entries, opaque: true }));
        Ok(vec![
            (
                cmd,
                Step::PathRef {
                    base: CWD_REF,
                    path: "data".into(),
                    flags: AccessFlags::read(),
                    out: RefId(6),
                },
            ),
            (cmd, Step::ExpectResult { scenario: Scenario::Build, r: RefId(6), errno: 0 }),
            (cmd, Step::MatchContent { scenario: Scenario::Build, r: RefId(6), version: vlist }),
            (cmd, Step::DoneWithRef { r: RefId(6) }),
            (cmd, Step::Exit { exit: 0 }),
        ])
    })
}

/// S4: a new sibling file fails the recorded directory-listing match.
#[test]
fn directory_entry_change_reruns() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "ls data\n")?;
    std::fs::create_dir(space.path("data"))?;
    space.write("data/a.txt", "a")?;

    let mut tracer = ScriptedTracer::new(list_dir_script(space.dir.path().to_path_buf()));
    let (_, outcome) = space.build(&mut tracer)?;
    assert_eq!(outcome.traced, 1);

    let mut never = NeverTracer;
    let (_, outcome) = space.build(&mut never)?;
    assert_eq!(outcome.traced, 0);

    // A sibling appears between builds.
    space.write("data/b.txt", "b")?;
    let mut tracer = ScriptedTracer::new(list_dir_script(space.dir.path().to_path_buf()));
    let (plan, outcome) = space.build(&mut tracer)?;
    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    Ok(())
}

fn std_refs() -> Vec<(RefId, RefId)> {
    vec![
        (STDIN_REF, STDIN_REF),
        (STDOUT_REF, STDOUT_REF),
        (STDERR_REF, STDERR_REF),
        (ROOT_REF, ROOT_REF),
        (CWD_REF, CWD_REF),
        (EXE_REF, EXE_REF),
    ]
}

/// A root that pipes a producer into a consumer.
fn pipe_script() -> Script<'static> {
    Box::new(move |root, commands, env| {
        // Reuse recorded children when their content identity matches, the
        // same way a syscall front-end matches commands across runs.
        let probe_a = Command::new(vec!["producer".into()]);
        let a = commands
            .find_matching_child(root, &probe_a.args, &probe_a.initial_fds)
            .unwrap_or_else(|| commands.push(probe_a));
        let probe_b = Command::new(vec!["consumer".into()]);
        let b = commands
            .find_matching_child(root, &probe_b.args, &probe_b.initial_fds)
            .unwrap_or_else(|| commands.push(probe_b));

        let mut a_refs = std_refs();
        a_refs[1] = (RefId(7), STDOUT_REF); // stdout into the pipe
        let mut b_refs = std_refs();
        b_refs[0] = (RefId(6), STDIN_REF); // stdin from the pipe

        let vw = env.versions.push_content(ContentVersion::PipeWrite(PipeWriteVersion {
            writer: Some(a),
            seq: 0,
        }));
        let vr = env.versions.push_content(ContentVersion::PipeRead(PipeReadVersion {
            writer: Some(a),
            seq: 1,
        }));

        Ok(vec![
            (root, Step::PipeRef { read_end: RefId(6), write_end: RefId(7) }),
            (root, Step::Launch { child: a, refs: a_refs }),
            (a, Step::UpdateContent { r: STDOUT_REF, version: vw }),
            (a, Step::Exit { exit: 0 }),
            (root, Step::Join { child: a, exit: 0 }),
            (root, Step::Launch { child: b, refs: b_refs }),
            (b, Step::MatchContent { scenario: Scenario::Build, r: STDIN_REF, version: vr }),
            (b, Step::Exit { exit: 0 }),
            (root, Step::Join { child: b, exit: 0 }),
            (root, Step::Exit { exit: 0 }),
        ])
    })
}

/// S5: a pipe between two commands emulates cleanly on rebuild; neither
/// side starts a process.
#[test]
fn pipe_producer_consumer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "producer | consumer\n")?;

    let mut tracer = ScriptedTracer::new(pipe_script());
    let (_, outcome) = space.build(&mut tracer)?;
    assert_eq!(outcome.traced, 1);
    assert_eq!(tracer.runs, 1);

    // The trace now holds three commands under the launcher.
    let trace = db::read_trace(&space.path(db::TRACE_FILE)).map_err(anyhow::Error::new)?;
    assert_eq!(trace.commands.len(), 4);
    assert_eq!(trace.commands.get(ROOT).children.len(), 2);

    let mut never = NeverTracer;
    let (plan, outcome) = space.build(&mut never)?;
    assert!(plan.is_empty());
    assert_eq!(outcome.traced, 0);
    Ok(())
}

/// S6: a corrupt trace falls back to a full first build.
#[test]
fn corrupt_trace_falls_back() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    space.build(&mut tracer)?;

    // Truncate the trace to four bytes.
    let bytes = std::fs::read(space.path(db::TRACE_FILE))?;
    std::fs::write(space.path(db::TRACE_FILE), &bytes[..4])?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    let (plan, outcome) = space.build(&mut tracer)?;
    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    Ok(())
}

/// Deleting an output between runs is a final-state mismatch; the producer
/// reruns and recreates it.
#[test]
fn deleted_output_is_recreated() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    space.build(&mut tracer)?;
    std::fs::remove_file(space.path("out"))?;

    let mut tracer = ScriptedTracer::new(write_out_script(space.dir.path().to_path_buf()));
    let (plan, outcome) = space.build(&mut tracer)?;
    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    assert_eq!(space.read("out")?, "hello\n");
    Ok(())
}

/// A command that failed last run is retried.
#[test]
fn failed_command_is_retried() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "exit 1\n")?;

    let fail_script: Script<'static> =
        Box::new(move |cmd, _commands, _env| Ok(vec![(cmd, Step::Exit { exit: 1 })]));
    let mut tracer = ScriptedTracer::new(fail_script);
    let (_, outcome) = space.build(&mut tracer)?;
    assert!(outcome.failed);

    let retry_script: Script<'static> =
        Box::new(move |cmd, _commands, _env| Ok(vec![(cmd, Step::Exit { exit: 0 })]));
    let mut tracer = ScriptedTracer::new(retry_script);
    let (plan, outcome) = space.build(&mut tracer)?;
    assert!(plan.must_run(ROOT));
    assert_eq!(outcome.traced, 1);
    assert!(!outcome.failed);
    Ok(())
}
