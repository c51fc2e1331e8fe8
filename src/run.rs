//! Command-line entry point: load the previous trace (or synthesize the
//! default one), run a planning pass, then execute and record a new trace.

use std::path::Path;

use anyhow::bail;

use crate::db::{self, NullSink, Trace, TraceWriter};
use crate::engine::Engine;
use crate::env::Env;
use crate::plan::{RebuildPlan, RebuildPlanner};
use crate::progress::{print_command_tree, ConsoleReporter};
use crate::signal;
use crate::tracer::{shell_escape, NeverTracer, ProcessTracer};
use crate::version::{BlobCache, FingerprintLevel};

#[derive(argh::FromArgs)]
/// retrace, an incremental build tool that traces commands to learn what
/// they read and write
struct Opts {
    /// increase verbosity (repeatable)
    #[argh(switch, short = 'v')]
    verbose: u8,

    /// fingerprint policy: none, local, or all [default=local]
    #[argh(option, default = "String::from(\"local\")")]
    fingerprint: String,

    /// treat a path as changed regardless of its fingerprint (repeatable)
    #[argh(option)]
    changed: Vec<String>,

    /// treat a path as unchanged regardless of its fingerprint (repeatable)
    #[argh(option)]
    unchanged: Vec<String>,

    /// plan only: print what would run, execute nothing
    #[argh(switch)]
    dry_run: bool,

    /// maximum concurrent commands [default=1]
    #[argh(option, short = 'j', default = "1")]
    parallelism: usize,

    /// print the command tree after the build
    #[argh(switch)]
    visualize: bool,

    /// include system files in the visualization
    #[argh(switch)]
    show_system_files: bool,

    /// path to the root build script [default=Buildfile]
    #[argh(positional, default = "String::from(\"Buildfile\")")]
    build_script: String,
}

fn fingerprint_level(name: &str) -> anyhow::Result<FingerprintLevel> {
    Ok(match name {
        "none" => FingerprintLevel::None,
        "local" => FingerprintLevel::Local,
        "all" => FingerprintLevel::All,
        _ => bail!("--fingerprint must be one of: none, local, all"),
    })
}

/// Load the saved trace, falling back to the default trace when there is
/// none or it cannot be used.
fn load_trace(build_script: &str) -> Trace {
    match db::read_trace(Path::new(db::TRACE_FILE)) {
        Ok(trace) => trace,
        Err(db::TraceError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Trace::default_trace(build_script)
        }
        Err(err) => {
            eprintln!("retrace: {}; running a full build", err);
            Trace::default_trace(build_script)
        }
    }
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();
    let fingerprint = fingerprint_level(&opts.fingerprint)?;
    if opts.parallelism < 1 {
        bail!("-j must be at least 1");
    }

    signal::register_sigint();

    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();

    // A temp trace left over from an interrupted build.
    let _ = std::fs::remove_file(db::TRACE_TEMP_FILE);

    let trace = load_trace(&opts.build_script);

    // Planning pass: emulate everything, let the planner watch.
    let mut planner = RebuildPlanner::new();
    let plan = {
        let Trace { commands, versions, steps } = trace.clone();
        let env = Env::new(versions, cwd.clone(), fingerprint);
        let mut tracer = NeverTracer;
        let mut sink = NullSink;
        let mut engine = Engine::new(
            commands,
            steps,
            env,
            RebuildPlan::new(),
            BlobCache::new(db::CACHE_DIR),
            &mut tracer,
            &mut sink,
            false,
        );
        engine.add_observer(&mut planner);
        engine.run()?;
        let (_commands, mut env) = engine.into_parts();
        planner.make_plan(&mut env, &opts.changed, &opts.unchanged)
    };

    if opts.dry_run {
        if plan.is_empty() {
            println!("retrace: no work to do");
        } else {
            let mut lines: Vec<String> = plan
                .commands()
                .map(|cmd| shell_escape(&trace.commands.get(cmd).args))
                .collect();
            lines.sort();
            for line in lines {
                println!("would run: {}", line);
            }
        }
        return Ok(0);
    }

    // Execution pass: emulate what we can, trace the rest, record it all.
    let Trace { commands, versions, steps } = trace;
    let env = Env::new(versions, cwd, fingerprint);
    let mut writer = TraceWriter::create(Path::new("."))?;
    let mut tracer = ProcessTracer::new(true);
    let mut console = ConsoleReporter::new(opts.verbose);

    let outcome = {
        let mut engine = Engine::new(
            commands,
            steps,
            env,
            plan,
            BlobCache::new(db::CACHE_DIR),
            &mut tracer,
            &mut writer,
            true,
        );
        engine.add_observer(&mut console);
        let outcome = engine.run()?;
        let (commands, env) = engine.into_parts();
        if opts.visualize {
            print_command_tree(&commands, &env, opts.show_system_files);
        }
        outcome
    };
    console.summarize();

    if outcome.failed {
        return Ok(1);
    }
    match outcome.traced {
        0 => println!("retrace: no work to do"),
        n => println!(
            "retrace: ran {} command{}, now up to date",
            n,
            if n == 1 { "" } else { "s" }
        ),
    }
    Ok(0)
}

pub fn run() -> anyhow::Result<i32> {
    run_impl()
}
