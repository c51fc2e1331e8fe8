//! Integration test.  Runs the retrace binary against a temp directory.
//!
//! Without a syscall-interception front-end the binary cannot discover
//! fine-grained dependencies, but the whole-build behaviors still hold:
//! first builds run, clean rebuilds don't, corrupt traces fall back.

fn retrace_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("retrace")
        .to_path_buf()
}

fn retrace_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(retrace_binary());
    cmd.args(args);
    cmd
}

fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = std::str::from_utf8(&out.stdout).unwrap();
    if !stdout.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?}, got:\n{}",
            text, stdout
        );
    }
}

/// Manages a temporary directory for invoking retrace.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    fn write_bytes(&self, path: &str, content: &[u8]) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    /// Invoke retrace, returning process output.
    fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }
}

#[test]
fn first_build_then_noop() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(out.status.success());
    assert_output_contains(&out, "ran 1 command");
    assert_eq!(space.read("out")?, b"hello\n");

    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(out.status.success());
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn corrupt_trace_reverts_to_full_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hi > out\n")?;

    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(out.status.success());

    // Truncate the saved trace to 4 bytes.
    let trace = space.read(".retrace")?;
    space.write_bytes(".retrace", &trace[..4])?;

    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(out.status.success());
    assert_output_contains(&out, "ran 1 command");
    Ok(())
}

#[test]
fn failing_command_fails_the_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "exit 3\n")?;

    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(!out.status.success());
    Ok(())
}

#[test]
fn dry_run_executes_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "echo hello > out\n")?;

    let out = space.run(&mut retrace_command(vec!["--dry-run"]))?;
    assert!(out.status.success());
    assert_output_contains(&out, "would run: sh Buildfile");
    assert!(space.read("out").is_err());
    Ok(())
}

#[test]
fn unknown_option_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("Buildfile", "true\n")?;

    let out = space.run(&mut retrace_command(vec!["--no-such-flag"]))?;
    assert!(!out.status.success());
    Ok(())
}

#[test]
fn missing_build_script_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // No Buildfile at all: sh reports the missing script.
    let out = space.run(&mut retrace_command(vec![]))?;
    assert!(!out.status.success());
    Ok(())
}
