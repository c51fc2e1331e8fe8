//! The contract between the engine and the tracing front-end, plus the
//! process launcher used to re-execute commands.
//!
//! A full front-end intercepts the command's syscalls and reports rich IR.
//! That machinery lives outside this crate; what the engine requires is
//! only this interface.  The built-in `ProcessTracer` runs the command for
//! real without interception and reports just the exit status, leaving the
//! engine to refresh the command's previously recorded steps against the
//! disk.

use anyhow::bail;

use crate::env::Env;
use crate::ir::{CommandId, Commands, Step};

/// What a tracer learned from running a command.
pub enum TracerOutput {
    /// Full IR observed through syscall interception, ending with the
    /// command's Exit.  May include steps of discovered child commands.
    Steps(Vec<(CommandId, Step)>),
    /// The command ran without interception; only its exit status is
    /// known.
    ExitStatus(i32),
}

/// Executes commands that the plan says cannot be emulated.
pub trait Tracer {
    fn trace(
        &mut self,
        cmd: CommandId,
        commands: &mut Commands,
        env: &mut Env,
    ) -> anyhow::Result<TracerOutput>;
}

/// Used in passes that must not execute anything; the plan is empty, so a
/// call is an engine bug.
pub struct NeverTracer;

impl Tracer for NeverTracer {
    fn trace(
        &mut self,
        cmd: CommandId,
        _commands: &mut Commands,
        _env: &mut Env,
    ) -> anyhow::Result<TracerOutput> {
        bail!("command {} must run, but execution is disabled in this pass", cmd);
    }
}

/// Runs commands as real subprocesses, inheriting the build's stdio.
pub struct ProcessTracer {
    /// Echo command lines before running them.
    pub echo: bool,
}

impl ProcessTracer {
    pub fn new(echo: bool) -> ProcessTracer {
        ProcessTracer { echo }
    }
}

impl Tracer for ProcessTracer {
    fn trace(
        &mut self,
        cmd: CommandId,
        commands: &mut Commands,
        _env: &mut Env,
    ) -> anyhow::Result<TracerOutput> {
        let args = commands.get(cmd).args.clone();
        if self.echo {
            println!("{}", shell_escape(&args));
        }
        let status = run_command(&args)?;
        Ok(TracerOutput::ExitStatus(status))
    }
}

/// Render argv the way a user could paste it back into a shell.
pub fn shell_escape(args: &[String]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let plain = !arg.is_empty()
            && arg
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'='));
        if plain {
            out.push_str(arg);
        } else {
            out.push('\'');
            out.push_str(&arg.replace('\'', "'\\''"));
            out.push('\'');
        }
    }
    out
}

extern "C" {
    static environ: *mut *mut libc::c_char;
}

fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret != 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_string_lossy());
    }
    Ok(())
}

/// Spawn argv with PATH lookup and wait for it.  The exit status is the
/// process's exit code, or -signal when it was killed.
fn run_command(args: &[String]) -> anyhow::Result<i32> {
    use std::ffi::CString;

    if args.is_empty() {
        bail!("cannot run a command with no arguments");
    }

    let cargs: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| anyhow::anyhow!("nul byte in argument")))
        .collect::<anyhow::Result<_>>()?;
    let mut argv: Vec<*mut libc::c_char> =
        cargs.iter().map(|c| c.as_ptr() as *mut libc::c_char).collect();
    argv.push(std::ptr::null_mut());

    let mut pid: libc::pid_t = 0;
    // Safety: argv outlives the spawn call; posix_spawnp copies it into the
    // child before returning.
    unsafe {
        check_posix(
            "posix_spawnp",
            libc::posix_spawnp(
                &mut pid,
                cargs[0].as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                argv.as_ptr(),
                environ,
            ),
        )?;
    }

    let mut status: libc::c_int = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    if ret < 0 {
        bail!("waitpid: {}", std::io::Error::last_os_error());
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(-libc::WTERMSIG(status))
    } else {
        bail!("child {} stopped in an unexpected way: {:#x}", pid, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_plain_and_quoted() {
        let args = vec!["cc".to_string(), "-o".to_string(), "out file".to_string()];
        assert_eq!(shell_escape(&args), "cc -o 'out file'");
    }

    #[test]
    fn shell_escape_single_quote() {
        let args = vec!["echo".to_string(), "it's".to_string()];
        assert_eq!(shell_escape(&args), "echo 'it'\\''s'");
    }

    #[test]
    fn run_command_reports_exit_status() -> anyhow::Result<()> {
        assert_eq!(run_command(&["true".to_string()])?, 0);
        assert_ne!(run_command(&["false".to_string()])?, 0);
        Ok(())
    }

    #[test]
    fn run_command_missing_program() {
        // posix_spawnp reports a missing program either at spawn time or
        // through a 127 exit, depending on the platform.
        match run_command(&["retrace-no-such-program".to_string()]) {
            Ok(status) => assert_ne!(status, 0),
            Err(_) => {}
        }
    }
}
