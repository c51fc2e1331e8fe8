//! Build progress reporting: a console observer and running counts.

use crate::artifact::ArtifactId;
use crate::env::Env;
use crate::ir::{CommandId, Commands, Step, LAUNCHER};
use crate::observer::{AnyVersion, BuildObserver, InputKind};
use crate::terminal;

/// Observer that narrates the build to the console and tallies statistics.
pub struct ConsoleReporter {
    /// 0 = quiet, 1 = -v, 2 = -vv, 3 = -vvv.
    verbosity: u8,
    color: bool,
    pub commands_seen: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub mismatches: usize,
    pub final_mismatches: usize,
}

impl ConsoleReporter {
    pub fn new(verbosity: u8) -> ConsoleReporter {
        ConsoleReporter {
            verbosity,
            color: terminal::use_color(),
            commands_seen: 0,
            inputs: 0,
            outputs: 0,
            mismatches: 0,
            final_mismatches: 0,
        }
    }

    fn note(&self, level: u8, msg: &str) {
        if self.verbosity >= level {
            if self.color {
                eprintln!("\x1b[2mretrace: {}\x1b[0m", msg);
            } else {
                eprintln!("retrace: {}", msg);
            }
        }
    }

    /// One-line totals, printed at -v.
    pub fn summarize(&self) {
        self.note(
            1,
            &format!(
                "{} commands, {} inputs, {} outputs, {} mismatches",
                self.commands_seen, self.inputs, self.outputs, self.mismatches
            ),
        );
    }
}

impl BuildObserver for ConsoleReporter {
    fn command_never_run(&mut self, cmd: CommandId) {
        self.note(2, &format!("command {} has never run", cmd));
    }

    fn launch(&mut self, _parent: CommandId, _child: CommandId) {
        self.commands_seen += 1;
    }

    fn input(&mut self, _cmd: CommandId, _artifact: ArtifactId, _version: Option<AnyVersion>, _kind: InputKind) {
        self.inputs += 1;
    }

    fn output(&mut self, _cmd: CommandId, _artifact: ArtifactId, _version: AnyVersion) {
        self.outputs += 1;
    }

    fn mismatch(
        &mut self,
        cmd: CommandId,
        artifact: ArtifactId,
        _observed: Option<AnyVersion>,
        _expected: AnyVersion,
    ) {
        self.mismatches += 1;
        self.note(2, &format!("command {} saw artifact {} change", cmd, artifact));
    }

    fn command_change(&mut self, cmd: CommandId, step: &Step) {
        self.mismatches += 1;
        self.note(2, &format!("command {} diverges at {}", cmd, step.name()));
    }

    fn final_mismatch(
        &mut self,
        artifact: ArtifactId,
        _produced: AnyVersion,
        _ondisk: Option<AnyVersion>,
    ) {
        self.final_mismatches += 1;
        self.note(2, &format!("artifact {} does not match the filesystem", artifact));
    }
}

/// Print the command tree left behind by a build, indented by depth.
/// This is the text form behind --visualize.
pub fn print_command_tree(commands: &Commands, env: &Env, show_system_files: bool) {
    fn visit(commands: &Commands, cmd: CommandId, depth: usize) {
        let c = commands.get(cmd);
        let status = match c.exit_status {
            Some(0) => String::new(),
            Some(n) => format!(" [exit {}]", n),
            None => " [never ran]".to_string(),
        };
        println!("{}{}{}", "  ".repeat(depth), c.short_name(60), status);
        for &child in &c.children {
            visit(commands, child, depth + 1);
        }
    }

    let root = commands.get(LAUNCHER).children.first().copied();
    if let Some(root) = root {
        visit(commands, root, 0);
    }

    if show_system_files {
        for (path, _) in env.path_bindings() {
            println!("  . {}", path);
        }
    }
}
