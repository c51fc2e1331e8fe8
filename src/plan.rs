//! The rebuild planner: decides which commands must re-execute and which
//! can be emulated from their recorded steps.
//!
//! The planner watches one full emulation pass as an observer, then
//! computes a plan for the next pass.  It is deliberately conservative:
//! whenever it cannot prove a command's recorded behavior still holds, the
//! command runs.

use std::collections::{HashMap, HashSet};

use crate::artifact::ArtifactId;
use crate::canon;
use crate::env::Env;
use crate::ir::{CommandId, Step, LAUNCHER};
use crate::observer::{AnyVersion, BuildObserver, InputKind};

/// The planner's verdict, consumed by the next engine pass.
#[derive(Debug, Clone, Default)]
pub struct RebuildPlan {
    must_run: HashSet<CommandId>,
}

impl RebuildPlan {
    pub fn new() -> RebuildPlan {
        RebuildPlan::default()
    }

    pub fn mark(&mut self, cmd: CommandId) -> bool {
        self.must_run.insert(cmd)
    }

    pub fn must_run(&self, cmd: CommandId) -> bool {
        self.must_run.contains(&cmd)
    }

    pub fn len(&self) -> usize {
        self.must_run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.must_run.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = CommandId> + '_ {
        self.must_run.iter().copied()
    }
}

/// Observer that accumulates the evidence for a rebuild plan.
#[derive(Debug, Default)]
pub struct RebuildPlanner {
    never_run: HashSet<CommandId>,
    /// Commands with a failed predicate, and the artifact that failed it.
    mismatched: Vec<(CommandId, Option<ArtifactId>)>,
    writers: HashMap<ArtifactId, HashSet<CommandId>>,
    consumers: HashMap<ArtifactId, HashSet<CommandId>>,
    final_mismatches: HashSet<ArtifactId>,
}

impl RebuildPlanner {
    pub fn new() -> RebuildPlanner {
        RebuildPlanner::default()
    }

    /// Build the plan from everything observed, iterating the
    /// producer-to-consumer rule to a fixpoint.  `changed` and `unchanged`
    /// are explicit user hints, as paths relative to the working directory.
    pub fn make_plan(&self, env: &mut Env, changed: &[String], unchanged: &[String]) -> RebuildPlan {
        let unchanged: HashSet<String> = unchanged.iter().map(|p| self.hint_path(env, p)).collect();

        let mut plan = RebuildPlan::new();

        for &cmd in &self.never_run {
            plan.mark(cmd);
        }

        for (cmd, artifact) in &self.mismatched {
            // An explicit --unchanged hint suppresses mismatches on that
            // path.
            if let Some(a) = artifact {
                if let Some(path) = &env.artifact(*a).path {
                    if unchanged.contains(path) {
                        continue;
                    }
                }
            }
            plan.mark(*cmd);
        }

        // Explicitly-changed paths invalidate every consumer of the
        // artifact, fingerprints notwithstanding.
        for hint in changed {
            let path = self.hint_path(env, hint);
            if let Some(id) = env.get_path(&path) {
                if let Some(consumers) = self.consumers.get(&id) {
                    for &c in consumers {
                        plan.mark(c);
                    }
                }
            }
        }

        // A final-state mismatch means the producer must recreate its
        // output.
        for artifact in &self.final_mismatches {
            if let Some(writers) = self.writers.get(artifact) {
                for &w in writers {
                    plan.mark(w);
                }
            }
        }

        plan.must_run.remove(&LAUNCHER);

        // Fixpoint: consumers of a must-run producer's outputs must run
        // too, since we cannot assume the rerun reproduces the same
        // versions.
        loop {
            let mut grew = false;
            for (artifact, writers) in &self.writers {
                if !writers.iter().any(|w| plan.must_run(*w)) {
                    continue;
                }
                if let Some(consumers) = self.consumers.get(artifact) {
                    for &c in consumers {
                        if c != LAUNCHER && plan.mark(c) {
                            grew = true;
                        }
                    }
                }
            }
            if !grew {
                break;
            }
        }

        plan
    }

    fn hint_path(&self, env: &Env, hint: &str) -> String {
        if canon::is_absolute(hint) {
            canon::normalize(hint)
        } else {
            canon::normalize(&format!("{}/{}", env.cwd_path(), hint))
        }
    }
}

impl BuildObserver for RebuildPlanner {
    fn command_never_run(&mut self, cmd: CommandId) {
        self.never_run.insert(cmd);
    }

    fn input(&mut self, cmd: CommandId, artifact: ArtifactId, _version: Option<AnyVersion>, _kind: InputKind) {
        self.consumers.entry(artifact).or_default().insert(cmd);
    }

    fn output(&mut self, cmd: CommandId, artifact: ArtifactId, _version: AnyVersion) {
        self.writers.entry(artifact).or_default().insert(cmd);
    }

    fn mismatch(
        &mut self,
        cmd: CommandId,
        artifact: ArtifactId,
        _observed: Option<AnyVersion>,
        _expected: AnyVersion,
    ) {
        self.mismatched.push((cmd, Some(artifact)));
    }

    fn command_change(&mut self, cmd: CommandId, _step: &Step) {
        self.mismatched.push((cmd, None));
    }

    fn final_mismatch(
        &mut self,
        artifact: ArtifactId,
        _produced: AnyVersion,
        _ondisk: Option<AnyVersion>,
    ) {
        self.final_mismatches.insert(artifact);
    }
}
