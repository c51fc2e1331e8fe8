//! Passive consumers of build events.
//!
//! The engine reports everything it learns through this interface: inputs,
//! outputs, mismatched predicates, and final-state divergence.  The rebuild
//! planner is just one observer among others; the engine itself never acts
//! on what the observers conclude.

use crate::artifact::ArtifactId;
use crate::ir::{CommandId, Step};
use crate::version::{ContentVersionId, MetadataVersionId};

/// A version of either flavor, for events that can carry both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyVersion {
    Content(ContentVersionId),
    Metadata(MetadataVersionId),
}

/// How a command consumed an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// The artifact was consulted while resolving a path.
    Resolution,
    Metadata,
    Content,
}

/// Callbacks fired as the engine works through a trace.  Observers are
/// notified in registration order and must treat everything they receive
/// as read-only.
pub trait BuildObserver {
    /// A command in the trace has never actually executed.
    fn command_never_run(&mut self, _cmd: CommandId) {}

    /// A parent launched (or re-launched) a child.
    fn launch(&mut self, _parent: CommandId, _child: CommandId) {}

    /// A command observed a version of an artifact.
    fn input(&mut self, _cmd: CommandId, _artifact: ArtifactId, _version: Option<AnyVersion>, _kind: InputKind) {
    }

    /// A command produced a new version of an artifact.
    fn output(&mut self, _cmd: CommandId, _artifact: ArtifactId, _version: AnyVersion) {}

    /// A recorded predicate did not hold against the current environment.
    fn mismatch(
        &mut self,
        _cmd: CommandId,
        _artifact: ArtifactId,
        _observed: Option<AnyVersion>,
        _expected: AnyVersion,
    ) {
    }

    /// A recorded step would behave differently in the current environment
    /// (reference resolution, comparison, or child exit status changed).
    fn command_change(&mut self, _cmd: CommandId, _step: &Step) {}

    /// The version an artifact ended the build with does not match the
    /// filesystem.
    fn final_mismatch(
        &mut self,
        _artifact: ArtifactId,
        _produced: AnyVersion,
        _ondisk: Option<AnyVersion>,
    ) {
    }
}
