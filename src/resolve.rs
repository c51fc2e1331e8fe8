//! Reference resolution: turning (base, path, flags) into an artifact or an
//! errno, honoring the open(2) semantics the build cares about.
//!
//! Resolution is purely a function of the environment, which makes it
//! replayable: emulating a recorded PathRef against an unchanged
//! environment must produce the recorded outcome.

use crate::artifact::{ArtifactId, ArtifactKind, EntryLookup};
use crate::canon::{self, Component};
use crate::env::Env;
use crate::ir::{AccessFlags, CommandId};

/// Symlink hop limit, mirroring the kernel's.
const MAX_SYMLINK_HOPS: u32 = 40;

/// The outcome of resolving a path reference.
#[derive(Debug)]
pub struct Resolution {
    pub result: Result<ArtifactId, i32>,
    /// True when O_CREAT actually created the artifact.
    pub created: bool,
    /// Directories whose listings were consulted along the way; each is an
    /// input of the resolving command.
    pub dirs: Vec<ArtifactId>,
}

impl Resolution {
    fn err(errno: i32, dirs: Vec<ArtifactId>) -> Resolution {
        Resolution { result: Err(errno), created: false, dirs }
    }

    /// The errno view of this resolution: 0 on success.
    pub fn errno(&self) -> i32 {
        match self.result {
            Ok(_) => 0,
            Err(e) => e,
        }
    }
}

/// Resolve `path` relative to the artifact `base` on behalf of `cmd`.
pub fn resolve(
    env: &mut Env,
    cmd: CommandId,
    base: ArtifactId,
    path: &str,
    flags: AccessFlags,
) -> Resolution {
    let mut hops = 0;
    resolve_inner(env, cmd, base, path, flags, &mut hops)
}

fn resolve_inner(
    env: &mut Env,
    cmd: CommandId,
    base: ArtifactId,
    path: &str,
    flags: AccessFlags,
    hops: &mut u32,
) -> Resolution {
    let mut dirs = Vec::new();
    let start = if canon::is_absolute(path) { env.root_dir() } else { base };
    let comps = canon::components(path);

    let mut cur = start;
    let mut cur_path: Option<String> = env.artifact(cur).path.clone();

    if comps.is_empty() {
        // "." or "/": the reference names the base itself.
        return match final_checks(env, cur, flags) {
            Ok(()) => Resolution { result: Ok(cur), created: false, dirs },
            Err(errno) => Resolution::err(errno, dirs),
        };
    }

    for (i, comp) in comps.iter().enumerate() {
        let last = i == comps.len() - 1;

        // Every step starts from a searchable directory.
        if !env.artifact(cur).is_dir() {
            return Resolution::err(libc::ENOTDIR, dirs);
        }
        if let Some(meta) = env.artifact(cur).metadata.current() {
            if !env.versions.metadata(meta).allows(false, false, true, env.euid(), env.egid()) {
                return Resolution::err(libc::EACCES, dirs);
            }
        }
        if !dirs.contains(&cur) {
            dirs.push(cur);
        }

        let name = match comp {
            Component::Up => {
                match cur_path.as_deref() {
                    Some(p) => {
                        let parent = canon::parent(p).to_string();
                        match env.get_path(&parent) {
                            Some(id) => {
                                cur = id;
                                cur_path = Some(parent);
                            }
                            None => return Resolution::err(libc::ENOENT, dirs),
                        }
                    }
                    // An anonymous directory has no parent to walk up to.
                    None => return Resolution::err(libc::ENOENT, dirs),
                }
                continue;
            }
            Component::Name(name) => *name,
        };

        let child_path = cur_path.as_deref().map(|p| canon::join(p, name));
        let child = lookup_child(env, cur, name, child_path.as_deref());

        match child {
            Some(child) => {
                if last {
                    if flags.create && flags.exclusive {
                        return Resolution::err(libc::EEXIST, dirs);
                    }
                    // A symlink in final position is followed unless the
                    // reference asked for the link itself.
                    if let ArtifactKind::Symlink(s) = &env.artifact(child).kind {
                        if !flags.nofollow {
                            *hops += 1;
                            if *hops > MAX_SYMLINK_HOPS {
                                return Resolution::err(libc::ELOOP, dirs);
                            }
                            let target = s.target.clone();
                            let mut sub = resolve_inner(env, cmd, cur, &target, flags, hops);
                            dirs.append(&mut sub.dirs);
                            return Resolution { dirs, ..sub };
                        }
                    }
                    return match final_checks(env, child, flags) {
                        Ok(()) => Resolution { result: Ok(child), created: false, dirs },
                        Err(errno) => Resolution::err(errno, dirs),
                    };
                }
                // Intermediate symlinks are always followed.
                if let ArtifactKind::Symlink(s) = &env.artifact(child).kind {
                    *hops += 1;
                    if *hops > MAX_SYMLINK_HOPS {
                        return Resolution::err(libc::ELOOP, dirs);
                    }
                    let target = s.target.clone();
                    let sub = resolve_inner(
                        env,
                        cmd,
                        cur,
                        &target,
                        AccessFlags { x: true, ..AccessFlags::default() },
                        hops,
                    );
                    dirs.extend(sub.dirs);
                    match sub.result {
                        Ok(id) => {
                            cur = id;
                            cur_path = env.artifact(id).path.clone();
                        }
                        Err(errno) => return Resolution::err(errno, dirs),
                    }
                    continue;
                }
                cur = child;
                cur_path = child_path;
            }
            None => {
                if last && flags.create {
                    // Creating requires write permission in the directory.
                    if let Some(meta) = env.artifact(cur).metadata.current() {
                        if !env.versions.metadata(meta).allows(
                            false,
                            true,
                            false,
                            env.euid(),
                            env.egid(),
                        ) {
                            return Resolution::err(libc::EACCES, dirs);
                        }
                    }
                    let created = env.create_file(flags.mode);
                    env.artifact_mut(cur).add_entry(cmd, name, created, false);
                    if let Some(p) = &child_path {
                        env.install(p, created);
                    }
                    return Resolution { result: Ok(created), created: true, dirs };
                }
                return Resolution::err(libc::ENOENT, dirs);
            }
        }
    }

    // Only reachable when the path ended in "..".
    match final_checks(env, cur, flags) {
        Ok(()) => Resolution { result: Ok(cur), created: false, dirs },
        Err(errno) => Resolution::err(errno, dirs),
    }
}

fn lookup_child(
    env: &mut Env,
    dir: ArtifactId,
    name: &str,
    child_path: Option<&str>,
) -> Option<ArtifactId> {
    match env.artifact(dir).dir_entry(name) {
        EntryLookup::Present(id) => Some(id),
        EntryLookup::Removed => None,
        EntryLookup::Unknown => {
            // Fall through to the opaque filesystem baseline.
            child_path.and_then(|p| env.get_path(p))
        }
    }
}

/// Permission and kind checks against the finally-resolved artifact.
fn final_checks(env: &Env, id: ArtifactId, flags: AccessFlags) -> Result<(), i32> {
    let artifact = env.artifact(id);
    if flags.w && artifact.is_dir() {
        return Err(libc::EISDIR);
    }
    if let Some(meta) = artifact.metadata.current() {
        let v = env.versions.metadata(meta);
        if !v.allows(flags.r, flags.w, flags.x, env.euid(), env.egid()) {
            return Err(libc::EACCES);
        }
    }
    Ok(())
}
