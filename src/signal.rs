//! SIGINT handling for the engine loop.
//!
//! The handler only flips a flag; the engine polls it between steps so a
//! build stops at a step boundary, after the traced children have already
//! received the same SIGINT from the terminal and had their exits
//! recorded.

use std::sync::atomic::{AtomicBool, Ordering};

static PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    PENDING.store(true, Ordering::Relaxed);
}

/// Install the SIGINT handler.  One-shot: a second SIGINT reverts to the
/// default disposition and kills the process on the spot.
pub fn register_sigint() {
    // Safety: plain libc calls; the handler body is async-signal-safe
    // (a single atomic store).
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = on_sigint as libc::sighandler_t;
        action.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

pub fn was_interrupted() -> bool {
    PENDING.load(Ordering::Relaxed)
}
