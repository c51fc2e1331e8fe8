//! Terminal detection for output coloring.

/// Color output only when stderr is a terminal and TERM is set to
/// something that plausibly supports it.
pub fn use_color() -> bool {
    let tty = unsafe { libc::isatty(/* stderr */ 2) == 1 };
    if !tty {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}
