pub mod artifact;
pub mod buffer;
pub mod canon;
pub mod db;
pub mod densemap;
pub mod engine;
pub mod env;
pub mod ir;
pub mod observer;
pub mod plan;
pub mod progress;
pub mod resolve;
pub mod run;
pub mod signal;
pub mod smallmap;
mod terminal;
pub mod tracer;
pub mod version;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
