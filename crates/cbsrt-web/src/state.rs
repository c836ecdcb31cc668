//! Shared application state, global statics, and memory management.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Purges dirty pages from every jemalloc arena, returning them to the OS.
/// Called after a run is torn down.
#[cfg(not(target_env = "msvc"))]
pub(crate) fn release_memory_to_os() {
    unsafe {
        // MALLCTL_ARENAS_ALL = 4096; tokio worker threads each own an arena.
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
pub(crate) fn release_memory_to_os() {}

#[cfg(not(target_env = "msvc"))]
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use axum::extract::State;

use crate::session::Session;

pub(crate) type SharedSession = Arc<Session>;

pub(crate) type AppState = State<SharedSession>;

pub(crate) static SSE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
