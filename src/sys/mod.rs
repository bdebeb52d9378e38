use std::ffi::c_void;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub(crate) use unix::{Context, RawContext};
    } else if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::{Context, RawContext};
    } else {
        compile_error!("no execution context backend for this platform");
    }
}

/// Entry point invoked, once, when an allocated context is first switched
/// into. The opaque argument is the owning coroutine.
pub(crate) type Entry = unsafe extern "C" fn(*mut c_void);
