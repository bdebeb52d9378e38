use std::ffi::c_void;
use std::io::{Error, Result};

use super::Entry;
use crate::stack::Stack;

pub(crate) type RawContext = *mut libc::ucontext_t;

struct EntryParam {
    entry: Entry,
    arg: *mut c_void,
}

// `makecontext` only forwards integer arguments; the parameter pointer
// rides in as two halves.
unsafe extern "C" fn context_entry(hi: libc::c_uint, lo: libc::c_uint) {
    let addr = ((hi as u64) << 32) | (lo as u64);
    let param = &*(addr as usize as *const EntryParam);
    (param.entry)(param.arg)
}

/// One POSIX execution context: a `ucontext_t` plus, for the allocated
/// variant, the stack and trampoline argument it runs on.
pub(crate) struct Context {
    ucp: Box<libc::ucontext_t>,
    #[allow(dead_code)]
    allocated: Option<(Stack, Box<EntryParam>)>,
}

impl Context {
    pub fn new(entry: Entry, arg: *mut c_void, stack_size: usize) -> Result<Context> {
        let stack = Stack::allocate(stack_size)?;
        let param = Box::new(EntryParam { entry, arg });
        let mut ucp: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { libc::getcontext(ucp.as_mut()) } != 0 {
            return Err(Error::last_os_error());
        }
        ucp.uc_stack.ss_sp = stack.base() as *mut libc::c_void;
        ucp.uc_stack.ss_size = stack.size();
        ucp.uc_stack.ss_flags = 0;
        // Nothing to run after the entry returns: falling off the end of
        // the last coroutine ends the thread.
        ucp.uc_link = std::ptr::null_mut();

        let addr = param.as_ref() as *const EntryParam as usize as u64;
        unsafe {
            let f: unsafe extern "C" fn(libc::c_uint, libc::c_uint) = context_entry;
            let f = std::mem::transmute::<_, extern "C" fn()>(f);
            libc::makecontext(
                ucp.as_mut(),
                f,
                2,
                (addr >> 32) as libc::c_uint,
                addr as libc::c_uint,
            );
        }
        Ok(Context {
            ucp,
            allocated: Some((stack, param)),
        })
    }

    /// Adopted variant for the thread's native stack: plain storage that
    /// the first swap out of this thread fills in.
    pub fn adopt_current_thread() -> Result<Context> {
        Ok(Context {
            ucp: Box::new(unsafe { std::mem::zeroed() }),
            allocated: None,
        })
    }

    #[inline(always)]
    pub fn raw(&self) -> RawContext {
        (self.ucp.as_ref() as *const libc::ucontext_t).cast_mut()
    }

    /// Suspends the caller and runs `to`; comes back only when something
    /// later switches to `from`. No borrows may be held across this call.
    pub unsafe fn switch(from: RawContext, to: RawContext) {
        if libc::swapcontext(from, to) != 0 {
            log::error!("swapcontext failed: {:?}", Error::last_os_error());
        }
    }
}
