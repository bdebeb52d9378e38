use std::ffi::c_void;
use std::io::{Error, Result};

use windows_sys::Win32::System::Threading::{
    ConvertFiberToThread, ConvertThreadToFiberEx, CreateFiberEx, DeleteFiber, IsThreadAFiber,
    SwitchToFiber,
};

use super::Entry;

pub(crate) type RawContext = *mut c_void;

const FIBER_COMMIT_SIZE: usize = 4096;

struct EntryParam {
    entry: Entry,
    arg: *mut c_void,
}

enum Kind {
    /// Owns its stack and the trampoline argument.
    Allocated(#[allow(dead_code)] Box<EntryParam>),
    /// The thread's native stack; `converted` when this crate made the
    /// ConvertThreadToFiberEx call and must undo it.
    Adopted { converted: bool },
}

unsafe extern "system" fn fiber_entry(param: *mut c_void) {
    let param = &*(param as *const EntryParam);
    (param.entry)(param.arg)
}

/// One Windows execution context, backed by a fiber.
pub(crate) struct Context {
    fiber: *mut c_void,
    kind: Kind,
}

impl Context {
    pub fn new(entry: Entry, arg: *mut c_void, stack_size: usize) -> Result<Context> {
        let param = Box::new(EntryParam { entry, arg });
        let fiber = unsafe {
            CreateFiberEx(
                FIBER_COMMIT_SIZE,
                stack_size,
                0,
                Some(fiber_entry),
                param.as_ref() as *const EntryParam as *const c_void,
            )
        };
        if fiber.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Context {
            fiber,
            kind: Kind::Allocated(param),
        })
    }

    /// Adopted variant for the thread's native stack. Tolerates a thread
    /// that some outer layer already converted.
    pub fn adopt_current_thread() -> Result<Context> {
        if unsafe { IsThreadAFiber() } != 0 {
            return Ok(Context {
                fiber: unsafe { current_fiber() },
                kind: Kind::Adopted { converted: false },
            });
        }
        let fiber = unsafe { ConvertThreadToFiberEx(std::ptr::null(), 0) };
        if fiber.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Context {
            fiber,
            kind: Kind::Adopted { converted: true },
        })
    }

    #[inline(always)]
    pub fn raw(&self) -> RawContext {
        self.fiber
    }

    /// The fiber primitive saves the calling context on its own.
    pub unsafe fn switch(_from: RawContext, to: RawContext) {
        SwitchToFiber(to);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        match self.kind {
            // Deleting a suspended fiber frees its stack without unwinding
            // it.
            Kind::Allocated(_) => unsafe { DeleteFiber(self.fiber) },
            Kind::Adopted { converted: true } => {
                if unsafe { ConvertFiberToThread() } == 0 {
                    log::warn!(
                        "ConvertFiberToThread failed: {:?}",
                        Error::last_os_error()
                    );
                }
            }
            Kind::Adopted { converted: false } => {}
        }
    }
}

// GetCurrentFiber is header-only in the Win32 SDK; read the TEB slot it
// reads.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        unsafe fn current_fiber() -> *mut c_void {
            let fiber: *mut c_void;
            std::arch::asm!(
                "mov {}, qword ptr gs:[0x20]",
                out(reg) fiber,
                options(nostack, pure, readonly),
            );
            fiber
        }
    } else if #[cfg(target_arch = "x86")] {
        unsafe fn current_fiber() -> *mut c_void {
            let fiber: *mut c_void;
            std::arch::asm!(
                "mov {}, dword ptr fs:[0x10]",
                out(reg) fiber,
                options(nostack, pure, readonly),
            );
            fiber
        }
    } else if #[cfg(target_arch = "aarch64")] {
        unsafe fn current_fiber() -> *mut c_void {
            let teb: *const u8;
            std::arch::asm!("mov {}, x18", out(reg) teb, options(nomem, nostack, pure));
            *(teb.add(0x20) as *const *mut c_void)
        }
    } else {
        compile_error!("no GetCurrentFiber equivalent for this architecture");
    }
}
