use std::io::{Error, ErrorKind, Result};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "openbsd"))] {
        const MMAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_STACK;
    } else {
        const MMAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}
const MMAP_PROT: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

/// One coroutine stack: an anonymous mapping with a guard page at the
/// overflow end.
pub(crate) struct Stack {
    total_size: usize,
    map: *mut u8,
    base: *mut u8,
    size: usize,
}

// TODO: pool warm stacks instead of a mmap/munmap round-trip per coroutine.
impl Stack {
    /// System page allocation granularity.
    #[inline(always)]
    pub fn page_size() -> usize {
        page_size::get_granularity()
    }

    /// Size of the guarded region.
    #[inline(always)]
    pub fn guard_size() -> usize {
        page_size::get_granularity()
    }

    /// Maps a stack of at least `size_hint` usable bytes.
    pub fn allocate(size_hint: usize) -> Result<Stack> {
        let page_mask = Self::page_size() - 1;
        let size = size_hint
            .max(1)
            .checked_add(page_mask)
            .ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?
            & !page_mask;
        let total_size = size
            .checked_add(Self::guard_size())
            .ok_or_else(|| Error::from(ErrorKind::OutOfMemory))?;

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                MMAP_PROT,
                MMAP_FLAGS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let map = map as *mut u8;
        let (base, guard) = if stack_growth_downward() {
            (unsafe { map.add(Self::guard_size()) }, map)
        } else {
            (map, unsafe { map.add(size) })
        };
        if unsafe { libc::mprotect(guard as *mut libc::c_void, Self::guard_size(), libc::PROT_NONE) }
            < 0
        {
            let err = Error::last_os_error();
            unsafe { libc::munmap(map as *mut libc::c_void, total_size) };
            return Err(err);
        }
        Ok(Stack {
            total_size,
            map,
            base,
            size,
        })
    }

    /// Lowest address of the usable region; what the context primitive
    /// consumes.
    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Usable size, guard excluded.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    #[allow(dead_code)]
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.map as *mut libc::c_void, self.total_size) } < 0 {
            log::warn!("munmap({:?}) failed: {:?}", self.map, Error::last_os_error());
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64"
    ))] {
        /// `true` when stacks grow toward lower addresses.
        #[inline(always)]
        pub(crate) const fn stack_growth_downward() -> bool {
            true
        }
    } else {
        #[inline(never)]
        fn probe(parent: *const u8) -> bool {
            let local = 0u8;
            (&local as *const u8 as usize) < (parent as usize)
        }
        /// `true` when stacks grow toward lower addresses.
        #[inline(never)]
        pub(crate) fn stack_growth_downward() -> bool {
            let local = 0u8;
            probe(&local)
        }
    }
}
