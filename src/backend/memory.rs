//! Executable memory for the generated code. The build buffer is copied
//! onto freshly mapped page-aligned memory which is then flipped to
//! read+execute; dropping the handle unmaps it.

use std::{ffi::c_void, io, ptr};

#[derive(Debug)]
pub struct ExecutableMemory {
    pointer: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub fn publish(code: &[u8]) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(io::Error::last_os_error());
        }

        let len = code.len().max(1).next_multiple_of(page_size as usize);

        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), pointer as *mut u8, code.len());
        }

        if unsafe { libc::mprotect(pointer, len, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            let error = io::Error::last_os_error();
            unsafe { libc::munmap(pointer, len) };
            return Err(error);
        }

        Ok(Self {
            pointer: pointer as *mut u8,
            len,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.pointer
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.pointer as *mut c_void, self.len);
        }
    }
}
