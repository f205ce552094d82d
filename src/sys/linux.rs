use core::ffi;

use crate::{memory::Memory, stdext::with_last_os_error_str};

/// Size of the scratch buffer a probe reads through.
const PROBE_CHUNK: usize = 256;

/// Memory of a process on this machine, read with `process_vm_readv`.
/// Unmapped addresses make the syscall fail instead of faulting.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: libc::pid_t,
}

impl ProcessMemory {
    pub fn current() -> Self {
        // SAFETY: getpid cannot fail.
        Self::new(unsafe { libc::getpid() })
    }

    /// Reading another process needs the same permissions as ptrace.
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }
}

impl Memory for ProcessMemory {
    fn is_readable(&self, address: u64, len: usize) -> bool {
        let mut scratch = [0u8; PROBE_CHUNK];
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(PROBE_CHUNK);
            let Some(at) = address.checked_add(offset as u64) else {
                return false;
            };
            if !self.read_raw(at, &mut scratch[..chunk]) {
                return false;
            }
            offset += chunk;
        }
        true
    }

    fn read_raw(&self, address: u64, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        let Ok(remote_base) = usize::try_from(address) else {
            return false;
        };
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<ffi::c_void>(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: remote_base as *mut ffi::c_void,
            iov_len: buf.len(),
        };

        // SAFETY: `local` covers `buf`; the kernel validates `remote`.
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if read < 0 {
            with_last_os_error_str(|err| trace!("process_vm_readv at {address:#x}: {err}"));
            return false;
        }
        read as usize == buf.len()
    }
}
