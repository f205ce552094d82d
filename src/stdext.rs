use core::fmt::{self, Write};

pub(crate) const STDOUT: libc::c_int = 1;
pub(crate) const STDERR: libc::c_int = 2;

/// Unbuffered writes to a raw file descriptor.
pub(crate) struct FdWriter(pub(crate) libc::c_int);

impl Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            // SAFETY: the pointer and length describe a live byte slice.
            let r = unsafe { libc::write(self.0, bytes.as_ptr().cast(), bytes.len() as _) };
            if r < 0 {
                return Err(fmt::Error);
            }
            if r == 0 {
                return Ok(());
            }
            bytes = &bytes[(r as usize)..];
        }
        Ok(())
    }
}

/// Wall clock time as seconds and microseconds.
#[cfg(unix)]
pub(crate) fn now() -> Option<(u64, u32)> {
    // SAFETY: all zeroes is a valid timespec.
    let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
    // SAFETY: `ts` is a valid out pointer.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    if ret != 0 {
        return None;
    }
    Some((ts.tv_sec as u64, (ts.tv_nsec / 1000) as u32))
}

#[cfg(not(unix))]
pub(crate) fn now() -> Option<(u64, u32)> {
    // SAFETY: a null out pointer is allowed.
    let secs = unsafe { libc::time(core::ptr::null_mut()) };
    (secs >= 0).then_some((secs as u64, 0))
}

#[cfg(target_os = "linux")]
fn errno() -> i32 {
    // SAFETY: Surely errno_location would be valid, right?
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
pub(crate) fn with_last_os_error_str<R>(f: impl FnOnce(&str) -> R) -> R {
    let mut buf: [u8; 512] = [0; 512];

    // SAFETY: Our buffer length is passed correctly
    let error = unsafe { libc::strerror_r(errno(), buf.as_mut_ptr().cast(), buf.len()) };
    if error != 0 {
        return f("<strerror_r returned an error>");
    }
    // SAFETY: strerror_r wrote a nul terminated string, and we zero initialised the rest.
    let cstr = unsafe { core::ffi::CStr::from_ptr(buf.as_ptr().cast()) };
    f(cstr
        .to_str()
        .unwrap_or("<error message contained invalid utf8>"))
}
