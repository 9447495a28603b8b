use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::sys;
use crate::syscall_los;

/// A timerfd armed at the probe's next deadline; its readability feeds the
/// client's epoll set
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let fd = syscall_los!(unsafe {
            sys::timerfd_create(sys::CLOCK_MONOTONIC, sys::TFD_NONBLOCK | sys::TFD_CLOEXEC)
        })?;

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// One-shot arm, relative. A zero delay still fires: an all-zero
    /// `it_value` would disarm instead, so it is bumped to one nanosecond.
    pub fn arm(&self, delay: Duration) -> io::Result<()> {
        let mut spec: sys::itimerspec = unsafe { core::mem::zeroed() };

        spec.it_value.tv_sec = delay.as_secs() as _;
        spec.it_value.tv_nsec = delay.subsec_nanos() as _;

        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            spec.it_value.tv_nsec = 1;
        }

        syscall_los!(unsafe {
            sys::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, core::ptr::null_mut())
        })?;

        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        let spec: sys::itimerspec = unsafe { core::mem::zeroed() };

        syscall_los!(unsafe {
            sys::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, core::ptr::null_mut())
        })?;

        Ok(())
    }

    /// Drains the expiration counter so the descriptor stops polling
    /// readable
    pub fn clear(&self) {
        let mut expirations = [0u8; 8];

        let _ = unsafe {
            sys::read(
                self.fd.as_raw_fd(),
                expirations.as_mut_ptr() as *mut _,
                expirations.len(),
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_disarm() {
        let timer = TimerFd::new().unwrap();

        timer.arm(Duration::from_secs(3600)).unwrap();
        timer.arm(Duration::ZERO).unwrap();
        timer.disarm().unwrap();
        timer.clear();
    }
}
