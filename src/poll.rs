use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys;
use crate::syscall_los;

pub(crate) const TOKEN_RAW: u64 = 1;
pub(crate) const TOKEN_UDP: u64 = 2;
pub(crate) const TOKEN_TIMER: u64 = 3;

/// Which of the client's descriptors polled readable
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct Ready {
    pub raw: bool,
    pub udp: bool,
    pub timer: bool,
}

/// The epoll instance aggregating socket readability and timer firing.
///
/// Its descriptor is the single handle the host adds to its own poll set;
/// it polls readable whenever a `dispatch()` would do work.
pub(crate) struct Poll {
    epoll: OwnedFd,
}

impl Poll {
    pub fn new() -> io::Result<Self> {
        let fd = syscall_los!(unsafe { sys::epoll_create1(sys::EPOLL_CLOEXEC) })?;

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    pub fn register(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = sys::epoll_event {
            events: sys::EPOLLIN as u32,
            u64: token,
        };

        syscall_los!(unsafe {
            sys::epoll_ctl(self.epoll.as_raw_fd(), sys::EPOLL_CTL_ADD, fd, &mut event)
        })?;

        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut event = sys::epoll_event { events: 0, u64: 0 };

        syscall_los!(unsafe {
            sys::epoll_ctl(self.epoll.as_raw_fd(), sys::EPOLL_CTL_DEL, fd, &mut event)
        })?;

        Ok(())
    }

    /// Non-blocking readiness snapshot
    pub fn ready(&self) -> io::Result<Ready> {
        let mut events: [sys::epoll_event; 8] = unsafe { core::mem::zeroed() };

        let count = loop {
            match syscall_los!(unsafe {
                sys::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as _,
                    0,
                )
            }) {
                Ok(count) => break count as usize,
                Err(err) if err.raw_os_error() == Some(sys::EINTR) => continue,
                Err(err) => return Err(err),
            }
        };

        let mut ready = Ready::default();

        for event in &events[..count] {
            match event.u64 {
                TOKEN_RAW => ready.raw = true,
                TOKEN_UDP => ready.udp = true,
                TOKEN_TIMER => ready.timer = true,
                _ => (),
            }
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerFd;

    #[test]
    fn timer_readiness_flows_through() {
        let poll = Poll::new().unwrap();
        let timer = TimerFd::new().unwrap();

        poll.register(timer.as_raw_fd(), TOKEN_TIMER).unwrap();

        assert!(!poll.ready().unwrap().timer);

        timer.arm(std::time::Duration::ZERO).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert!(poll.ready().unwrap().timer);

        timer.clear();
        assert!(!poll.ready().unwrap().timer);

        poll.deregister(timer.as_raw_fd()).unwrap();
    }
}
