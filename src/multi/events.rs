//! Descriptor-level plumbing for the worker loops.
//!
//! Thin safe wrappers over `eventfd(2)`, `timerfd_create(2)` and `poll(2)`.
//! Everything here is level-triggered and non-blocking; transient `EINTR`
//! is retried on the spot and never escapes.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Outcome of a single non-blocking read or write.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IoOp {
    /// Bytes transferred.
    Data(usize),
    /// The descriptor has nothing to offer (or no room) right now.
    WouldBlock,
    /// The peer closed its end.
    Closed,
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn read_nonblock(fd: RawFd, buf: &mut [u8]) -> io::Result<IoOp> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            return Ok(IoOp::Data(n as usize));
        }
        if n == 0 {
            return Ok(IoOp::Closed);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(IoOp::WouldBlock),
            _ => return Err(err),
        }
    }
}

pub(crate) fn write_nonblock(fd: RawFd, buf: &[u8]) -> io::Result<IoOp> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(IoOp::Data(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(IoOp::WouldBlock),
            _ => return Err(err),
        }
    }
}

/// Like [`write_nonblock`] but for sockets: `MSG_NOSIGNAL` turns a dead
/// peer into `EPIPE` instead of a process-wide `SIGPIPE`.
pub(crate) fn send_nonblock(fd: RawFd, buf: &[u8]) -> io::Result<IoOp> {
    loop {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if n >= 0 {
            return Ok(IoOp::Data(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(IoOp::WouldBlock),
            io::ErrorKind::BrokenPipe => return Ok(IoOp::Closed),
            _ => return Err(err),
        }
    }
}

/// A 64-bit kernel event counter used both for worker wake-ups and for the
/// transport-facing hand-off.
///
/// `post` adds to the counter; `take` reads-and-resets it, returning 0 when
/// nothing is pending. Readiness is observed through `poll`.
pub(crate) struct Eventfd {
    fd: OwnedFd,
}

impl Eventfd {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn post(&self, value: u64) -> io::Result<()> {
        let buf = value.to_ne_bytes();
        match write_nonblock(self.fd.as_raw_fd(), &buf)? {
            IoOp::Data(8) => Ok(()),
            // A saturated counter still wakes the poller, which is all that
            // matters here.
            IoOp::WouldBlock => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::WriteZero, "short eventfd write")),
        }
    }

    pub fn take(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match read_nonblock(self.fd.as_raw_fd(), &mut buf)? {
            IoOp::Data(8) => Ok(u64::from_ne_bytes(buf)),
            IoOp::WouldBlock => Ok(0),
            _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short eventfd read")),
        }
    }
}

impl AsRawFd for Eventfd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// One-shot monotonic timer backing the drain settle delay.
pub(crate) struct OneShotTimer {
    fd: OwnedFd,
}

impl OneShotTimer {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn arm(&self, after: Duration) -> io::Result<()> {
        // An all-zero expiry would disarm instead of firing.
        let after = after.max(Duration::from_nanos(1));
        self.settime(libc::timespec {
            tv_sec: after.as_secs() as libc::time_t,
            tv_nsec: after.subsec_nanos() as libc::c_long,
        })
    }

    pub fn disarm(&self) -> io::Result<()> {
        self.settime(libc::timespec { tv_sec: 0, tv_nsec: 0 })
    }

    /// Consume a pending expiry, returning how many times the timer fired.
    pub fn acknowledge(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match read_nonblock(self.fd.as_raw_fd(), &mut buf)? {
            IoOp::Data(8) => Ok(u64::from_ne_bytes(buf)),
            IoOp::WouldBlock => Ok(0),
            _ => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short timerfd read")),
        }
    }

    fn settime(&self, value: libc::timespec) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: value,
        };
        if unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) } < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for OneShotTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub(crate) fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

/// Block until at least one descriptor is ready.
pub(crate) fn poll(fds: &mut [libc::pollfd]) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_accumulates_and_resets() {
        let ev = Eventfd::new().unwrap();
        assert_eq!(ev.take().unwrap(), 0);

        ev.post(1).unwrap();
        ev.post(41).unwrap();
        assert_eq!(ev.take().unwrap(), 42);
        assert_eq!(ev.take().unwrap(), 0);
    }

    #[test]
    fn eventfd_wakes_poll() {
        let ev = Eventfd::new().unwrap();
        let mut fds = [pollfd(ev.as_raw_fd(), libc::POLLIN)];

        ev.post(7).unwrap();
        poll(&mut fds).unwrap();
        assert_ne!(fds[0].revents & libc::POLLIN, 0);
    }

    #[test]
    fn timer_fires_once() {
        let timer = OneShotTimer::new().unwrap();
        timer.arm(Duration::from_millis(10)).unwrap();

        let mut fds = [pollfd(timer.as_raw_fd(), libc::POLLIN)];
        poll(&mut fds).unwrap();
        assert_eq!(timer.acknowledge().unwrap(), 1);
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }

    #[test]
    fn disarmed_timer_stays_quiet() {
        let timer = OneShotTimer::new().unwrap();
        timer.arm(Duration::from_millis(50)).unwrap();
        timer.disarm().unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }
}
