//! Cross-thread wakeup primitive: a kernel-backed counter exposed as a file
//! descriptor, so it can sit in a [`crate::selector::Selector`] alongside
//! the page-fault handler's fd.
//!
//! Grounded directly on the original's `Doorbell` (Linux `eventfd`,
//! `EFD_CLOEXEC | EFD_NONBLOCK`, retry-on-`EINTR`, abort on any other
//! failure — a broken doorbell indicates a kernel resource problem, not a
//! recoverable condition).

use crate::error::MantleError;
use std::os::fd::RawFd;

/// Wraps an `eventfd` counter. `ring` adds to the counter from any thread;
/// `poll` atomically reads-and-clears it from the single poller thread.
#[derive(Debug)]
pub struct Doorbell {
    fd: RawFd,
}

impl Doorbell {
    /// Creates a new doorbell backed by a fresh `eventfd`.
    ///
    /// # Errors
    /// Returns [`MantleError::SystemCall`] if the kernel refuses to create
    /// the eventfd.
    pub fn new() -> Result<Self, MantleError> {
        // SAFETY: `eventfd` with a zero initial value and no extra flags
        // beyond the two requested is always safe to call.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(MantleError::SystemCall(std::io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// The underlying file descriptor, for registration with a
    /// [`crate::selector::Selector`].
    #[must_use]
    pub fn file_descriptor(&self) -> RawFd {
        self.fd
    }

    /// Adds `count` to the doorbell. Thread-safe for any number of
    /// concurrent ringers.
    pub fn ring(&self, count: u64) {
        loop {
            // SAFETY: `fd` is valid for the lifetime of `self`; the buffer
            // is exactly 8 bytes as `write(2)` on an eventfd requires.
            let written = unsafe {
                libc::write(self.fd, std::ptr::addr_of!(count).cast::<libc::c_void>(), std::mem::size_of::<u64>())
            };
            if written == std::mem::size_of::<u64>() as isize {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                crate::protocol_violation!("doorbell ring failed: {err}");
            }
        }
    }

    /// Reads and clears the counter. In blocking mode, waits until it is
    /// non-zero first; in non-blocking mode, returns `0` immediately if
    /// there is nothing to read (a racing ringer may land between the wait
    /// and the read, so even the blocking path treats `EAGAIN` as `0`
    /// rather than an error).
    pub fn poll(&self, non_blocking: bool) -> u64 {
        if !non_blocking {
            self.wait_for_readable();
        }

        let mut count: u64 = 0;
        loop {
            // SAFETY: `fd` is valid; the buffer is exactly 8 bytes.
            let read = unsafe {
                libc::read(self.fd, std::ptr::addr_of_mut!(count).cast::<libc::c_void>(), std::mem::size_of::<u64>())
            };
            if read == std::mem::size_of::<u64>() as isize {
                return count;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::Interrupted => continue,
                std::io::ErrorKind::WouldBlock => return 0,
                _ => crate::protocol_violation!("doorbell poll failed: {err}"),
            }
        }
    }

    fn wait_for_readable(&self) {
        let mut poll_fd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: a single well-formed pollfd, indefinite timeout.
            let result = unsafe { libc::poll(std::ptr::addr_of_mut!(poll_fd), 1, -1) };
            if result >= 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                crate::protocol_violation!("doorbell wait failed: {err}");
            }
        }
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        // SAFETY: `fd` is open and owned exclusively by this doorbell.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_then_poll_returns_count() {
        let doorbell = Doorbell::new().unwrap();
        doorbell.ring(3);
        assert_eq!(doorbell.poll(true), 3);
        assert_eq!(doorbell.poll(true), 0);
    }

    #[test]
    fn rings_accumulate() {
        let doorbell = Doorbell::new().unwrap();
        doorbell.ring(1);
        doorbell.ring(2);
        assert_eq!(doorbell.poll(true), 3);
    }
}
