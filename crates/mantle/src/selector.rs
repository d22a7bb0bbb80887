//! Readiness multiplexer over the domain's doorbell, the page-fault
//! handler's fd, and every bound region's connection.
//!
//! Grounded on the original's `Selector` (Linux `epoll`, level-triggered,
//! `MAX_EVENT_COUNT == 16`).

use crate::error::MantleError;
use std::os::fd::RawFd;

/// `MAX_EVENT_COUNT` from the original.
const MAX_EVENT_COUNT: usize = 16;

/// Identifies which readiness source woke the domain, without smuggling a
/// raw pointer through the kernel's opaque `epoll_data_t` — user-data is a
/// small `Copy` token the domain looks up against its own tables instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorToken {
    /// The domain's own bind doorbell.
    BindDoorbell,
    /// The page-fault handler's fd.
    PageFaultHandler,
    /// A region's connection, identified by region id.
    Region(u16),
}

/// Wraps an `epoll` instance.
pub struct Selector {
    epoll_fd: RawFd,
    events_buffer: Box<[libc::epoll_event; MAX_EVENT_COUNT]>,
    tokens: Vec<Option<SelectorToken>>,
}

impl Selector {
    /// Creates a new selector.
    ///
    /// # Errors
    /// Returns [`MantleError::SystemCall`] if `epoll_create1` fails.
    pub fn new() -> Result<Self, MantleError> {
        // SAFETY: no arguments to get wrong beyond the flag.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(MantleError::SystemCall(std::io::Error::last_os_error()));
        }
        Ok(Self {
            epoll_fd,
            events_buffer: Box::new([libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_COUNT]),
            tokens: Vec::new(),
        })
    }

    /// Registers `fd` for readability, associating it with `token`.
    pub fn add_watch(&mut self, fd: RawFd, token: SelectorToken) {
        let slot = self.intern(token);
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: slot as u64,
        };
        // SAFETY: `epoll_fd` is valid; `event` is fully initialized.
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if result < 0 {
            crate::protocol_violation!("failed to add epoll watch: {}", std::io::Error::last_os_error());
        }
    }

    /// Removes a previously added watch.
    pub fn delete_watch(&mut self, fd: RawFd) {
        // SAFETY: `epoll_fd` is valid; a null event pointer is accepted by
        // `EPOLL_CTL_DEL` (ignored by the kernel since Linux 2.6.9).
        let result = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if result < 0 {
            crate::protocol_violation!("failed to delete epoll watch: {}", std::io::Error::last_os_error());
        }
    }

    fn intern(&mut self, token: SelectorToken) -> usize {
        self.tokens.push(Some(token));
        self.tokens.len() - 1
    }

    /// Waits for readiness and returns the tokens that are ready.
    /// `non_blocking` makes this return immediately with an empty slice if
    /// nothing is ready yet; otherwise it blocks until at least one fd is
    /// readable.
    pub fn poll(&mut self, non_blocking: bool) -> Vec<SelectorToken> {
        let timeout = if non_blocking { 0 } else { -1 };

        let event_count = loop {
            // SAFETY: `events_buffer` has room for `MAX_EVENT_COUNT` events.
            let result = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events_buffer.as_mut_ptr(),
                    MAX_EVENT_COUNT as i32,
                    timeout,
                )
            };
            if result >= 0 {
                break result as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                crate::protocol_violation!("epoll_wait failed: {err}");
            }
        };

        self.events_buffer[..event_count]
            .iter()
            .map(|event| {
                let slot = event.u64 as usize;
                self.tokens[slot].expect("ready event referenced an un-interned token")
            })
            .collect()
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        // SAFETY: `epoll_fd` is open and owned exclusively by this selector.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::Doorbell;

    #[test]
    fn reports_readiness_after_ring() {
        let doorbell = Doorbell::new().unwrap();
        let mut selector = Selector::new().unwrap();
        selector.add_watch(doorbell.file_descriptor(), SelectorToken::BindDoorbell);

        assert!(selector.poll(true).is_empty());

        doorbell.ring(1);
        let ready = selector.poll(true);
        assert_eq!(ready, vec![SelectorToken::BindDoorbell]);
    }
}
