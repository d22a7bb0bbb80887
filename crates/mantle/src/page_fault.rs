//! Raw `userfaultfd(2)` bindings.
//!
//! No actively maintained safe wrapper crate for `userfaultfd` exists in the
//! dependency universe this crate draws from, so the ioctl surface is
//! reproduced here directly against `libc`, mirroring the original
//! `PageFaultHandler`. Linux only.
#![cfg(target_os = "linux")]

use crate::error::MantleError;
use std::os::fd::RawFd;

const PAGE_SIZE: usize = 4096;

const UFFD_USER_MODE_ONLY: i32 = 1;
const UFFD_API: u64 = 0xAA;

const UFFD_FEATURE_THREAD_ID: u64 = 1 << 8;
const UFFD_FEATURE_EXACT_ADDRESS: u64 = 1 << 11;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
const UFFDIO_REGISTER_MODE_WP: u64 = 1 << 1;
const UFFDIO_WRITEPROTECT_MODE_WP: u64 = 1 << 0;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_WP: u64 = 1 << 1;

const IOCTL_MAGIC: u32 = 0xAA;

const fn ioc(dir: u32, nr: u32, size: usize) -> u64 {
    ((dir as u64) << 30) | ((IOCTL_MAGIC as u64) << 8) | (nr as u64) | ((size as u64) << 16)
}

const IOC_READ: u32 = 2;
const IOC_WRITE: u32 = 1;

fn uffdio_api() -> u64 {
    ioc(IOC_READ | IOC_WRITE, 0x3F, std::mem::size_of::<UffdioApi>())
}
fn uffdio_register() -> u64 {
    ioc(IOC_READ | IOC_WRITE, 0x00, std::mem::size_of::<UffdioRegister>())
}
fn uffdio_unregister() -> u64 {
    ioc(IOC_READ, 0x01, std::mem::size_of::<UffdioRange>())
}
fn uffdio_writeprotect() -> u64 {
    ioc(IOC_READ | IOC_WRITE, 0x06, std::mem::size_of::<UffdioWriteprotect>())
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UffdioWriteprotect {
    range: UffdioRange,
    mode: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
union UffdMsgArg {
    pagefault: UffdPagefault,
    reserved: [u8; 24],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UffdPagefault {
    flags: u64,
    address: u64,
    ptid: u32,
}

#[repr(C)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    arg: UffdMsgArg,
}

/// Registration mode, mirroring the original's `PageFaultHandler::Mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fault on first touch of a missing page.
    Missing,
    /// Fault on any write to a present, write-protected page. This is the
    /// mode the ledger's guard pages use.
    WriteProtect,
}

impl Mode {
    fn register_bit(self) -> u64 {
        match self {
            Mode::Missing => UFFDIO_REGISTER_MODE_MISSING,
            Mode::WriteProtect => UFFDIO_REGISTER_MODE_WP,
        }
    }
}

fn translate(modes: &[Mode]) -> u64 {
    modes.iter().fold(0, |mask, mode| mask | mode.register_bit())
}

/// One pending fault reported by the kernel: the faulting page, and whether
/// it was a write-protect fault (the only kind the ledger registers for).
#[derive(Debug, Clone, Copy)]
pub struct PageFaultEvent {
    pub address: usize,
    pub write_protect: bool,
}

/// Wraps a `userfaultfd` instance.
pub struct PageFaultHandler {
    uffd: RawFd,
    #[allow(dead_code)]
    has_feature_thread_id: bool,
    #[allow(dead_code)]
    has_feature_exact_address: bool,
}

impl PageFaultHandler {
    /// Creates a handler and performs the API handshake.
    ///
    /// # Errors
    /// Returns [`MantleError::PageFaultHandlerUnavailable`] if the syscall or
    /// handshake fails (commonly: missing `CAP_SYS_PTRACE`/unprivileged
    /// userfaultfd disabled by sysctl).
    pub fn new() -> Result<Self, MantleError> {
        // SAFETY: `userfaultfd` takes a single flags argument; no pointers
        // involved.
        let uffd = unsafe {
            libc::syscall(
                libc::SYS_userfaultfd,
                libc::O_CLOEXEC | libc::O_NONBLOCK | UFFD_USER_MODE_ONLY,
            )
        };
        if uffd < 0 {
            return Err(MantleError::PageFaultHandlerUnavailable(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let uffd = uffd as RawFd;

        let mut api = UffdioApi {
            api: UFFD_API,
            features: UFFD_FEATURE_THREAD_ID | UFFD_FEATURE_EXACT_ADDRESS,
            ioctls: 0,
        };
        // SAFETY: `api` is a valid, fully initialized `uffdio_api`.
        let result = unsafe { libc::ioctl(uffd, uffdio_api(), std::ptr::addr_of_mut!(api)) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(uffd);
            }
            return Err(MantleError::PageFaultHandlerUnavailable(format!(
                "API handshake failed: {err}"
            )));
        }

        Ok(Self {
            uffd,
            has_feature_thread_id: api.features & UFFD_FEATURE_THREAD_ID != 0,
            has_feature_exact_address: api.features & UFFD_FEATURE_EXACT_ADDRESS != 0,
        })
    }

    /// The underlying file descriptor, for registration with a
    /// [`crate::selector::Selector`].
    #[must_use]
    pub fn file_descriptor(&self) -> RawFd {
        self.uffd
    }

    /// Registers `memory` (page-aligned) for the given fault modes.
    pub fn register_memory(&self, memory: &[u8], modes: &[Mode]) {
        debug_assert_eq!(memory.as_ptr() as usize % PAGE_SIZE, 0);
        let mut register = UffdioRegister {
            range: UffdioRange {
                start: memory.as_ptr() as u64,
                len: memory.len() as u64,
            },
            mode: translate(modes),
            ioctls: 0,
        };
        // SAFETY: `register` is fully initialized and `memory` outlives the call.
        let result = unsafe { libc::ioctl(self.uffd, uffdio_register(), std::ptr::addr_of_mut!(register)) };
        if result < 0 {
            crate::protocol_violation!("failed to register memory region: {}", std::io::Error::last_os_error());
        }
    }

    /// Reverses [`Self::register_memory`].
    pub fn unregister_memory(&self, memory: &[u8]) {
        let mut range = UffdioRange {
            start: memory.as_ptr() as u64,
            len: memory.len() as u64,
        };
        // SAFETY: `range` is fully initialized.
        let result = unsafe { libc::ioctl(self.uffd, uffdio_unregister(), std::ptr::addr_of_mut!(range)) };
        if result < 0 {
            crate::protocol_violation!("failed to unregister memory region: {}", std::io::Error::last_os_error());
        }
    }

    /// Write-protects `memory`; the next write to it raises a fault.
    pub fn write_protect_memory(&self, memory: &[u8]) {
        self.set_write_protect(memory, UFFDIO_WRITEPROTECT_MODE_WP);
    }

    /// Clears write protection installed by [`Self::write_protect_memory`],
    /// allowing the faulted write to proceed.
    pub fn write_unprotect_memory(&self, memory: &[u8]) {
        self.set_write_protect(memory, 0);
    }

    fn set_write_protect(&self, memory: &[u8], mode: u64) {
        debug_assert_eq!(memory.as_ptr() as usize % PAGE_SIZE, 0);
        let mut writeprotect = UffdioWriteprotect {
            range: UffdioRange {
                start: memory.as_ptr() as u64,
                len: memory.len() as u64,
            },
            mode,
        };
        // SAFETY: `writeprotect` is fully initialized.
        let result = unsafe { libc::ioctl(self.uffd, uffdio_writeprotect(), std::ptr::addr_of_mut!(writeprotect)) };
        if result < 0 {
            crate::protocol_violation!("failed to change write protection: {}", std::io::Error::last_os_error());
        }
    }

    /// Reads and returns every fault event currently queued, without
    /// blocking. The caller is expected to have polled this handler's fd for
    /// readability via a [`crate::selector::Selector`] first.
    #[must_use]
    pub fn drain_events(&self) -> Vec<PageFaultEvent> {
        let mut events = Vec::new();
        loop {
            let mut msg = UffdMsg {
                event: 0,
                reserved1: 0,
                reserved2: 0,
                reserved3: 0,
                arg: UffdMsgArg { reserved: [0; 24] },
            };
            // SAFETY: `msg` has room for exactly one `uffd_msg`.
            let read = unsafe {
                libc::read(
                    self.uffd,
                    std::ptr::addr_of_mut!(msg).cast::<libc::c_void>(),
                    std::mem::size_of::<UffdMsg>(),
                )
            };
            if read < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    break;
                }
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                crate::protocol_violation!("userfaultfd read failed: {err}");
            }
            if msg.event != UFFD_EVENT_PAGEFAULT {
                crate::protocol_violation!("unexpected userfaultfd event {}", msg.event);
            }
            // SAFETY: `event == UFFD_EVENT_PAGEFAULT`, so the `pagefault`
            // variant of the union is the one the kernel populated.
            let pagefault = unsafe { msg.arg.pagefault };
            events.push(PageFaultEvent {
                address: pagefault.address as usize,
                write_protect: pagefault.flags & UFFD_PAGEFAULT_FLAG_WP != 0,
            });
        }
        events
    }
}

impl Drop for PageFaultHandler {
    fn drop(&mut self) {
        // SAFETY: `uffd` is open and owned exclusively by this handler.
        unsafe {
            libc::close(self.uffd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_combines_mode_bits() {
        let mask = translate(&[Mode::Missing, Mode::WriteProtect]);
        assert_eq!(mask, UFFDIO_REGISTER_MODE_MISSING | UFFDIO_REGISTER_MODE_WP);
    }

    #[test]
    fn ioctl_numbers_are_stable() {
        // These must never change once shipped: they are a kernel ABI.
        assert_eq!(uffdio_api(), 0xC018_AA3F);
        assert_eq!(uffdio_writeprotect(), 0xC018_AA06);
    }
}
