//! Completion signal — the dispatcher's cross-thread wakeup descriptor.
//!
//! Workers raise the signal after releasing a finished descriptor; the
//! dispatcher polls the signal descriptor alongside the transports and
//! drains it when it fires, which re-admits the finished descriptor on the
//! next iteration. Raises coalesce: any number of raises before a drain
//! produce a single wakeup.
//!
//! Linux uses an eventfd (counter semantics: one read drains everything).
//! Other unixes fall back to a non-blocking pipe pair with the same
//! contract.

use std::io;
use std::os::unix::io::RawFd;

use log::warn;
use svcmux_core::error::{DispatchError, Result};

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub struct CompletionSignal {
            fd: RawFd,
        }

        impl CompletionSignal {
            pub fn new() -> Result<Self> {
                // Safety: plain descriptor creation; the fd is owned by Self.
                let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if fd < 0 {
                    return Err(DispatchError::SignalSetup(last_errno()));
                }
                Ok(Self { fd })
            }

            /// The descriptor the dispatcher adds to its wait set.
            pub fn descriptor(&self) -> RawFd {
                self.fd
            }

            /// Wake the dispatcher. Never blocks.
            pub fn raise(&self) {
                let val: u64 = 1;
                // Safety: writes 8 bytes from a live stack slot to our own fd.
                let ret = unsafe {
                    libc::write(
                        self.fd,
                        &val as *const u64 as *const libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                if ret < 0 {
                    let errno = last_errno();
                    // EAGAIN: the counter is saturated, so a wakeup is
                    // already pending. That is all a raise guarantees.
                    if errno != libc::EAGAIN {
                        warn!("completion signal raise failed: errno {}", errno);
                    }
                }
            }

            /// Consume all pending raises. Returns how many were pending.
            pub fn drain(&self) -> u64 {
                let mut val: u64 = 0;
                // Safety: reads 8 bytes into a live stack slot from our own fd.
                let ret = unsafe {
                    libc::read(
                        self.fd,
                        &mut val as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                if ret < 0 {
                    0
                } else {
                    val
                }
            }
        }

        impl Drop for CompletionSignal {
            fn drop(&mut self) {
                if self.fd >= 0 {
                    // Safety: closing a descriptor we own exactly once.
                    unsafe { libc::close(self.fd) };
                    self.fd = -1;
                }
            }
        }
    } else {
        pub struct CompletionSignal {
            read_fd: RawFd,
            write_fd: RawFd,
        }

        impl CompletionSignal {
            pub fn new() -> Result<Self> {
                let mut fds = [0 as RawFd; 2];
                // Safety: plain descriptor creation; both fds are owned by Self.
                if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                    return Err(DispatchError::SignalSetup(last_errno()));
                }
                for fd in fds {
                    // Safety: fcntl on descriptors we just created.
                    unsafe {
                        libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                }
                Ok(Self { read_fd: fds[0], write_fd: fds[1] })
            }

            /// The descriptor the dispatcher adds to its wait set.
            pub fn descriptor(&self) -> RawFd {
                self.read_fd
            }

            /// Wake the dispatcher. Never blocks.
            pub fn raise(&self) {
                let byte = 1u8;
                // Safety: writes one byte from a live stack slot to our own fd.
                let ret = unsafe {
                    libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1)
                };
                if ret < 0 {
                    let errno = last_errno();
                    // A full pipe already holds a pending wakeup.
                    if errno != libc::EAGAIN {
                        warn!("completion signal raise failed: errno {}", errno);
                    }
                }
            }

            /// Consume all pending raises. Returns how many were pending.
            pub fn drain(&self) -> u64 {
                let mut buf = [0u8; 64];
                let mut total = 0u64;
                loop {
                    // Safety: reads into a live stack buffer from our own fd.
                    let ret = unsafe {
                        libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if ret <= 0 {
                        break;
                    }
                    total += ret as u64;
                }
                total
            }
        }

        impl Drop for CompletionSignal {
            fn drop(&mut self) {
                // Safety: closing descriptors we own exactly once.
                unsafe {
                    libc::close(self.read_fd);
                    libc::close(self.write_fd);
                }
            }
        }
    }
}
