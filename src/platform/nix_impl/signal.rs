// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::os::raw::c_int;

use nix::sys::signal;

use crate::Result;

pub type SignalHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void);

pub fn register(handler: SignalHandler) -> Result<()> {
    let handler = signal::SigHandler::SigAction(handler);
    let sigaction = signal::SigAction::new(
        handler,
        signal::SaFlags::SA_SIGINFO | signal::SaFlags::SA_RESTART,
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGPROF, &sigaction) }?;

    Ok(())
}

pub fn unregister() -> Result<()> {
    let handler = signal::SigHandler::SigIgn;
    unsafe { signal::signal(signal::SIGPROF, handler) }?;

    Ok(())
}

/// Restores the interrupted code's `errno` when dropped.
pub struct ErrnoProtector(libc::c_int);

impl ErrnoProtector {
    pub fn new() -> Self {
        unsafe {
            #[cfg(target_os = "linux")]
            {
                let errno = *libc::__errno_location();
                Self(errno)
            }
            #[cfg(target_os = "macos")]
            {
                let errno = *libc::__error();
                Self(errno)
            }
        }
    }
}

impl Default for ErrnoProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrnoProtector {
    fn drop(&mut self) {
        unsafe {
            #[cfg(target_os = "linux")]
            {
                *libc::__errno_location() = self.0;
            }
            #[cfg(target_os = "macos")]
            {
                *libc::__error() = self.0;
            }
        }
    }
}

/// Program counter of the code a signal interrupted, or 0 when it cannot
/// be recovered on this platform.
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    allow(unused_variables)
)]
pub fn interrupted_pc(ucontext: *mut libc::c_void) -> usize {
    if ucontext.is_null() {
        return 0;
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        let ucontext: *mut libc::ucontext_t = ucontext as *mut libc::ucontext_t;

        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        let addr = unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize };

        #[cfg(all(target_arch = "x86_64", target_os = "macos"))]
        let addr = unsafe {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                0
            } else {
                (*mcontext).__ss.__rip as usize
            }
        };

        #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
        let addr = unsafe { (*ucontext).uc_mcontext.pc as usize };

        #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
        let addr = unsafe {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                0
            } else {
                (*mcontext).__ss.__pc as usize
            }
        };

        addr
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        0
    }
}
