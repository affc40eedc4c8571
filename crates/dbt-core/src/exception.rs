//! Component B: the Exception Handler.
//!
//! Installs a process-wide fault handler once per process and lets any
//! number of [`Arena`](crate::arena::Arena)s register the host-address
//! range their emitted code occupies, along with a callback to consult when
//! a fault lands inside that range (`spec.md` §4.B, §4.H). This is the
//! mechanism fastmem redirects ride on: a guest memory access compiled as a
//! raw host load/store faults when it steps outside the guest's backing
//! mapping, and the handler steers the faulting thread to a fixup stub
//! instead of letting the process die.
//!
//! Modeled on the original implementation's split between
//! `exception_handler_posix.cpp` (a real `sigaction`-based handler) and
//! `exception_handler_generic.cpp` (fastmem simply unsupported). This crate
//! follows the same split: a real handler under `cfg(unix)`, a no-op
//! fallback everywhere else.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Consulted when a fault lands inside a registered arena's code range.
///
/// `fault_host_pc` is the host instruction pointer at the moment of the
/// fault. Returning `Some(resume_host_pc)` redirects the faulting thread
/// there (typically a fixup stub emitted alongside the faulting
/// instruction, per `spec.md` §4.H `FastmemPatchInfo::fake_call`);
/// returning `None` lets the fault propagate as if this handler were never
/// installed.
pub trait FaultHandler: Send + Sync {
    fn handle(&self, fault_host_pc: usize) -> Option<usize>;
}

struct Registration {
    code_begin: usize,
    code_end: usize,
    handler: Arc<dyn FaultHandler>,
}

struct Registry {
    entries: Mutex<Vec<Registration>>,
}

impl Registry {
    fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(|| Registry {
            entries: Mutex::new(Vec::new()),
        })
    }

    fn dispatch(&self, fault_host_pc: usize) -> Option<usize> {
        // Linear scan, not an interval tree: the number of live arenas is
        // tiny (one per façade) and this path only runs on the rare fault,
        // never the hot path (`spec.md` §4.B note).
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| (e.code_begin..e.code_end).contains(&fault_host_pc))
            .and_then(|e| e.handler.handle(fault_host_pc))
    }
}

/// A live registration of one arena's code range with the process-wide
/// handler. Dropping this removes the registration; it does not uninstall
/// the process-wide signal handler itself, which remains armed for the
/// lifetime of the process (matching the original implementation: installing
/// it twice is harmless, and there is no safe point at which to restore the
/// previous handler once other arenas may also depend on it).
pub struct ExceptionHandler {
    code_begin: usize,
    code_end: usize,
}

impl ExceptionHandler {
    /// Register `[code_begin, code_end)` — typically an [`Arena`]'s full
    /// mapping — with `handler`, installing the process-wide signal handler
    /// on first use.
    pub fn install(
        code_begin: usize,
        code_end: usize,
        handler: Arc<dyn FaultHandler>,
    ) -> Result<ExceptionHandler> {
        platform::ensure_installed()?;
        Registry::global().entries.lock().push(Registration {
            code_begin,
            code_end,
            handler,
        });
        Ok(ExceptionHandler {
            code_begin,
            code_end,
        })
    }

    /// Whether this host supports fastmem-style fault redirection at all
    /// (`spec.md` §4.H, §6 `fastmem`). `false` on any host without a
    /// concrete handler, in which case [`Config::fastmem`](crate::config::Config::fastmem)
    /// should not be set.
    #[must_use]
    pub fn supports_fastmem() -> bool {
        platform::SUPPORTED
    }
}

impl Drop for ExceptionHandler {
    fn drop(&mut self) {
        let mut entries = Registry::global().entries.lock();
        entries.retain(|e| !(e.code_begin == self.code_begin && e.code_end == self.code_end));
    }
}

#[cfg(unix)]
mod platform {
    use super::Registry;
    use crate::error::{Error, Result};
    use std::sync::{Once, OnceLock};

    pub const SUPPORTED: bool = true;

    static INSTALL: Once = Once::new();

    /// The `sigaction`s that were installed for SIGSEGV/SIGBUS before this
    /// crate's handler took over, captured once at install time. The
    /// platform handler chains to these for any fault outside every
    /// registered arena (`spec.md` §4.B "chain to the previously installed
    /// handler for unrelated faults"), matching
    /// `exception_handler_posix.cpp`'s `old_sa_segv`/`old_sa_bus`.
    struct OldActions {
        segv: libc::sigaction,
        bus: libc::sigaction,
    }

    static OLD_ACTIONS: OnceLock<OldActions> = OnceLock::new();

    pub fn ensure_installed() -> Result<()> {
        let mut install_err = None;
        INSTALL.call_once(|| {
            if let Err(e) = install_handler() {
                install_err = Some(e);
            }
        });
        match install_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn install_handler() -> Result<()> {
        let mut old_segv: libc::sigaction = unsafe { std::mem::zeroed() };
        let mut old_bus: libc::sigaction = unsafe { std::mem::zeroed() };

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = signal_trampoline as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            let slots = [libc::SIGSEGV, libc::SIGBUS]
                .into_iter()
                .zip([&mut old_segv, &mut old_bus]);
            for (signum, old) in slots {
                if libc::sigaction(signum, &action, old) != 0 {
                    return Err(Error::ExceptionHandlerInstall(format!(
                        "sigaction({signum}) failed: {}",
                        std::io::Error::last_os_error()
                    )));
                }
            }
        }

        let _ = OLD_ACTIONS.set(OldActions {
            segv: old_segv,
            bus: old_bus,
        });
        Ok(())
    }

    extern "C" fn signal_trampoline(
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        // SAFETY: invoked by the kernel with a valid ucontext for the
        // faulting thread; only read here, matching
        // `exception_handler_posix.cpp`'s `GuestFaultAddress`/`pc` helpers.
        let Some(fault_pc) = (unsafe { read_pc(ucontext) }) else {
            reraise_default(signum, info, ucontext);
            return;
        };

        if let Some(resume_pc) = Registry::global().dispatch(fault_pc) {
            // SAFETY: redirecting the faulting thread's saved PC to a host
            // address the caller guaranteed is a valid fixup stub.
            unsafe { write_pc(ucontext, resume_pc) };
            return;
        }

        reraise_default(signum, info, ucontext);
    }

    /// Chains to whatever handler was installed for `signum` before this
    /// crate's, honoring `SIG_DFL`, `SIG_IGN`, and the `SA_SIGINFO` calling
    /// convention the prior handler registered under (`spec.md` §4.B).
    fn reraise_default(signum: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
        let Some(old) = OLD_ACTIONS.get().map(|actions| match signum {
            libc::SIGBUS => actions.bus,
            _ => actions.segv,
        }) else {
            // Nothing was ever captured (a fault reached this trampoline
            // before `install_handler` finished, which shouldn't happen):
            // fall back to the default disposition.
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
                libc::raise(signum);
            }
            return;
        };

        let handler = old.sa_sigaction;
        if handler == libc::SIG_DFL {
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
                libc::raise(signum);
            }
            return;
        }
        if handler == libc::SIG_IGN {
            return;
        }

        if old.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: `handler` was captured verbatim from a prior
            // `sigaction()` call that set `SA_SIGINFO`, so it is a valid
            // three-argument handler.
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                unsafe { std::mem::transmute(handler) };
            handler(signum, info, ucontext);
        } else {
            // SAFETY: `handler` was captured verbatim from a prior
            // `sigaction()` call without `SA_SIGINFO`, so it is a valid
            // one-argument handler.
            let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            handler(signum);
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn read_pc(ucontext: *mut libc::c_void) -> Option<usize> {
        let ctx = ucontext.cast::<libc::ucontext_t>();
        Some((*ctx).uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn write_pc(ucontext: *mut libc::c_void, pc: usize) {
        let ctx = ucontext.cast::<libc::ucontext_t>();
        (*ctx).uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn read_pc(ucontext: *mut libc::c_void) -> Option<usize> {
        let ctx = ucontext.cast::<libc::ucontext_t>();
        Some((*ctx).uc_mcontext.pc as usize)
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn write_pc(ucontext: *mut libc::c_void, pc: usize) {
        let ctx = ucontext.cast::<libc::ucontext_t>();
        (*ctx).uc_mcontext.pc = pc as u64;
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    unsafe fn read_pc(_ucontext: *mut libc::c_void) -> Option<usize> {
        None
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    unsafe fn write_pc(_ucontext: *mut libc::c_void, _pc: usize) {}
}

#[cfg(not(unix))]
mod platform {
    use crate::error::Result;

    pub const SUPPORTED: bool = false;

    pub fn ensure_installed() -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysRedirect(usize);
    impl FaultHandler for AlwaysRedirect {
        fn handle(&self, _fault_host_pc: usize) -> Option<usize> {
            Some(self.0)
        }
    }

    #[test]
    fn registration_is_found_by_dispatch_within_range() {
        let handler: Arc<dyn FaultHandler> = Arc::new(AlwaysRedirect(0xDEAD));
        let guard = ExceptionHandler::install(0x1000, 0x2000, handler).unwrap();
        assert_eq!(Registry::global().dispatch(0x1500), Some(0xDEAD));
        drop(guard);
        assert_eq!(Registry::global().dispatch(0x1500), None);
    }

    #[test]
    fn dispatch_outside_any_range_is_none() {
        let handler: Arc<dyn FaultHandler> = Arc::new(AlwaysRedirect(0xDEAD));
        let _guard = ExceptionHandler::install(0x9000, 0x9100, handler).unwrap();
        assert_eq!(Registry::global().dispatch(0x1), None);
    }
}
