//! Ctrl-C turns into a cancellation request instead of killing the process,
//! so the runner can checkpoint and mark the run failed. A second Ctrl-C
//! gets the default behaviour.

use crate::runner::CancelFlag;

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};

    use crate::runner::CancelFlag;

    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn on_sigint(_: libc::c_int) {
        if let Some(flag) = FLAG.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn install(cancel: &CancelFlag) -> bool {
        if FLAG.set(cancel.shared()).is_err() {
            return false;
        }
        let handler = on_sigint as extern "C" fn(libc::c_int);
        // SAFETY: the handler only stores to an atomic. SA_RESETHAND restores
        // the default disposition once it has run.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "could not install SIGINT handler"
            );
            return false;
        }
        true
    }
}

/// Route SIGINT to `cancel`. Only the first call has an effect; returns
/// whether this call installed the handler.
pub fn install(cancel: &CancelFlag) -> bool {
    #[cfg(unix)]
    return imp::install(cancel);
    #[cfg(not(unix))]
    {
        let _ = cancel;
        false
    }
}
