//! Host-side interrupt source for running machines as a Linux process.
//!
//! `SIGALRM` from an interval timer stands in for a hardware tick interrupt.
//! The signal handler must only do what an interrupt handler may do: atomic
//! operations and `Mailbox::post_pending`, typically through
//! [`crate::timer::TimerService::tick`].

use crate::mailbox::Mailbox;
use core::mem::MaybeUninit;

pub struct HostTick {
    running: bool,
}

fn interval(ms: u64) -> libc::itimerval {
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    libc::itimerval {
        it_interval: tv,
        it_value: tv,
    }
}

impl HostTick {
    /// Installs `handler` for `SIGALRM` and starts a periodic timer.
    ///
    /// # Safety
    /// Replaces the process-wide `SIGALRM` disposition and `ITIMER_REAL`.
    /// `handler` runs in signal context and must be async-signal-safe.
    pub unsafe fn start(handler: extern "C" fn(i32), interval_ms: u64) -> Result<Self, &'static str> {
        if interval_ms == 0 {
            return Err("Tick interval must be non-zero");
        }

        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGALRM);
        libc::sigprocmask(libc::SIG_BLOCK, set.as_ptr(), core::ptr::null_mut());

        // SA_RESTART keeps stdio in the main loop free of EINTR
        let mut sa = MaybeUninit::<libc::sigaction>::zeroed();
        libc::sigemptyset(&mut (*sa.as_mut_ptr()).sa_mask);
        (*sa.as_mut_ptr()).sa_flags = libc::SA_RESTART;
        (*sa.as_mut_ptr()).sa_sigaction = handler as usize;

        if libc::sigaction(libc::SIGALRM, sa.as_ptr(), core::ptr::null_mut()) == -1 {
            return Err("Failed to install signal handler");
        }

        let timer = interval(interval_ms);
        if libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut()) == -1 {
            return Err("Failed to set interval timer");
        }

        libc::sigprocmask(libc::SIG_UNBLOCK, set.as_ptr(), core::ptr::null_mut());
        Ok(HostTick { running: true })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        let timer = interval(0);
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &timer, core::ptr::null_mut());
        }
        self.running = false;
    }

    /// Sleeps until the next signal unless events are already pending.
    ///
    /// `SIGALRM` is blocked while the mailbox is checked, so a tick that
    /// lands between the check and the sleep still wakes the caller.
    pub fn idle(&self, mailbox: &Mailbox) {
        if !self.running {
            return;
        }
        unsafe {
            let mut block = MaybeUninit::<libc::sigset_t>::uninit();
            let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(block.as_mut_ptr());
            libc::sigaddset(block.as_mut_ptr(), libc::SIGALRM);
            libc::sigprocmask(libc::SIG_BLOCK, block.as_ptr(), previous.as_mut_ptr());

            if !mailbox.any_pending() {
                // the previous mask does not block SIGALRM
                libc::sigsuspend(previous.as_ptr());
            }

            libc::sigprocmask(libc::SIG_SETMASK, previous.as_ptr(), core::ptr::null_mut());
        }
    }
}

impl Drop for HostTick {
    fn drop(&mut self) {
        self.stop();
    }
}
