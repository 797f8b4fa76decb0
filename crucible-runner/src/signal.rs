// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signal plumbing for isolated test runs.
//!
//! While an isolated test runs, the parent owns the terminal, so an
//! interactive SIGINT or SIGQUIT lands on the parent alone. The forward
//! handler installed here relays the signal to the test's process group,
//! puts the original disposition back, and re-raises, so the whole tree
//! dies the way the user asked.
//!
//! SIGCHLD gets a no-op handler purely so that a child's death interrupts
//! `pselect`. The mask guard keeps SIGCHLD blocked everywhere else, which
//! closes the race between the child exiting and the parent entering its
//! read loop.

use crate::helpers::nix_to_io;
use nix::{
    sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
    },
    unistd::Pid,
};
use std::{
    cell::UnsafeCell,
    io,
    sync::atomic::{AtomicI32, Ordering},
};

/// The process group the forward handler relays to. Zero means no
/// isolated test is running.
static TEST_PGID: AtomicI32 = AtomicI32::new(0);

/// Saved dispositions for SIGINT (index 0) and SIGQUIT (index 1).
struct SavedActions(UnsafeCell<[Option<SigAction>; 2]>);

// Written only while the corresponding signals are blocked or their
// handlers are uninstalled; the handler only reads.
unsafe impl Sync for SavedActions {}

static SAVED_ACTIONS: SavedActions = SavedActions(UnsafeCell::new([None, None]));

fn saved_index(signum: libc::c_int) -> usize {
    usize::from(signum != libc::SIGINT)
}

pub(crate) fn set_forward_pgid(pgid: Pid) {
    let prev = TEST_PGID.swap(pgid.as_raw(), Ordering::SeqCst);
    debug_assert_eq!(prev, 0, "only one isolated test may run at a time");
}

pub(crate) fn clear_forward_pgid() {
    TEST_PGID.store(0, Ordering::SeqCst);
}

pub(crate) fn forward_pgid() -> Option<Pid> {
    match TEST_PGID.load(Ordering::SeqCst) {
        0 => None,
        raw => Some(Pid::from_raw(raw)),
    }
}

extern "C" fn forward_signal(signum: libc::c_int) {
    let pgid = TEST_PGID.load(Ordering::SeqCst);
    if pgid != 0 {
        unsafe {
            libc::killpg(pgid, signum);
        }
    }
    // Put the original disposition back, then let the signal run its
    // course against this process.
    unsafe {
        if let Some(old) = (*SAVED_ACTIONS.0.get())[saved_index(signum)] {
            if let Ok(signal) = Signal::try_from(signum) {
                let _ = sigaction(signal, &old);
            }
        }
        libc::raise(signum);
    }
}

extern "C" fn chld_noop(_: libc::c_int) {}

/// Blocks SIGCHLD, SIGINT, and SIGQUIT, restoring the prior mask on drop.
///
/// The runner blocks all three before forking. The child restores the
/// mask immediately; the parent unblocks the interactive pair once the
/// forward handlers are installed and leaves SIGCHLD blocked except
/// inside `pselect`.
#[derive(Debug)]
pub(crate) struct MaskGuard {
    original: SigSet,
}

impl MaskGuard {
    pub(crate) fn block_fork_signals() -> io::Result<Self> {
        let mut to_block = SigSet::empty();
        to_block.add(Signal::SIGCHLD);
        to_block.add(Signal::SIGINT);
        to_block.add(Signal::SIGQUIT);
        let mut original = SigSet::empty();
        sigprocmask(
            SigmaskHow::SIG_BLOCK,
            Some(&to_block),
            Some(&mut original),
        )
        .map_err(nix_to_io)?;
        Ok(Self { original })
    }

    /// Unblocks SIGINT and SIGQUIT; SIGCHLD stays blocked.
    pub(crate) fn unblock_interactive(&self) -> io::Result<()> {
        let mut interactive = SigSet::empty();
        interactive.add(Signal::SIGINT);
        interactive.add(Signal::SIGQUIT);
        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&interactive), None).map_err(nix_to_io)
    }

    /// Restores the mask saved at construction.
    pub(crate) fn restore(&self) -> io::Result<()> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original), None).map_err(nix_to_io)
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.original), None);
    }
}

/// Installs the forward handlers for SIGINT and SIGQUIT plus the SIGCHLD
/// wake-up handler, restoring all three dispositions on drop.
///
/// Install while all three signals are blocked: the saved actions must be
/// recorded before the forward handler can possibly run.
pub(crate) struct ForwardGuard {
    old_chld: SigAction,
}

impl ForwardGuard {
    pub(crate) fn install(pgid: Pid) -> io::Result<Self> {
        let forward = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let wake = SigAction::new(
            SigHandler::Handler(chld_noop),
            SaFlags::empty(),
            SigSet::empty(),
        );

        let old_int = unsafe { sigaction(Signal::SIGINT, &forward) }.map_err(nix_to_io)?;
        let old_quit = match unsafe { sigaction(Signal::SIGQUIT, &forward) } {
            Ok(old) => old,
            Err(errno) => {
                let _ = unsafe { sigaction(Signal::SIGINT, &old_int) };
                return Err(nix_to_io(errno));
            }
        };
        let old_chld = match unsafe { sigaction(Signal::SIGCHLD, &wake) } {
            Ok(old) => old,
            Err(errno) => {
                let _ = unsafe { sigaction(Signal::SIGINT, &old_int) };
                let _ = unsafe { sigaction(Signal::SIGQUIT, &old_quit) };
                return Err(nix_to_io(errno));
            }
        };

        unsafe {
            *SAVED_ACTIONS.0.get() = [Some(old_int), Some(old_quit)];
        }
        set_forward_pgid(pgid);
        Ok(Self { old_chld })
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        // Restore the real dispositions first; once they are back the
        // forward handler can no longer fire and the saved slots can be
        // cleared without a race.
        let saved = unsafe { *SAVED_ACTIONS.0.get() };
        if let Some(old) = saved[0] {
            let _ = unsafe { sigaction(Signal::SIGINT, &old) };
        }
        if let Some(old) = saved[1] {
            let _ = unsafe { sigaction(Signal::SIGQUIT, &old) };
        }
        let _ = unsafe { sigaction(Signal::SIGCHLD, &self.old_chld) };
        unsafe {
            *SAVED_ACTIONS.0.get() = [None, None];
        }
        clear_forward_pgid();
    }
}
