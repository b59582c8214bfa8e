//! Debug assertion macros for the structural invariants of buffers and
//! listeners. The checks walk stored frames and linked state, so they are
//! gated to debug builds; release builds pay nothing.

/// Assert that the recorded message count and byte length agree with an
/// actual walk over the stored frames.
///
/// Checked after every mutation of a buffer's stored content.
macro_rules! debug_assert_frame_accounting {
    ($state:expr) => {
        if cfg!(debug_assertions) {
            let walk = crate::codec::count_frames($state.mem.bytes());
            debug_assert!(
                walk == Some(($state.msg_count, $state.mem.len())),
                "frame accounting violated: {} messages recorded over {} bytes, walk found {:?}",
                $state.msg_count,
                $state.mem.len(),
                walk
            );
        }
    };
}

/// Assert the shape of a listener's ready list: every entry refers to an
/// attached, readable (non-closed, non-aborted, non-empty) buffer exactly
/// once, every readable attached buffer is listed, and the `on_ready`
/// flags agree with list membership.
macro_rules! debug_assert_ready_wellformed {
    ($ls:expr) => {
        if cfg!(debug_assertions) {
            let ls = &*$ls;
            for id in &ls.ready {
                let hits = ls.ready.iter().filter(|x| *x == id).count();
                debug_assert!(hits == 1, "buffer {} appears {} times on the ready list", id, hits);
                let readable = ls.attached.iter().any(|a| {
                    a.id == *id
                        && a.state.on_ready
                        && !a.state.closed
                        && !a.state.aborted
                        && !a.state.mem.is_empty()
                });
                debug_assert!(readable, "ready entry {} is not a readable attached buffer", id);
            }
            for a in &ls.attached {
                if !a.state.closed && !a.state.aborted && !a.state.mem.is_empty() {
                    debug_assert!(
                        a.state.on_ready,
                        "readable attached buffer {} missing from the ready list",
                        a.id
                    );
                }
                debug_assert!(
                    a.state.on_ready == ls.ready.contains(&a.id),
                    "on_ready flag out of sync for buffer {}",
                    a.id
                );
            }
        }
    };
}

pub(crate) use debug_assert_frame_accounting;
pub(crate) use debug_assert_ready_wellformed;
