//! Barrier Protocol: the algorithm by which each participant joins the
//! ordered participant list, waits for the cohort to complete, then is woken
//! in list order to consume its pre-computed affinity.
//!
//! Rank assignment is by ascending pid of *arrived* participants, not
//! arrival order. A late-starting low-pid process can still land on rank 0
//! even if it arrived last in wall-clock time; this is deliberate, since it
//! is what makes pinning reproducible across re-runs when the set of pids is
//! stable, not an oversight.
//!
//! `still_to_arrive` is a single shared-memory field reused for two
//! purposes across the protocol's two phases: during arrival it counts
//! participants not yet joined; after election it is reinterpreted as
//! "ranks not yet consumed". The field is not renamed or split (that would
//! change the wire layout), but each phase's decrement is commented at the
//! point of use below so the two meanings stay distinct for a reader.

use std::ptr;
use std::time::Duration;

use nix::unistd::getpid;

use crate::config::Placement;
use crate::error::{Error, Result};
use crate::partitioner;
use crate::rendezvous::{monotonic_deadline, CohortState, RendezvousRegion, ShmMutexGuard, COHORT_CAPACITY};
use crate::types::{CpuBitmap, Topology};

/// Base barrier timeout; the deadline is this plus 0.1s per expected
/// participant.
const BASE_TIMEOUT: Duration = Duration::from_secs(10);
const PER_PARTICIPANT_TIMEOUT: Duration = Duration::from_millis(100);

fn wait_deadline(expected_size: i64) -> (libc::timespec, Duration) {
    let budget = BASE_TIMEOUT + PER_PARTICIPANT_TIMEOUT * expected_size.max(0) as u32;
    (monotonic_deadline(budget), budget)
}

/// Runs the full barrier protocol for this process: joins the cohort,
/// waits for it to complete (electing a partitioner if this call is the
/// last arrival), and returns the CPU affinity mask this rank was assigned.
pub fn pin_process(region: &RendezvousRegion, ppn: usize, placement: Placement, topology: &Topology) -> Result<CpuBitmap> {
    let state_ptr = region.state_ptr();
    let mutex = unsafe { &(*state_ptr).mutex };
    let guard = mutex.lock()?;

    unsafe {
        // Step A - cohort arming.
        if (*state_ptr).expected_size == -1 {
            (*state_ptr).expected_size = ppn as i64;
            (*state_ptr).still_to_arrive = ppn as i64;
            tracing::debug!(ppn, pid = %getpid(), "cohort armed by first arrival");
        } else if (*state_ptr).expected_size != ppn as i64 {
            return Err(Error::CohortSizeMismatch {
                expected: (*state_ptr).expected_size as usize,
                declared: ppn,
            });
        }
        (*state_ptr).still_to_arrive -= 1; // arrival-phase meaning

        // Step B - slot acquisition.
        let my_pid = getpid().as_raw();
        let my_idx = (0..COHORT_CAPACITY)
            .find(|&i| (*state_ptr).slots[i].pid == 0)
            .ok_or(Error::CohortFull { capacity: COHORT_CAPACITY })?;
        {
            let slot = &mut (*state_ptr).slots[my_idx];
            slot.pid = my_pid;
            slot.ready = false;
            slot.timeout = false;
            slot.next_index = -1;
        }

        // Step C - ordered insertion, ascending pid, ties broken by
        // insertion time.
        insert_ordered(state_ptr, my_idx, my_pid);

        let (deadline, budget) = wait_deadline((*state_ptr).expected_size);

        // Step D - election & wait.
        if (*state_ptr).still_to_arrive == 0 {
            let head_idx = (*state_ptr).head_of_queue_index;
            debug_assert!(head_idx >= 0, "a just-inserted slot makes the list non-empty");
            let head_idx = head_idx as usize;
            let elector_pid = (*state_ptr).slots[head_idx].pid;
            (*state_ptr).head_of_queue_index = (*state_ptr).slots[head_idx].next_index;
            (*state_ptr).slots[head_idx].ready = true;
            (*state_ptr).still_to_arrive = (*state_ptr).expected_size; // rank-consumption phase begins
            (*state_ptr).elected_rank_counter = 0;
            tracing::debug!(pid = %getpid(), elector_pid, ppn, "cohort complete, elector chosen");

            if head_idx != my_idx {
                (*state_ptr).slots[head_idx].condvar.signal()?;
                wait_for_signal(state_ptr, &guard, my_idx, &deadline, budget)?;
            }
            // Else: we are our own elected head. We already marked our slot
            // ready above; nothing will ever signal us, so we must not wait.
        } else {
            wait_for_signal(state_ptr, &guard, my_idx, &deadline, budget)?;
        }

        // Step E - partitioning, only performed by the first-woken
        // participant (the elector).
        if (*state_ptr).elected_rank_counter == 0 {
            let mut available = (*state_ptr).available_cpus;
            let cpus_per_process = (*state_ptr).cpus_per_process as usize;
            let n_ranks = (*state_ptr).expected_size as usize;
            match partitioner::partition(topology, &mut available, cpus_per_process, n_ranks, placement) {
                Ok(ranks) => {
                    tracing::debug!(pid = %getpid(), n_ranks, cpus_per_process, "partitioning complete");
                    for (rank, mask) in ranks.into_iter().enumerate() {
                        (*state_ptr).affinities[rank] = mask;
                    }
                }
                Err(e) => {
                    tracing::error!(pid = %getpid(), error = %e, "partitioning failed, broadcasting timeout");
                    timeout_broadcast(state_ptr, my_idx);
                    release_slot(state_ptr, my_idx);
                    return Err(e);
                }
            }
        }

        // Step F - affinity consumption and hand-off.
        (*state_ptr).still_to_arrive -= 1; // rank-consumption phase decrement
        if (*state_ptr).still_to_arrive == 0 {
            (*state_ptr).expected_size = -1;
            (*state_ptr).available_cpus = CpuBitmap::new();
        } else {
            let next_idx = (*state_ptr).head_of_queue_index;
            if next_idx >= 0 {
                let next_idx = next_idx as usize;
                (*state_ptr).head_of_queue_index = (*state_ptr).slots[next_idx].next_index;
                (*state_ptr).slots[next_idx].ready = true;
                (*state_ptr).slots[next_idx].condvar.signal()?;
            }
        }

        let rank = (*state_ptr).elected_rank_counter as usize;
        let affinity = (*state_ptr).affinities[rank];
        (*state_ptr).elected_rank_counter += 1;

        release_slot(state_ptr, my_idx);

        tracing::info!(pid = %getpid(), rank, cpus = ?affinity, "rank assigned affinity");

        Ok(affinity)
    }
}

unsafe fn release_slot(state_ptr: *mut CohortState, idx: usize) {
    let slot = &mut (*state_ptr).slots[idx];
    slot.pid = 0;
    slot.ready = false;
    slot.timeout = false;
    slot.next_index = -1;
}

/// Single condvar wait with the armed deadline, matching the protocol's
/// three-way outcome exactly (timed out / woken with timeout flag / woken
/// with ready unset) rather than looping and swallowing a spurious wake.
unsafe fn wait_for_signal(
    state_ptr: *mut CohortState,
    guard: &ShmMutexGuard<'_>,
    my_idx: usize,
    deadline: &libc::timespec,
    budget: Duration,
) -> Result<()> {
    let cond = ptr::addr_of!((*state_ptr).slots[my_idx].condvar);
    let timed_out = guard.wait_until(&*cond, deadline)?;

    if timed_out {
        timeout_broadcast(state_ptr, my_idx);
        return Err(Error::BarrierTimedOut { expected_size: ppn_at_timeout(state_ptr), waited: budget });
    }
    if (*state_ptr).slots[my_idx].timeout {
        release_slot(state_ptr, my_idx);
        return Err(Error::BarrierTimedOut { expected_size: ppn_at_timeout(state_ptr), waited: budget });
    }
    if !(*state_ptr).slots[my_idx].ready {
        return Err(Error::SpuriousWake);
    }
    Ok(())
}

/// `expected_size` has already been reset to -1 by the time we report a
/// timeout (ours or a sibling's broadcast); report 0 rather than a
/// misleading negative count.
unsafe fn ppn_at_timeout(state_ptr: *mut CohortState) -> usize {
    (*state_ptr).expected_size.max(0) as usize
}

/// Step C: ordered singly-linked insertion by ascending pid. Ties are
/// broken by insertion time: we walk past every node whose pid is less than
/// or equal to ours, so equal-pid predecessors keep their place ahead of us.
unsafe fn insert_ordered(state_ptr: *mut CohortState, my_idx: usize, my_pid: i32) {
    let head = (*state_ptr).head_of_queue_index;
    if head < 0 {
        (*state_ptr).head_of_queue_index = my_idx as i64;
        return;
    }

    let mut predecessor: Option<usize> = None;
    let mut cursor = head;
    while cursor >= 0 {
        let cursor_idx = cursor as usize;
        if (*state_ptr).slots[cursor_idx].pid > my_pid {
            break;
        }
        predecessor = Some(cursor_idx);
        cursor = (*state_ptr).slots[cursor_idx].next_index;
    }

    match predecessor {
        None => {
            (*state_ptr).slots[my_idx].next_index = head;
            (*state_ptr).head_of_queue_index = my_idx as i64;
        }
        Some(p) => {
            let successor = (*state_ptr).slots[p].next_index;
            (*state_ptr).slots[my_idx].next_index = successor;
            (*state_ptr).slots[p].next_index = my_idx as i64;
        }
    }
}

/// Step G - timeout broadcast: wake every other still-queued slot with its
/// timeout flag set, then reset the cohort to idle. Idempotent under the
/// mutex, so whichever waiter's deadline fires first drains the whole queue
/// and no one is left orphaned.
unsafe fn timeout_broadcast(state_ptr: *mut CohortState, my_idx: usize) {
    tracing::warn!(pid = %getpid(), "timeout broadcast: waking all remaining queued participants");
    let mut cursor = (*state_ptr).head_of_queue_index;
    while cursor >= 0 {
        let idx = cursor as usize;
        let next = (*state_ptr).slots[idx].next_index;
        if idx != my_idx {
            (*state_ptr).slots[idx].ready = true;
            (*state_ptr).slots[idx].timeout = true;
            let _ = (*state_ptr).slots[idx].condvar.signal();
        }
        cursor = next;
    }
    (*state_ptr).expected_size = -1;
    (*state_ptr).head_of_queue_index = -1;
    (*state_ptr).available_cpus = CpuBitmap::new();
}
