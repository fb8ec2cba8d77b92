//! Rendezvous Region: the shared-memory segment siblings attach to.
//!
//! The cross-process mutex and condition variables are raw
//! `libc::pthread_mutex_t` / `libc::pthread_cond_t` placed directly in the
//! mapped region with `PTHREAD_PROCESS_SHARED`, since no crate in this
//! codebase's dependency stack wraps cross-process pthread primitives. They
//! are encapsulated behind [`ShmMutex`] / [`ShmCondvar`] so nothing above
//! this module touches a raw handle.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::time::Duration;

use nix::fcntl::{flock, FlockArg, OFlag};
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{ftruncate, Pid};

use crate::error::{Error, Result};
use crate::types::CpuBitmap;

/// Number of participant slots the rendezvous region can hold. The original
/// protocol's capacity; generous headroom over any realistic single-node
/// process count.
pub const COHORT_CAPACITY: usize = 1024;

/// Extra bytes mapped past `size_of::<CohortState>()`, matching the "at
/// least sizeof(CohortState) + 4096" sizing rule.
const SEGMENT_SLACK: usize = 4096;

fn shm_error(e: nix::Error) -> Error {
    Error::SharedMemory(e)
}

/// A `pthread_mutex_t` living in shared memory, cross-process by
/// construction.
#[repr(C)]
pub struct ShmMutex {
    raw: libc::pthread_mutex_t,
}

impl ShmMutex {
    /// Initializes a mutex at `ptr` in place with `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    /// `ptr` must point to valid, writable memory large enough for
    /// `ShmMutex` that no other thread is concurrently initializing.
    pub unsafe fn init_in_place(ptr: *mut ShmMutex) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        pthread_call(libc::pthread_mutexattr_init(&mut attr))?;
        let attr_result = pthread_call(libc::pthread_mutexattr_setpshared(
            &mut attr,
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|_| pthread_call(libc::pthread_mutex_init(ptr::addr_of_mut!((*ptr).raw), &attr)));
        libc::pthread_mutexattr_destroy(&mut attr);
        attr_result
    }

    fn lock_raw(&self) -> Result<()> {
        pthread_call(unsafe { libc::pthread_mutex_lock(self.raw_ptr()) })
    }

    fn unlock_raw(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.raw_ptr());
        }
    }

    fn raw_ptr(&self) -> *mut libc::pthread_mutex_t {
        &self.raw as *const _ as *mut _
    }

    /// Locks the mutex, returning a guard that unlocks on drop.
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>> {
        self.lock_raw()?;
        Ok(ShmMutexGuard { mutex: self })
    }
}

/// RAII guard over a locked [`ShmMutex`].
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl ShmMutexGuard<'_> {
    /// Waits on `cond` until signaled or `deadline` (CLOCK_MONOTONIC)
    /// elapses. Returns `Ok(true)` if the wait timed out.
    pub fn wait_until(&self, cond: &ShmCondvar, deadline: &libc::timespec) -> Result<bool> {
        let rc = unsafe { libc::pthread_cond_timedwait(cond.raw_ptr(), self.mutex.raw_ptr(), deadline) };
        match rc {
            0 => Ok(false),
            libc::ETIMEDOUT => Ok(true),
            e => Err(shm_error(nix::Error::from_raw(e))),
        }
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_raw();
    }
}

/// A `pthread_cond_t` living in shared memory, clocked off
/// `CLOCK_MONOTONIC` so timeouts are immune to wall-clock adjustments.
#[repr(C)]
pub struct ShmCondvar {
    raw: libc::pthread_cond_t,
}

impl ShmCondvar {
    /// Initializes a condvar at `ptr` in place with `PTHREAD_PROCESS_SHARED`
    /// and a monotonic clock.
    ///
    /// # Safety
    /// Same requirements as [`ShmMutex::init_in_place`].
    pub unsafe fn init_in_place(ptr: *mut ShmCondvar) -> Result<()> {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        pthread_call(libc::pthread_condattr_init(&mut attr))?;
        let result = pthread_call(libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED))
            .and_then(|_| pthread_call(libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC)))
            .and_then(|_| pthread_call(libc::pthread_cond_init(ptr::addr_of_mut!((*ptr).raw), &attr)));
        libc::pthread_condattr_destroy(&mut attr);
        result
    }

    fn raw_ptr(&self) -> *mut libc::pthread_cond_t {
        &self.raw as *const _ as *mut _
    }

    pub fn signal(&self) -> Result<()> {
        pthread_call(unsafe { libc::pthread_cond_signal(self.raw_ptr()) })
    }
}

fn pthread_call(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(shm_error(nix::Error::from_raw(rc)))
    }
}

/// An absolute `CLOCK_MONOTONIC` deadline `after` from now, for use with
/// [`ShmMutexGuard::wait_until`].
pub fn monotonic_deadline(after: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    let mut sec = now.tv_sec + after.as_secs() as i64;
    let mut nsec = now.tv_nsec + i64::from(after.subsec_nanos());
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec { tv_sec: sec, tv_nsec: nsec }
}

/// One entry in the rendezvous region's participant array.
#[repr(C)]
pub struct ParticipantSlot {
    /// 0 = free.
    pub pid: i32,
    pub ready: bool,
    pub timeout: bool,
    /// -1 = end of list.
    pub next_index: i64,
    pub condvar: ShmCondvar,
}

/// The full cohort state, mapped directly onto the shared memory segment.
#[repr(C)]
pub struct CohortState {
    pub mutex: ShmMutex,
    /// -1 = idle/empty cohort.
    pub expected_size: i64,
    pub still_to_arrive: i64,
    pub elected_rank_counter: i64,
    pub available_cpus: CpuBitmap,
    pub cpus_per_process: i64,
    /// -1 = empty list.
    pub head_of_queue_index: i64,
    pub slots: [ParticipantSlot; COHORT_CAPACITY],
    pub affinities: [CpuBitmap; COHORT_CAPACITY],
}

impl CohortState {
    /// First-arrival initialization, performed under the segment's file
    /// lock before any participant touches the mutex.
    ///
    /// # Safety
    /// `state` must point at a freshly zeroed, correctly sized mapping that
    /// no other process is concurrently initializing.
    pub unsafe fn init(state: *mut CohortState, ppn: usize, available: CpuBitmap) -> Result<()> {
        ptr::write_bytes(state as *mut u8, 0, std::mem::size_of::<CohortState>());

        ShmMutex::init_in_place(ptr::addr_of_mut!((*state).mutex))?;
        (*state).expected_size = -1;
        (*state).still_to_arrive = -1;
        (*state).head_of_queue_index = -1;
        (*state).available_cpus = available;
        (*state).cpus_per_process = (available.count_ones() / ppn) as i64;

        let slots_ptr = ptr::addr_of_mut!((*state).slots) as *mut ParticipantSlot;
        for i in 0..COHORT_CAPACITY {
            let slot = slots_ptr.add(i);
            (*slot).next_index = -1;
            ShmCondvar::init_in_place(ptr::addr_of_mut!((*slot).condvar))?;
        }
        Ok(())
    }
}

/// A live attachment to a cohort's shared memory segment.
pub struct RendezvousRegion {
    ptr: NonNull<CohortState>,
    fd: OwnedFd,
    name: String,
}

unsafe impl Send for RendezvousRegion {}

impl RendezvousRegion {
    /// Segment name for a given ancestor parent pid, matching
    /// `"/mpipin.<parent_pid>.shm"`.
    pub fn segment_name(parent_pid: Pid) -> String {
        format!("/mpipin.{}.shm", parent_pid.as_raw())
    }

    /// Opens (creating if necessary) the rendezvous region keyed by
    /// `parent_pid`, initializing it if this call is the first arrival.
    /// Returns the region and whether this call created it.
    pub fn open_or_create(
        parent_pid: Pid,
        ppn: usize,
        available: CpuBitmap,
    ) -> Result<(RendezvousRegion, bool)> {
        let name = Self::segment_name(parent_pid);
        let cname = CString::new(name.clone()).expect("segment name has no interior NUL");

        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IXUSR,
        )
        .map_err(shm_error)?;

        flock(fd.as_fd(), FlockArg::LockExclusive).map_err(shm_error)?;

        let segment_size = std::mem::size_of::<CohortState>() + SEGMENT_SLACK;
        let current_size = nix::sys::stat::fstat(fd.as_fd()).map_err(shm_error)?.st_size as usize;
        let created = current_size == 0;
        if created {
            ftruncate(fd.as_fd(), segment_size as i64).map_err(shm_error)?;
        }

        let map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(segment_size).expect("segment size is never zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(shm_error)?;
        let ptr: NonNull<CohortState> = map.cast();

        if created {
            unsafe {
                CohortState::init(ptr.as_ptr(), ppn, available)?;
            }
        }

        flock(fd.as_fd(), FlockArg::Unlock).map_err(shm_error)?;

        let region = RendezvousRegion { ptr, fd, name };

        if !created {
            let existing = unsafe { (*ptr.as_ptr()).available_cpus };
            if existing != available {
                return Err(Error::AffinityMismatch);
            }
        }

        Ok((region, created))
    }

    /// Borrows the mapped cohort state.
    pub fn state(&self) -> &CohortState {
        unsafe { self.ptr.as_ref() }
    }

    /// Raw pointer to the mapped cohort state, for the barrier protocol to
    /// mutate fields under the region's mutex. Cross-process shared memory
    /// can't be modeled by the borrow checker as a bare `&mut`, so callers
    /// take the pointer and dereference inside their own `unsafe` blocks
    /// while holding the lock.
    pub fn state_ptr(&self) -> *mut CohortState {
        self.ptr.as_ptr()
    }

    /// Best-effort removal of the segment's name from the filesystem; the
    /// mapping stays valid for processes that already attached.
    pub fn unlink(&self) {
        let cname = CString::new(self.name.clone()).expect("segment name has no interior NUL");
        if let Err(e) = shm_unlink(cname.as_c_str()) {
            tracing::debug!(error = %e, segment = %self.name, "shm_unlink failed, likely raced a sibling");
        }
    }
}

impl Drop for RendezvousRegion {
    fn drop(&mut self) {
        let size = std::mem::size_of::<CohortState>() + SEGMENT_SLACK;
        unsafe {
            let _ = munmap(self.ptr.cast(), size);
        }
        let _ = &self.fd;
    }
}
