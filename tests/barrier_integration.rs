//! Multi-process integration tests for the rendezvous barrier. Each test
//! forks real sibling processes (not threads) sharing a parent pid, since
//! the rendezvous region's correctness depends on cross-process shared
//! memory and `PTHREAD_PROCESS_SHARED` primitives that an in-process test
//! can't exercise.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, ForkResult, Pid};

use mpipin::barrier;
use mpipin::config::Placement;
use mpipin::error::Error;
use mpipin::rendezvous::RendezvousRegion;
use mpipin::types::{CpuBitmap, CpuRecord, NodeRecord, Topology};

/// `cargo test` runs every test as a thread inside one process, but the
/// rendezvous region is keyed by the real OS parent pid. Each test forks a
/// dedicated placeholder "cohort parent" that just sleeps, so concurrently
/// running tests never collide on the same shared-memory segment name the
/// way they would if they all keyed off the harness process's own pid.
struct CohortParent(Pid);

impl CohortParent {
    fn spawn() -> Self {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => loop {
                unsafe {
                    libc::pause();
                }
            },
            ForkResult::Parent { child } => CohortParent(child),
        }
    }

    fn pid(&self) -> Pid {
        self.0
    }
}

impl Drop for CohortParent {
    fn drop(&mut self) {
        let _ = kill(self.0, Signal::SIGKILL);
        let _ = waitpid(self.0, None);
    }
}

fn flat_topology(n: usize) -> Topology {
    let mut cpus = BTreeMap::new();
    let mut node_cpus = CpuBitmap::new();
    for cpu in 0..n {
        node_cpus.set(cpu);
        cpus.insert(
            cpu,
            CpuRecord {
                cpu_id: cpu,
                numa_node_id: 0,
                core_id: cpu as u32,
                package_id: 0,
                core_siblings: CpuBitmap::new(),
                thread_siblings: CpuBitmap::new(),
                caches: vec![],
            },
        );
    }
    let mut nodes = BTreeMap::new();
    nodes.insert(0, NodeRecord { node_id: 0, cpus: node_cpus });
    Topology { cpus, nodes }
}

/// Forks `n` children, each running `child_body` against a rendezvous
/// region keyed by this (the test harness) process's own pid, and collects
/// what each child writes back over its private socket pair, paired with
/// the child's own pid so callers can correlate rank assignment with pid
/// ordering (testable invariant 2).
fn run_cohort<F>(n: usize, available: CpuBitmap, child_body: F) -> Vec<(i32, Result<CpuBitmap, String>)>
where
    F: Fn(&RendezvousRegion, &Topology) -> Result<CpuBitmap, Error> + Copy,
{
    let topology = flat_topology(available.count_ones().max(1) * 4);
    let cohort_parent = CohortParent::spawn();
    let parent_pid = cohort_parent.pid();

    let mut sockets = Vec::with_capacity(n);
    let mut child_pids = Vec::with_capacity(n);

    for _ in 0..n {
        let (parent_sock, child_sock) = UnixStream::pair().expect("socketpair");
        match unsafe { fork() }.expect("fork") {
            ForkResult::Parent { child } => {
                drop(child_sock);
                sockets.push(parent_sock);
                child_pids.push(child);
            }
            ForkResult::Child => {
                drop(parent_sock);
                let (region, _created) = RendezvousRegion::open_or_create(parent_pid, n, available)
                    .expect("child failed to attach to rendezvous region");
                let result = child_body(&region, &topology);
                let mut sock = child_sock;
                let line = match result {
                    Ok(mask) => format!(
                        "OK {} {}\n",
                        getpid().as_raw(),
                        mask.iter_ones().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
                    ),
                    Err(e) => format!("ERR {} {e}\n", getpid().as_raw()),
                };
                let _ = sock.write_all(line.as_bytes());
                std::process::exit(0);
            }
        }
    }

    let mut results = Vec::with_capacity(n);
    for (mut sock, pid) in sockets.into_iter().zip(child_pids) {
        let mut buf = String::new();
        let _ = sock.read_to_string(&mut buf);
        let _ = waitpid(pid, None);

        let line = buf.trim();
        if let Some(rest) = line.strip_prefix("OK ") {
            let (pid_str, mask_str) = rest.split_once(' ').unwrap_or((rest, ""));
            let mut mask = CpuBitmap::new();
            if !mask_str.is_empty() {
                for cpu in mask_str.split(',') {
                    mask.set(cpu.parse().unwrap());
                }
            }
            results.push((pid_str.parse().unwrap(), Ok(mask)));
        } else {
            let rest = line.strip_prefix("ERR ").unwrap_or(line);
            let (pid_str, msg) = rest.split_once(' ').unwrap_or((rest, ""));
            results.push((pid_str.parse().unwrap_or(0), Err(msg.to_string())));
        }
    }

    if let Ok((region, _created)) = RendezvousRegion::open_or_create(parent_pid, n, available) {
        region.unlink();
    }
    results
}

#[test]
fn cohort_of_four_gets_disjoint_masks_covering_the_available_set() {
    let available = CpuBitmap::parse_range_list("0-15").unwrap();
    let results = run_cohort(4, available, |region, topology| {
        barrier::pin_process(region, 4, Placement::Compact, topology)
    });

    let masks: Vec<CpuBitmap> =
        results.into_iter().map(|(_pid, r)| r.expect("pin_process should succeed")).collect();
    assert_eq!(masks.len(), 4);

    let mut union = CpuBitmap::new();
    for mask in &masks {
        assert!(!union.intersects(mask), "ranks must not share cpus");
        assert_eq!(mask.count_ones(), 4);
        union = union.union(mask);
    }
    assert_eq!(union.count_ones(), 16);
}

/// Invariant 2 / scenario S1: rank 0 goes to the lowest-pid participant, and
/// that rank's mask contains the lowest-numbered available cpu (invariant
/// 6), regardless of which child the OS happened to fork last.
#[test]
fn lowest_pid_participant_receives_rank_zero() {
    let available = CpuBitmap::parse_range_list("0-15").unwrap();
    let results = run_cohort(4, available, |region, topology| {
        barrier::pin_process(region, 4, Placement::Compact, topology)
    });

    let mut by_pid: Vec<(i32, CpuBitmap)> = results
        .into_iter()
        .map(|(pid, r)| (pid, r.expect("pin_process should succeed")))
        .collect();
    by_pid.sort_by_key(|(pid, _)| *pid);

    let (lowest_pid, lowest_pid_mask) = by_pid[0];
    assert!(
        lowest_pid_mask.is_set(0),
        "lowest pid {lowest_pid} should be assigned the rank-0 mask seeded at cpu 0, got {lowest_pid_mask:?}"
    );

    // Every other participant's mask excludes cpu 0: rank 0 is held by
    // exactly one participant, the lowest pid.
    for (pid, mask) in &by_pid[1..] {
        assert!(!mask.is_set(0), "pid {pid} should not hold cpu 0 (reserved for rank 0)");
    }
}

#[test]
fn cohort_size_mismatch_is_reported_to_the_declaring_process() {
    let available = CpuBitmap::parse_range_list("0-7").unwrap();
    let topology = flat_topology(8);
    let cohort_parent = CohortParent::spawn();
    let parent_pid = cohort_parent.pid();

    let (region, _created) = RendezvousRegion::open_or_create(parent_pid, 2, available).unwrap();

    // A sibling arrives first and arms the cohort at ppn=2, then blocks
    // waiting for a second rank that never declares a matching size.
    let (_parent_sock, child_sock) = UnixStream::pair().expect("socketpair");
    let child = match unsafe { fork() }.expect("fork") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            drop(child_sock);
            let (region, _created) = RendezvousRegion::open_or_create(parent_pid, 2, available).unwrap();
            let _ = barrier::pin_process(&region, 2, Placement::Compact, &topology);
            std::process::exit(0);
        }
    };

    // Give the sibling a moment to arm the cohort before we declare a
    // mismatched size.
    std::thread::sleep(Duration::from_millis(200));

    let err = barrier::pin_process(&region, 3, Placement::Compact, &topology).unwrap_err();
    assert!(matches!(err, Error::CohortSizeMismatch { expected: 2, declared: 3 }));

    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    region.unlink();
}

#[test]
fn scatter_placement_spreads_ranks_across_available_cpus() {
    let available = CpuBitmap::parse_range_list("0-31").unwrap();
    let results = run_cohort(2, available, |region, topology| {
        barrier::pin_process(region, 2, Placement::Scatter, topology)
    });
    let masks: Vec<CpuBitmap> =
        results.into_iter().map(|(_pid, r)| r.expect("pin_process should succeed")).collect();
    let seeds: Vec<usize> = masks.iter().map(|m| m.lowest().unwrap()).collect();
    assert!(seeds[1].abs_diff(seeds[0]) >= 8, "scatter seeds should be spread apart, got {seeds:?}");
}

/// Scenario S6: two sibling launchers that inherited different affinity
/// masks must not silently share a cohort — the second attacher's
/// available-cpu set disagrees with the one the region was created with.
#[test]
fn differing_available_sets_yield_affinity_mismatch() {
    let creator_available = CpuBitmap::parse_range_list("0-7").unwrap();
    let attacher_available = CpuBitmap::parse_range_list("0-3").unwrap();
    let cohort_parent = CohortParent::spawn();
    let parent_pid = cohort_parent.pid();

    let (region, created) = RendezvousRegion::open_or_create(parent_pid, 2, creator_available).unwrap();
    assert!(created);

    let err = RendezvousRegion::open_or_create(parent_pid, 2, attacher_available).unwrap_err();
    assert!(matches!(err, Error::AffinityMismatch));

    region.unlink();
}

/// Scenario S5: a single-rank cohort execs its target program and the
/// launcher process's exit code is exactly the replaced program's.
#[test]
fn single_rank_launch_execs_and_exits_zero() {
    let status = std::process::Command::new(env!("CARGO_BIN_EXE_mpipin"))
        .args(["-p", "1", "/bin/true"])
        .status()
        .expect("failed to spawn mpipin binary");
    assert!(status.success(), "mpipin -p 1 /bin/true should exec and exit 0, got {status:?}");
}

#[test]
fn barrier_times_out_when_the_cohort_never_completes() {
    let available = CpuBitmap::parse_range_list("0-3").unwrap();
    let topology = flat_topology(4);
    let cohort_parent = CohortParent::spawn();
    let parent_pid = cohort_parent.pid();
    let (region, _created) = RendezvousRegion::open_or_create(parent_pid, 2, available).unwrap();

    let start = std::time::Instant::now();
    let err = barrier::pin_process(&region, 2, Placement::Compact, &topology).unwrap_err();
    assert!(matches!(err, Error::BarrierTimedOut { .. }));
    assert!(start.elapsed() < Duration::from_secs(60), "timeout should be bounded");
    region.unlink();
}
