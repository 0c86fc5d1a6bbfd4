//! Scheduling order and Once/Repeated semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use slate::config::{ConfigStore, ConfigValue, MemoryConfig};
use slate::core::{TaskKind, TaskSpec, TaskState};
use slate::Core;

use crate::fixtures::{wait_until, Harness, Latch};

/// Test: the three-task scenario across two pools
/// Given pools io:2 and cpu:4, A (cpu, Once), B (io, Repeated, [A]), C (cpu, Repeated, [B])
/// When two cycles run
/// Then cycle 1 runs A, B, C in that order and cycle 2 runs only B, C
#[test]
fn test_two_pool_scenario() {
    let h = Harness::new(&[("io", 2), ("cpu", 4)]);
    h.once("A", "cpu", &[]);
    h.repeated("B", "io", &["A"]);
    h.repeated("C", "cpu", &["B"]);
    h.core.finalize().unwrap();

    let first = h.core.run_cycle().unwrap();
    assert_eq!(first.cycle, 1);
    assert_eq!(first.completed, vec!["A", "B", "C"]);
    assert_eq!(h.trace.starts(), vec!["A", "B", "C"]);
    assert!(h.trace.end_of("A", 0) < h.trace.start_of("B", 0));
    assert!(h.trace.end_of("B", 0) < h.trace.start_of("C", 0));
    assert_eq!(h.core.task_state("A").unwrap(), TaskState::Retired);

    h.trace.clear();
    let second = h.core.run_cycle().unwrap();
    assert_eq!(second.cycle, 2);
    assert_eq!(second.completed, vec!["B", "C"]);
    assert_eq!(h.trace.starts(), vec!["B", "C"]);
    assert_eq!(h.core.run_count("A").unwrap(), 1);
    assert_eq!(h.core.run_count("B").unwrap(), 2);
}

/// Test: topological soundness over a wider graph
/// Given a layered graph spread over two pools
/// When several cycles run
/// Then no task ever starts before all its dependencies have ended
#[test]
fn test_dependencies_end_before_dependents_start() {
    let h = Harness::new(&[("io", 2), ("cpu", 3)]);
    let graph: &[(&str, &str, &[&str])] = &[
        ("load", "io", &[]),
        ("parse", "cpu", &["load"]),
        ("config", "io", &[]),
        ("physics", "cpu", &["parse", "config"]),
        ("ai", "cpu", &["parse"]),
        ("audio", "io", &["config"]),
        ("render", "cpu", &["physics", "ai"]),
        ("present", "io", &["render", "audio"]),
    ];
    for (name, pool, deps) in graph {
        h.repeated(name, pool, deps);
    }
    h.core.finalize().unwrap();

    for cycle in 0..5 {
        let report = h.core.run_cycle().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.completed.len(), graph.len());

        for (name, _, deps) in graph {
            let start = h.trace.start_of(name, cycle).unwrap();
            for dep in *deps {
                let end = h.trace.end_of(dep, cycle).unwrap();
                assert!(end < start, "{} started before {} ended", name, dep);
            }
        }
    }
}

/// Test: a Once task runs exactly once
/// Given a Once task with a Repeated dependent
/// When five cycles run
/// Then the Once body ran once and the dependent ran every cycle
#[test]
fn test_once_runs_exactly_once() {
    let h = Harness::new(&[("cpu", 2)]);
    h.once("boot", "cpu", &[]);
    h.repeated("frame", "cpu", &["boot"]);
    h.core.finalize().unwrap();

    for _ in 0..5 {
        h.core.run_cycle().unwrap();
    }
    assert_eq!(h.trace.count("boot"), 1);
    assert_eq!(h.trace.count("frame"), 5);
    assert_eq!(h.core.task_state("boot").unwrap(), TaskState::Retired);
}

/// Test: Repeated tasks run once per cycle
#[test]
fn test_repeated_runs_once_per_cycle() {
    let h = Harness::new(&[("cpu", 4)]);
    for name in ["a", "b", "c", "d", "e"] {
        h.repeated(name, "cpu", &[]);
    }
    h.core.finalize().unwrap();

    for cycle in 1..=4u64 {
        let report = h.core.run_cycle().unwrap();
        assert_eq!(report.completed.len(), 5);
        for name in ["a", "b", "c", "d", "e"] {
            assert_eq!(h.core.run_count(name).unwrap(), cycle);
        }
    }
    assert_eq!(h.core.cycle_count(), 4);
}

/// Test: tasks ready together are submitted in registration order
/// Given a single-threaded pool and tasks registered as zeta, alpha, mid
/// When a cycle runs
/// Then they start in registration order, not name order
#[test]
fn test_tie_break_is_registration_order() {
    let h = Harness::new(&[("solo", 1)]);
    h.repeated("root", "solo", &[]);
    h.repeated("zeta", "solo", &["root"]);
    h.repeated("alpha", "solo", &["root"]);
    h.repeated("mid", "solo", &["root"]);
    h.core.finalize().unwrap();

    for _ in 0..3 {
        h.trace.clear();
        h.core.run_cycle().unwrap();
        assert_eq!(h.trace.starts(), vec!["root", "zeta", "alpha", "mid"]);
    }
}

/// Test: the cycle is a wavefront, not a barrier
/// Given a slow task and a fast task with a child
/// When the cycle runs
/// Then the child starts while the slow task is still running
#[test]
fn test_wavefront_dispatches_without_barrier() {
    let h = Harness::new(&[("cpu", 3)]);
    let child_ran = Latch::new();

    let gate = child_ran.clone();
    h.core
        .add_repeated("slow", "cpu", &[], move |_| {
            if gate.wait() {
                Ok(())
            } else {
                Err("child never ran while slow was running".into())
            }
        })
        .unwrap();
    h.repeated("fast", "cpu", &[]);
    let signal = child_ran.clone();
    h.core
        .add_repeated("child", "cpu", &["fast"], move |_| {
            signal.open();
            Ok(())
        })
        .unwrap();
    h.core.finalize().unwrap();

    let report = h.core.run_cycle().unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.completed.last().map(String::as_str), Some("slow"));
}

/// Test: pools run task bodies in parallel
/// Given four independent tasks on a four-thread pool that each wait for the others
/// When the cycle runs
/// Then all four finish
#[test]
fn test_independent_tasks_run_in_parallel() {
    let h = Harness::new(&[("cpu", 4)]);
    let arrived = Arc::new(AtomicUsize::new(0));

    for name in ["w0", "w1", "w2", "w3"] {
        let arrived = Arc::clone(&arrived);
        h.core
            .add_repeated(name, "cpu", &[], move |_| {
                arrived.fetch_add(1, Ordering::SeqCst);
                if wait_until(|| arrived.load(Ordering::SeqCst) >= 4) {
                    Ok(())
                } else {
                    Err("peers never arrived".into())
                }
            })
            .unwrap();
    }
    h.core.finalize().unwrap();

    let report = h.core.run_cycle().unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.completed.len(), 4);
}

/// Test: tasks registered by a running body join the next cycle
#[test]
fn test_tasks_registered_mid_cycle_join_next_cycle() {
    let h = Harness::new(&[("cpu", 2)]);
    let trace = h.trace.clone();
    h.core
        .add_once("spawner", "cpu", &[], move |core| {
            let trace = trace.clone();
            core.register_task(
                TaskSpec::repeated("spawned", "cpu", move |_| {
                    trace.record("spawned");
                    Ok(())
                })
                .depends_on(["spawner"]),
            )?;
            core.finalize()?;
            Ok(())
        })
        .unwrap();
    h.core.finalize().unwrap();

    let first = h.core.run_cycle().unwrap();
    assert_eq!(first.completed, vec!["spawner"]);
    assert_eq!(h.trace.count("spawned"), 0);
    assert_eq!(h.core.task_state("spawned").unwrap(), TaskState::Pending);

    let second = h.core.run_cycle().unwrap();
    assert_eq!(second.completed, vec!["spawned"]);
}

/// Test: concurrent run_cycle callers are serialized
#[test]
fn test_concurrent_cycles_are_serialized() {
    let h = Harness::new(&[("cpu", 2)]);
    let running = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    {
        let running = Arc::clone(&running);
        let overlap = Arc::clone(&overlap);
        h.core
            .add_repeated("tick", "cpu", &[], move |_| {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(std::time::Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    h.core.finalize().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let core = Arc::clone(&h.core);
            thread::spawn(move || core.run_cycle().unwrap())
        })
        .collect();
    let mut cycles: Vec<u64> = handles.into_iter().map(|t| t.join().unwrap().cycle).collect();
    cycles.sort();

    assert_eq!(cycles, vec![1, 2, 3, 4]);
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert_eq!(h.core.run_count("tick").unwrap(), 4);
}

/// Test: task bodies read and write the config collaborator
#[test]
fn test_bodies_share_config() {
    let config = MemoryConfig::new();
    config.set("sim.dt", ConfigValue::Real(0.5));
    let core = Core::builder().config(config).build();
    core.add_pool("cpu", 1).unwrap();
    core.add_task(
        "integrate",
        "cpu",
        |core: &Core| {
            let t = core.config().get_float("sim.t", 0.0) + core.config().get_float("sim.dt", 0.0);
            core.config().set("sim.t", ConfigValue::Real(t));
            Ok(())
        },
        TaskKind::Repeated,
        &[],
    )
    .unwrap();
    core.finalize().unwrap();

    for _ in 0..4 {
        core.run_cycle().unwrap();
    }
    assert_eq!(core.config().get_float("sim.t", 0.0), 2.0);
}
