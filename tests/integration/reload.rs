//! Hot reload: quiescence, held dispatch and atomic swaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slate::core::{TaskSpec, TaskState};
use slate::module::{Interface, ModuleEvent, ModuleState, Version};
use slate::Error;

use crate::fixtures::{physics_version, wait_until, Harness, Latch, Physics, PhysicsSource};

const V100: Version = Version::new(1, 0, 0);
const V101: Version = Version::new(1, 0, 1);

fn with_physics(h: &Harness) {
    h.core
        .register_module("physics", V100, Interface::new(Physics::at(V100)))
        .unwrap();
}

/// Test: reload waits for a running module task
/// Given physics v1.0.0 and a physics task blocked mid-run
/// When a reload to v1.0.1 is requested
/// Then the reload waits for the task, the task sees v1.0.0 throughout,
/// and the next cycle's task sees v1.0.1
#[test]
fn test_reload_waits_for_running_task() {
    let h = Harness::new(&[("cpu", 2)]);
    with_physics(&h);

    let release = Latch::new();
    let started = Latch::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let (release, started, seen) = (release.clone(), started.clone(), Arc::clone(&seen));
        h.core
            .register_task(
                TaskSpec::repeated("physics.step", "cpu", move |core| {
                    let before = physics_version(core)?;
                    started.open();
                    release.wait();
                    let after = physics_version(core)?;
                    seen.lock().unwrap().push((before, after));
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();

    let core = Arc::clone(&h.core);
    let cycle = thread::spawn(move || core.run_cycle().unwrap());
    assert!(started.wait());

    let core = Arc::clone(&h.core);
    let reload = thread::spawn(move || {
        core.reload_module("physics", Interface::new(Physics::at(V101)), V101)
    });

    assert!(wait_until(|| h.core.module_state("physics") == ModuleState::Reloading));
    assert_eq!(h.core.get_version("physics").unwrap(), V100);
    assert_eq!(h.core.modules().in_flight("physics").unwrap(), 1);
    assert!(!reload.is_finished());

    release.open();
    let report = cycle.join().unwrap();
    assert_eq!(report.completed, vec!["physics.step"]);
    reload.join().unwrap().unwrap();

    assert_eq!(h.core.module_state("physics"), ModuleState::Active);
    assert_eq!(h.core.get_version("physics").unwrap(), V101);

    h.core.run_cycle().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(V100, V100), (V101, V101)]);
}

/// Test: module tasks are held while the module reloads
/// Given a blocked physics task and a second physics task gated on a plain task
/// When the module starts reloading and the gate opens
/// Then the second task is held in Ready until the swap, then runs on v1.0.1
#[test]
fn test_dispatch_held_during_reload() {
    let h = Harness::new(&[("cpu", 3)]);
    with_physics(&h);

    let slow_release = Latch::new();
    let slow_started = Latch::new();
    let gate_release = Latch::new();
    let observed = Arc::new(Mutex::new(None));
    {
        let (release, started) = (slow_release.clone(), slow_started.clone());
        h.core
            .register_task(
                TaskSpec::repeated("physics.slow", "cpu", move |_| {
                    started.open();
                    release.wait();
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    {
        let release = gate_release.clone();
        h.core
            .add_repeated("gate", "cpu", &[], move |_| {
                release.wait();
                Ok(())
            })
            .unwrap();
    }
    {
        let observed = Arc::clone(&observed);
        h.core
            .register_task(
                TaskSpec::repeated("physics.after", "cpu", move |core| {
                    *observed.lock().unwrap() = Some(physics_version(core)?);
                    Ok(())
                })
                .depends_on(["gate"])
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();

    let core = Arc::clone(&h.core);
    let cycle = thread::spawn(move || core.run_cycle().unwrap());
    assert!(slow_started.wait());

    let core = Arc::clone(&h.core);
    let reload = thread::spawn(move || {
        core.reload_module("physics", Interface::new(Physics::at(V101)), V101)
    });
    assert!(wait_until(|| h.core.module_state("physics") == ModuleState::Reloading));

    gate_release.open();
    assert!(wait_until(|| h.core.task_state("physics.after").unwrap() == TaskState::Ready));
    assert_eq!(h.core.run_count("physics.after").unwrap(), 0);

    slow_release.open();
    reload.join().unwrap().unwrap();
    let report = cycle.join().unwrap();

    assert!(report.is_clean());
    assert_eq!(report.completed.last().map(String::as_str), Some("physics.after"));
    assert_eq!(*observed.lock().unwrap(), Some(V101));
}

/// Test: a queued module task that reaches a worker mid-reload is held
/// Given a running physics task on one pool and a physics task queued
/// behind a blocker on another
/// When the module starts reloading and the blocker finishes
/// Then the queued task goes back to Ready without running, and runs on
/// v1.0.1 once the swap is done
#[test]
fn test_queued_task_held_when_worker_picks_it_up_mid_reload() {
    let h = Harness::new(&[("cpu", 1), ("io", 1)]);
    with_physics(&h);

    let slow_release = Latch::new();
    let slow_started = Latch::new();
    let blocker_release = Latch::new();
    let observed = Arc::new(Mutex::new(None));
    {
        let (release, started) = (slow_release.clone(), slow_started.clone());
        h.core
            .register_task(
                TaskSpec::repeated("physics.slow", "io", move |_| {
                    started.open();
                    release.wait();
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    {
        let release = blocker_release.clone();
        h.core
            .add_repeated("blocker", "cpu", &[], move |_| {
                release.wait();
                Ok(())
            })
            .unwrap();
    }
    {
        let observed = Arc::clone(&observed);
        h.core
            .register_task(
                TaskSpec::repeated("physics.queued", "cpu", move |core| {
                    *observed.lock().unwrap() = Some(physics_version(core)?);
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();

    let core = Arc::clone(&h.core);
    let cycle = thread::spawn(move || core.run_cycle().unwrap());
    assert!(slow_started.wait());
    assert_eq!(h.core.task_state("physics.queued").unwrap(), TaskState::Running);
    assert_eq!(h.core.modules().in_flight("physics").unwrap(), 1);

    let core = Arc::clone(&h.core);
    let reload = thread::spawn(move || {
        core.reload_module("physics", Interface::new(Physics::at(V101)), V101)
    });
    assert!(wait_until(|| h.core.module_state("physics") == ModuleState::Reloading));

    blocker_release.open();
    assert!(wait_until(|| h.core.task_state("physics.queued").unwrap() == TaskState::Ready));
    assert_eq!(h.core.run_count("physics.queued").unwrap(), 0);
    assert!(observed.lock().unwrap().is_none());

    slow_release.open();
    reload.join().unwrap().unwrap();
    let report = cycle.join().unwrap();

    assert!(report.is_clean(), "{:?}", report.failed);
    let mut completed = report.completed.clone();
    completed.sort();
    assert_eq!(completed, vec!["blocker", "physics.queued", "physics.slow"]);
    assert_eq!(*observed.lock().unwrap(), Some(V101));
    assert_eq!(h.core.run_count("physics.queued").unwrap(), 1);
}

/// Test: a version regression is rejected and the binding is unchanged
#[test]
fn test_version_regression_rejected() {
    let h = Harness::new(&[("cpu", 1)]);
    h.core
        .register_module("physics", V101, Interface::new(Physics::at(V101)))
        .unwrap();
    let events = h.core.modules().subscribe();

    let err = h
        .core
        .reload_module("physics", Interface::new(Physics::at(V100)), V100)
        .unwrap_err();
    match err {
        Error::VersionRegression {
            module,
            current,
            requested,
        } => {
            assert_eq!(module, "physics");
            assert_eq!(current, V101);
            assert_eq!(requested, V100);
        }
        other => panic!("expected VersionRegression, got {:?}", other),
    }

    assert_eq!(h.core.module_state("physics"), ModuleState::Active);
    assert_eq!(h.core.get_version("physics").unwrap(), V101);
    let binding = h.core.lookup_interface("physics", |p: &Physics| p.clone()).unwrap();
    assert_eq!(binding, Physics::at(V101));
    assert!(events.try_recv().is_err(), "a rejected reload pauses nothing");
}

/// Test: equal version reload is allowed
#[test]
fn test_reload_same_version_allowed() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    let replacement = Physics {
        version: V100,
        gravity: 1.62,
    };
    h.core
        .reload_module("physics", Interface::new(replacement), V100)
        .unwrap();
    let gravity = h.core.lookup_interface("physics", |p: &Physics| p.gravity).unwrap();
    assert_eq!(gravity, 1.62);
}

/// Paired fields that are only ever written together.
struct Pair {
    left: u64,
    right: u64,
}

/// Test: lookups around reloads never see a torn binding
/// Given readers hammering lookup_interface
/// When the module is reloaded many times
/// Then every lookup sees matching fields and versions only move forward
#[test]
fn test_concurrent_lookups_see_whole_bindings() {
    let h = Harness::new(&[("cpu", 1)]);
    h.core
        .register_module(
            "pair",
            Version::new(0, 0, 0),
            Interface::new(Pair { left: 0, right: 0 }),
        )
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let core = Arc::clone(&h.core);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0;
                let mut lookups = 0u64;
                while !done.load(Ordering::SeqCst) {
                    let (left, right) = core
                        .lookup_interface("pair", |p: &Pair| (p.left, p.right))
                        .unwrap();
                    assert_eq!(left, right, "torn binding");
                    assert!(left >= last, "binding went backwards");
                    last = left;
                    lookups += 1;
                }
                lookups
            })
        })
        .collect();

    for n in 1..=200u16 {
        let value = u64::from(n);
        h.core
            .reload_module(
                "pair",
                Interface::new(Pair {
                    left: value,
                    right: value,
                }),
                Version::new(0, 0, n),
            )
            .unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(h.core.get_version("pair").unwrap(), Version::new(0, 0, 200));
}

/// Test: request_reload pulls a fresh binding from the module source
#[test]
fn test_request_reload_from_source() {
    let h = Harness::new(&[("cpu", 1)]);
    let source = PhysicsSource::new(V100);
    h.core.load_module(source.clone()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        h.core
            .register_task(
                TaskSpec::repeated("physics.step", "cpu", move |core| {
                    seen.lock().unwrap().push(physics_version(core)?);
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();
    h.core.run_cycle().unwrap();

    source.set_next(V101);
    h.core.request_reload("physics").unwrap();
    h.core.run_cycle().unwrap();

    source.broken.store(true, Ordering::SeqCst);
    let err = h.core.request_reload("physics").unwrap_err();
    assert!(matches!(err, Error::LoadFailed { ref module, .. } if module == "physics"));
    h.core.run_cycle().unwrap();

    source.broken.store(false, Ordering::SeqCst);
    source.set_next(V100);
    assert!(matches!(
        h.core.request_reload("physics"),
        Err(Error::VersionRegression { .. })
    ));

    assert_eq!(*seen.lock().unwrap(), vec![V100, V101, V101]);
    assert_eq!(h.core.get_version("physics").unwrap(), V101);
}

/// Test: a module task cannot reload its own module
#[test]
fn test_reload_from_own_task_rejected() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    let outcome = Arc::new(Mutex::new(None));
    {
        let outcome = Arc::clone(&outcome);
        h.core
            .register_task(
                TaskSpec::once("physics.self_reload", "cpu", move |core| {
                    let result =
                        core.reload_module("physics", Interface::new(Physics::at(V101)), V101);
                    *outcome.lock().unwrap() = Some(result.map_err(|e| e.to_string()));
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();

    let report = h.core.run_cycle().unwrap();
    assert!(report.is_clean());
    let result = outcome.lock().unwrap().clone().unwrap();
    assert!(result.unwrap_err().contains("cannot be reloaded from one of its own tasks"));
    assert_eq!(h.core.get_version("physics").unwrap(), V100);
}

/// Test: a task of another module may trigger a reload
#[test]
fn test_reload_from_other_module_task() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    h.core
        .register_module("editor", V100, Interface::new(()))
        .unwrap();
    h.core
        .register_task(
            TaskSpec::once("editor.hot_swap", "cpu", |core| {
                core.reload_module("physics", Interface::new(Physics::at(V101)), V101)?;
                Ok(())
            })
            .owned_by("editor"),
        )
        .unwrap();
    h.core.finalize().unwrap();

    let report = h.core.run_cycle().unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(h.core.get_version("physics").unwrap(), V101);
}

/// Test: a reload from a task does not wait on queued module work
/// Given a one-thread pool with a reloading editor task registered ahead of
/// a physics task
/// When the cycle runs
/// Then the queued physics task is not counted as in flight, the reload
/// completes, and the physics task runs on the new binding
#[test]
fn test_reload_from_task_ahead_of_queued_module_task() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    h.core
        .register_module("editor", V100, Interface::new(()))
        .unwrap();
    h.core
        .register_task(
            TaskSpec::once("editor.hot_swap", "cpu", |core| {
                thread::sleep(Duration::from_millis(50));
                core.reload_module("physics", Interface::new(Physics::at(V101)), V101)?;
                Ok(())
            })
            .owned_by("editor"),
        )
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        h.core
            .register_task(
                TaskSpec::repeated("physics.step", "cpu", move |core| {
                    seen.lock().unwrap().push(physics_version(core)?);
                    Ok(())
                })
                .owned_by("physics"),
            )
            .unwrap();
    }
    h.core.finalize().unwrap();

    let core = Arc::clone(&h.core);
    let cycle = thread::spawn(move || core.run_cycle().unwrap());
    assert!(
        wait_until(|| cycle.is_finished()),
        "run_cycle blocked on a reload waiting for queued work"
    );

    let report = cycle.join().unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.completed, vec!["editor.hot_swap", "physics.step"]);
    assert_eq!(*seen.lock().unwrap(), vec![V101]);
    assert_eq!(h.core.run_count("physics.step").unwrap(), 1);
    assert_eq!(h.core.modules().in_flight("physics").unwrap(), 0);
}

/// Test: a completed Once task stays satisfied across reloads
#[test]
fn test_once_task_survives_reload() {
    let h = Harness::new(&[("cpu", 2)]);
    with_physics(&h);
    h.core
        .register_task(TaskSpec::once("physics.init", "cpu", |_| Ok(())).owned_by("physics"))
        .unwrap();
    h.repeated("simulate", "cpu", &["physics.init"]);
    h.core.finalize().unwrap();

    h.core.run_cycle().unwrap();
    h.core
        .reload_module("physics", Interface::new(Physics::at(V101)), V101)
        .unwrap();

    for _ in 0..3 {
        let report = h.core.run_cycle().unwrap();
        assert_eq!(report.completed, vec!["simulate"]);
    }
    assert_eq!(h.core.run_count("physics.init").unwrap(), 1);
    assert_eq!(h.core.task_state("physics.init").unwrap(), TaskState::Retired);
}

/// Test: subscribers see Reloading then Activated
#[test]
fn test_reload_publishes_events() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    let events = h.core.modules().subscribe();

    h.core
        .reload_module("physics", Interface::new(Physics::at(V101)), V101)
        .unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        ModuleEvent::Reloading {
            name: "physics".to_string()
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        ModuleEvent::Activated {
            name: "physics".to_string(),
            version: V101
        }
    );
}

/// Test: wrong interface type is a mismatch, not a panic
#[test]
fn test_interface_mismatch() {
    let h = Harness::new(&[("cpu", 1)]);
    with_physics(&h);
    let err = h.core.lookup_interface("physics", |_: &String| ()).unwrap_err();
    assert!(matches!(err, Error::InterfaceMismatch { ref module, .. } if module == "physics"));
    assert!(matches!(
        h.core.lookup_interface("audio", |_: &Physics| ()),
        Err(Error::UnknownModule(_))
    ));
}
