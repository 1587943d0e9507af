//! Memory-limit enforcement: heap checks, GC epilogues, pressure
//! notifications, and the near-heap-limit allowance.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use isolate_pool::{
    Environment, EnvironmentOptions, Error, GcFlags, MemoryPressureLevel, Result,
};

use common::{drain_async_work, test_platform, FakeEngine, FakeFactory};

const MB: usize = 1024 * 1024;
const KB: usize = 1024;

fn small_env(
    factory: &FakeFactory,
) -> (
    Arc<isolate_pool::Platform>,
    Arc<isolate_pool::EnvironmentHandle>,
    Arc<Environment>,
    Arc<FakeEngine>,
) {
    let platform = test_platform();
    let options = EnvironmentOptions {
        memory_limit_mb: 1,
        snapshot: None,
    };
    let holder = Environment::new(&platform, options, factory).unwrap();
    let env = holder.environment().unwrap();
    let engine = factory.last_engine();
    (platform, holder, env, engine)
}

#[test]
fn heap_check_terminates_when_collection_cannot_recover() {
    let factory = FakeFactory::new(0);
    let (platform, holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(2 * MB);

    let outcome: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
    let later_task_ran = Arc::new(AtomicBool::new(false));
    {
        let outcome = outcome.clone();
        let later = later_task_ran.clone();
        let mut scheduler = env.scheduler().lock();
        scheduler.push_task(Box::new(move |env: &Arc<Environment>| {
            let check = env.heap_check(true);
            *outcome.lock().unwrap() = Some(check.epilogue());
        }));
        scheduler.push_task(Box::new(move |_env: &Arc<Environment>| {
            later.store(true, Ordering::SeqCst);
        }));
        assert!(scheduler.wake_isolate(&env));
    }
    drain_async_work(&platform);

    assert!(matches!(
        outcome.lock().unwrap().take(),
        Some(Err(Error::MemoryLimit))
    ));
    assert!(env.hit_memory_limit());
    assert!(env.is_terminated());
    assert!(engine.was_terminated());
    // The pass stops at the limit hit; queued work behind it is abandoned.
    assert!(!later_task_ran.load(Ordering::SeqCst));
    assert!(matches!(holder.environment(), Err(Error::Disposed)));
}

#[test]
fn heap_check_passes_when_a_collection_frees_enough() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(100 * KB);

    let check = env.heap_check(true);
    assert!(check.epilogue().is_ok());
    assert!(!env.is_terminated());
    assert_eq!(engine.used_heap(), 100 * KB);
}

#[test]
fn heap_check_skips_the_stats_walk_without_extra_allocations() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(2 * MB);

    // Not forced and no external-buffer growth: the bracket is free.
    let check = env.heap_check(false);
    assert!(check.epilogue().is_ok());
    assert!(!env.is_terminated());
}

#[test]
fn forced_full_gc_over_budget_terminates() {
    let factory = FakeFactory::new(0);
    let (_platform, holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(2 * MB);

    engine.trigger_gc(GcFlags::COLLECT_ALL);

    assert!(env.hit_memory_limit());
    assert!(env.is_terminated());
    assert!(matches!(holder.environment(), Err(Error::Disposed)));
}

#[test]
fn normal_gc_over_budget_escalates_to_critical_pressure() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(100 * KB);

    engine.trigger_gc(GcFlags::NORMAL);

    // Critical pressure forced a full collection, which recovered.
    assert_eq!(engine.pressure_log(), vec![MemoryPressureLevel::Critical]);
    assert_eq!(engine.used_heap(), 100 * KB);
    assert!(!env.is_terminated());
}

#[test]
fn normal_gc_over_budget_terminates_when_pressure_does_not_help() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(2 * MB);

    engine.trigger_gc(GcFlags::NORMAL);

    assert_eq!(engine.pressure_log(), vec![MemoryPressureLevel::Critical]);
    assert!(env.hit_memory_limit());
    assert!(env.is_terminated());
}

#[test]
fn moderate_pressure_is_sent_above_eighty_percent() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(900 * KB);

    engine.trigger_gc(GcFlags::NORMAL);

    assert_eq!(engine.pressure_log(), vec![MemoryPressureLevel::Moderate]);
    assert!(!env.is_terminated());
}

#[test]
fn near_heap_limit_grants_headroom_and_defers_pressure() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    let initial = engine.initial_heap_limit();
    engine.set_used_heap(900 * KB);

    engine.trigger_near_heap_limit();
    assert!(engine.current_heap_limit() > initial);
    // The notification waits for a safe point.
    assert!(engine.pressure_log().is_empty());

    engine.pump_interrupts();
    assert_eq!(engine.pressure_log(), vec![MemoryPressureLevel::Moderate]);
    assert!(!env.is_terminated());
}

#[test]
fn heap_limit_grant_is_retracted_once_usage_drops() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    let initial = engine.initial_heap_limit();
    engine.set_used_heap(900 * KB);

    engine.trigger_near_heap_limit();
    engine.trigger_near_heap_limit();
    assert!(engine.current_heap_limit() > initial);

    // Usage falls well under budget; the next epilogue restores the limit
    // and clears the adjustment flag.
    engine.set_used_heap(100 * KB);
    engine.trigger_gc(GcFlags::NORMAL);
    assert_eq!(engine.current_heap_limit(), initial);
    assert_eq!(engine.restore_calls(), 1);

    // Once cleared, further epilogues leave the limit alone.
    engine.trigger_gc(GcFlags::NORMAL);
    assert_eq!(engine.restore_calls(), 1);
    assert!(!env.is_terminated());
}

#[test]
fn near_heap_limit_over_budget_raises_critical_pressure() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(2 * MB);
    engine.set_gc_floor(100 * KB);

    engine.trigger_near_heap_limit();
    engine.pump_interrupts();

    assert_eq!(engine.pressure_log(), vec![MemoryPressureLevel::Critical]);
    // The deferred notification shrank the heap; no forced epilogue runs
    // from a safe-point delivery, so nothing terminates.
    assert_eq!(engine.used_heap(), 100 * KB);
    assert!(!env.is_terminated());
}

#[test]
fn extra_allocated_memory_counts_against_the_budget() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(100 * KB);

    let check = env.heap_check(false);
    env.adjust_extra_allocated_memory(2 * MB as isize);
    let result = check.epilogue();

    // The external buffer alone blows the budget and nothing can collect it.
    assert!(matches!(result, Err(Error::MemoryLimit)));
    assert!(env.is_terminated());

    env.adjust_extra_allocated_memory(-(2 * MB as isize));
    assert_eq!(env.extra_allocated_memory(), 0);
}

#[test]
fn extra_allocated_memory_saturates_at_zero() {
    let factory = FakeFactory::new(0);
    let (_platform, _holder, env, engine) = small_env(&factory);
    engine.set_used_heap(100 * KB);

    env.adjust_extra_allocated_memory(512);
    env.adjust_extra_allocated_memory(-(4 * MB as isize));
    assert_eq!(env.extra_allocated_memory(), 0);

    // A wrapped counter would blow the budget here.
    let check = env.heap_check(true);
    assert!(check.epilogue().is_ok());
    assert!(!env.is_terminated());
}
