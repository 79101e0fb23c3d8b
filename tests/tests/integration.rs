//! Integration suite for the hotmod runtime.
//!
//! Exercises the end-to-end guarantees: atomic export publishing, persistent
//! state durability across reloads, per-identifier reload serialization with
//! coalescing, fingerprint-deduplicated change detection, and failure
//! isolation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Semaphore;

use hotmod_runtime::{
    ContentWatcher, HmrRuntime, ModuleId, ModulePhase, ReloadEvent, StaticResolver, Watch,
    WatchConfig,
};
use hotmod_testing::{
    Behavior, FileBackedModule, Recorder, RouterExport, TestBed, await_event, poll_until,
};

// =========================================================================
// Scenario A / P2 — persistent state continuity
// =========================================================================

#[tokio::test]
async fn scenario_a_state_survives_consecutive_reloads() {
    let bed = TestBed::new();
    bed.install("router-a", "v1", 1, Behavior::Ready);

    let handle = bed.runtime.import::<RouterExport>("router-a").await.unwrap();
    assert_eq!(handle.exports().unwrap().handle(), 0);

    let mut events = bed.runtime.subscribe();
    for n in 2..=3u64 {
        bed.install("router-a", &format!("v{n}"), n, Behavior::Ready);
        bed.runtime.reload("router-a").unwrap();
        await_event(&mut events, |e| {
            matches!(e, ReloadEvent::ReloadCompleted { .. })
        })
        .await;
    }

    // Nothing mutated the counter, so the post-reload handler still reads 0
    // out of the *original* persistent state.
    let export = handle.exports().unwrap();
    assert_eq!(export.label, "v3");
    assert_eq!(export.handle(), 0);

    assert_eq!(bed.recorder.inits.load(Ordering::SeqCst), 1);
    assert_eq!(bed.recorder.activations.load(Ordering::SeqCst), 3);
    assert!(
        bed.recorder.state_was_stable(),
        "all three activations must observe the same state object"
    );
}

// =========================================================================
// Scenario B — deferred activation keeps the old export serving
// =========================================================================

#[tokio::test]
async fn scenario_b_old_export_serves_until_deferred_activation_resolves() {
    let bed = TestBed::new();
    bed.install("slow-router", "v1", 1, Behavior::Ready);
    bed.runtime.import::<RouterExport>("slow-router").await.unwrap();

    let gate = Arc::new(Semaphore::new(0));
    bed.install("slow-router", "v2", 2, Behavior::Gated(gate.clone()));

    let mut events = bed.runtime.subscribe();
    bed.runtime.reload("slow-router").unwrap();

    // The new activation is pending on the gate...
    assert!(
        poll_until(
            || bed.recorder.activations.load(Ordering::SeqCst) == 2,
            Duration::from_secs(2),
        )
        .await
    );

    // ...and consumers still get the previous export: not None, not v2.
    let export = bed.export("slow-router").expect("previous export published");
    assert_eq!(export.label, "v1");
    assert!(matches!(
        bed.runtime.info("slow-router").unwrap().phase,
        ModulePhase::Activating
    ));

    gate.add_permits(1);
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;
    assert_eq!(bed.export("slow-router").unwrap().label, "v2");
}

// =========================================================================
// Scenario C / P3 — rapid updates serialize into exactly two cycles
// =========================================================================

#[tokio::test]
async fn scenario_c_back_to_back_updates_run_two_sequential_cycles() {
    let bed = TestBed::new();
    bed.install("router-a", "v1", 1, Behavior::Ready);
    bed.runtime.import::<RouterExport>("router-a").await.unwrap();

    let gate = Arc::new(Semaphore::new(0));
    bed.install("router-a", "v2", 2, Behavior::Gated(gate.clone()));

    let mut events = bed.runtime.subscribe();
    bed.runtime.reload("router-a").unwrap();
    assert!(
        poll_until(
            || bed.recorder.activations.load(Ordering::SeqCst) == 2,
            Duration::from_secs(2),
        )
        .await
    );

    // Second update lands while the first cycle is mid-activation: it must
    // queue a follow-up cycle, not interleave.
    bed.runtime.reload("router-a").unwrap();

    gate.add_permits(2);
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;

    // Settle, then check nothing queued a third cycle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bed.recorder.activations.load(Ordering::SeqCst), 3);
    assert_eq!(bed.recorder.deactivations.load(Ordering::SeqCst), 2);
    assert_eq!(bed.recorder.max_concurrent.load(Ordering::SeqCst), 1);
    assert!(
        bed.recorder.activations_were_sequential(),
        "activation spans must never overlap: {:?}",
        bed.recorder.log.lock()
    );
    assert_eq!(bed.export("router-a").unwrap().label, "v2");
}

// =========================================================================
// Scenario D — deactivate failure is best-effort and reported once
// =========================================================================

#[tokio::test]
async fn scenario_d_deactivate_failure_does_not_block_the_reload() {
    let bed = TestBed::new();
    bed.install("router-a", "v1", 1, Behavior::FailDeactivate);
    bed.runtime.import::<RouterExport>("router-a").await.unwrap();

    let mut events = bed.runtime.subscribe();
    bed.install("router-a", "v2", 2, Behavior::Ready);
    bed.runtime.reload("router-a").unwrap();

    let mut cleanup_failures = 0;
    await_event(&mut events, |e| {
        if matches!(e, ReloadEvent::DeactivateFailed { .. }) {
            cleanup_failures += 1;
        }
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;

    assert_eq!(cleanup_failures, 1, "the error is reported exactly once");
    assert_eq!(bed.export("router-a").unwrap().label, "v2");
}

// =========================================================================
// P1 — atomic publish under concurrent readers
// =========================================================================

#[tokio::test]
async fn p1_readers_never_observe_a_half_formed_export() {
    let bed = TestBed::new();
    bed.install("m", "v1", 1, Behavior::Ready);
    bed.runtime.import::<RouterExport>("m").await.unwrap();

    let runtime: Arc<HmrRuntime> = bed.runtime.clone();
    let reader = tokio::spawn(async move {
        for _ in 0..2000 {
            if let Some(export) = runtime.export::<RouterExport>("m") {
                // label and version are written by the same activation; a
                // torn export would break this invariant.
                assert_eq!(export.label, format!("v{}", export.version));
            }
            tokio::task::yield_now().await;
        }
    });

    let mut events = bed.runtime.subscribe();
    for n in 2..=20u64 {
        bed.install("m", &format!("v{n}"), n, Behavior::Ready);
        bed.runtime.reload("m").unwrap();
        await_event(&mut events, |e| {
            matches!(e, ReloadEvent::ReloadCompleted { .. })
        })
        .await;
    }

    reader.await.unwrap();
    assert_eq!(bed.export("m").unwrap().version, 20);
}

// =========================================================================
// P5 — failure isolation and recovery
// =========================================================================

#[tokio::test]
async fn p5_failed_activation_keeps_previous_export_and_stays_reloadable() {
    let bed = TestBed::new();
    bed.install("m", "v1", 1, Behavior::Ready);
    bed.runtime.import::<RouterExport>("m").await.unwrap();

    let mut events = bed.runtime.subscribe();
    bed.install("m", "v2", 2, Behavior::FailActivate);
    bed.runtime.reload("m").unwrap();
    await_event(&mut events, |e| matches!(e, ReloadEvent::ReloadFailed { .. })).await;

    assert_eq!(bed.export("m").unwrap().label, "v1");
    assert!(matches!(
        bed.runtime.info("m").unwrap().phase,
        ModulePhase::Failed(_)
    ));

    // The coordinator accepted the failure and the next update recovers.
    bed.install("m", "v3", 3, Behavior::Ready);
    bed.runtime.reload("m").unwrap();
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;
    assert_eq!(bed.export("m").unwrap().label, "v3");
    assert!(bed.runtime.info("m").unwrap().last_error.is_none());
}

// =========================================================================
// P4 — fingerprint dedup at the watcher
// =========================================================================

#[tokio::test]
async fn p4_fingerprint_dedup_suppresses_spurious_signals() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("router.src");
    tokio::fs::write(&file, "v1").await.unwrap();

    let mut watcher = ContentWatcher::new(WatchConfig::default());
    let mut updates = watcher.take_update_receiver().unwrap();
    watcher.watch(ModuleId::new("router-a"), &file).unwrap();
    watcher.start().unwrap();

    // Rewriting identical content fires raw OS events but must not emit.
    tokio::fs::write(&file, "v1").await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(500), updates.recv()).await;
    assert!(quiet.is_err(), "unchanged content must not emit an update");

    // A real change emits exactly one update.
    tokio::fs::write(&file, "v2").await.unwrap();
    let update = tokio::time::timeout(Duration::from_secs(3), updates.recv())
        .await
        .expect("changed content must emit an update")
        .unwrap();
    assert_eq!(update, ModuleId::new("router-a"));

    let extra = tokio::time::timeout(Duration::from_millis(500), updates.recv()).await;
    assert!(extra.is_err(), "one logical change, one update");

    watcher.close_all();
}

// =========================================================================
// End to end — file change to swapped export, counter intact
// =========================================================================

#[tokio::test]
async fn watcher_driven_reload_preserves_state_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("router.src");
    tokio::fs::write(&file, "v1").await.unwrap();

    let recorder = Recorder::new();
    let resolver = Arc::new(StaticResolver::new());
    let source = file.clone();
    let module_recorder = recorder.clone();
    resolver.register("router-a", move || FileBackedModule {
        source: source.clone(),
        recorder: module_recorder.clone(),
    });
    resolver.set_path("router-a", &file);

    let runtime = HmrRuntime::builder(resolver)
        .with_watcher(Box::new(ContentWatcher::new(WatchConfig::default())))
        .build();
    runtime.start(&[ModuleId::new("router-a")]).await.unwrap();

    let export = runtime.export::<RouterExport>("router-a").unwrap();
    assert_eq!(export.label, "v1");
    assert_eq!(export.handle(), 1);
    assert_eq!(export.handle(), 2);

    let mut events = runtime.subscribe();
    tokio::fs::write(&file, "v2").await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;

    let export = runtime.export::<RouterExport>("router-a").unwrap();
    assert_eq!(export.label, "v2");
    assert_eq!(
        export.handle(),
        3,
        "the hit counter must ride across the reload"
    );
    assert!(recorder.state_was_stable());

    let report = runtime.close_all().await;
    assert!(report.is_clean());
}

// =========================================================================
// Module-initiated republish
// =========================================================================

#[tokio::test]
async fn module_can_request_its_own_republish() {
    let bed = TestBed::new();
    bed.install(
        "m",
        "v1",
        1,
        Behavior::SelfUpdating(Duration::from_millis(50)),
    );

    let mut events = bed.runtime.subscribe();
    bed.runtime.start(&[ModuleId::new("m")]).await.unwrap();

    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ExternalUpdate { .. })
    })
    .await;
    await_event(&mut events, |e| {
        matches!(e, ReloadEvent::ReloadCompleted { .. })
    })
    .await;

    assert_eq!(bed.recorder.activations.load(Ordering::SeqCst), 2);
}
