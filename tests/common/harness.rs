//! Shared wiring for provisioning scenario tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`), so helpers live under `tests/common/` and are pulled in with:
//!
//! ```rust
//! #[path = "common/harness.rs"]
//! mod harness;
//! ```

use longhorn_volume_manager::test_support::{FakeBackend, ScriptedRunner};
use longhorn_volume_manager::{
    BatchOrchestrator, BatchPolicy, Kubectl, PollPolicy, VolumeLifecycle, VolumesConfig,
};

/// Attempts granted to every wait in scenario tests.
pub const SCENARIO_ATTEMPTS: u32 = 5;

/// Lifecycle controller wired to in-memory doubles.
pub type ScenarioLifecycle = VolumeLifecycle<FakeBackend, Kubectl<ScriptedRunner>>;

/// Builds a zero-sleep lifecycle over shared handles of `backend` and
/// `runner`.
pub fn lifecycle(backend: &FakeBackend, runner: &ScriptedRunner) -> ScenarioLifecycle {
    VolumeLifecycle::new(
        backend.clone(),
        Kubectl::new("kubectl", runner.clone()),
        PollPolicy::immediate(SCENARIO_ATTEMPTS),
    )
}

/// Builds a fail-fast orchestrator over shared handles of the doubles.
pub fn orchestrator(
    backend: &FakeBackend,
    runner: &ScriptedRunner,
) -> BatchOrchestrator<FakeBackend, Kubectl<ScriptedRunner>> {
    BatchOrchestrator::new(lifecycle(backend, runner), BatchPolicy::FailFast)
}

/// Parses a volumes document with the given `spec.volumes` body.
pub fn volumes(body: &str) -> VolumesConfig {
    let document = format!(
        "apiVersion: longhorn-volume-manager/v1\nkind: LonghornVolumeSpec\nspec:\n  volumes:\n{body}"
    );
    VolumesConfig::from_yaml(&document).unwrap_or_else(|err| panic!("volumes document: {err}"))
}

/// Queues `count` successful cluster commands.
pub fn queue_successes(runner: &ScriptedRunner, count: usize) {
    for _ in 0..count {
        runner.push_success();
    }
}
