//! Model lifecycle: owns at most one loaded inference model and drives
//! load/reload/dispose transitions. Every load bumps a generation counter;
//! completions and estimate results carry the generation they were issued
//! under, and anything tagged with a superseded generation is disposed
//! instead of being installed or published.

use std::sync::Arc;

use anyhow::Result;

use crate::config::ModelConfig;
use crate::engine::{ModelLoader, PoseModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Idle,
    Loading,
    Loaded,
    Error,
}

/// Where the exclusively-owned instance currently is.
enum Slot {
    Idle,
    /// A load for the current generation is in flight.
    Loading,
    /// Resident and available.
    Loaded(Box<dyn PoseModel>),
    /// Checked out by the scheduler for one estimate call.
    CheckedOut,
    Error,
}

pub struct ModelLifecycleManager {
    loader: Arc<dyn ModelLoader>,
    slot: Slot,
    generation: u64,
}

impl ModelLifecycleManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: Slot::Idle,
            generation: 0,
        }
    }

    pub fn status(&self) -> ModelStatus {
        match self.slot {
            Slot::Idle => ModelStatus::Idle,
            Slot::Loading => ModelStatus::Loading,
            Slot::Loaded(_) | Slot::CheckedOut => ModelStatus::Loaded,
            Slot::Error => ModelStatus::Error,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin a load, superseding anything earlier: the generation is bumped
    /// and a resident instance is disposed before the replacement arrives,
    /// bounding peak usage at one model. Returns the tagged work for the
    /// caller to run on the blocking pool.
    pub fn begin_load(&mut self, config: ModelConfig) -> (u64, Arc<dyn ModelLoader>, ModelConfig) {
        self.generation += 1;
        match std::mem::replace(&mut self.slot, Slot::Loading) {
            Slot::Loaded(mut old) => old.dispose(),
            // CheckedOut: the instance is inside a running estimate call;
            // its check-in will carry a stale generation and dispose it.
            _ => {}
        }
        (self.generation, Arc::clone(&self.loader), config)
    }

    /// Apply a load completion. A completion for a superseded generation
    /// disposes whatever it produced; the current one installs the instance
    /// or records the failure.
    pub fn finish_load(&mut self, generation: u64, result: Result<Box<dyn PoseModel>>) {
        if generation != self.generation {
            if let Ok(mut model) = result {
                model.dispose();
            }
            return;
        }
        match result {
            Ok(model) => self.slot = Slot::Loaded(model),
            Err(e) => {
                log::warn!("model load failed: {e:#}");
                self.slot = Slot::Error;
            }
        }
    }

    /// Check the resident instance out for one estimate call. None while
    /// idle, loading, errored, or already checked out.
    pub fn check_out(&mut self) -> Option<(Box<dyn PoseModel>, u64)> {
        if matches!(self.slot, Slot::Loaded(_)) {
            let Slot::Loaded(model) = std::mem::replace(&mut self.slot, Slot::CheckedOut) else {
                unreachable!()
            };
            Some((model, self.generation))
        } else {
            None
        }
    }

    /// Return a checked-out instance. True when the tag is still current:
    /// the instance is re-installed and the caller may publish its result.
    /// A stale tag means a reload superseded the call while it ran: the
    /// instance is disposed and the result must be discarded.
    pub fn check_in(&mut self, mut model: Box<dyn PoseModel>, generation: u64) -> bool {
        if generation == self.generation && matches!(self.slot, Slot::CheckedOut) {
            self.slot = Slot::Loaded(model);
            true
        } else {
            model.dispose();
            false
        }
    }

    /// Dispose the resident instance, if any. Called at session teardown.
    pub fn dispose(&mut self) {
        self.generation += 1;
        if let Slot::Loaded(mut model) = std::mem::replace(&mut self.slot, Slot::Idle) {
            model.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::capture::VideoFrame;
    use crate::config::{EstimationConfig, ModelVariant};
    use crate::pose::Pose;

    /// Records how often each instance is disposed.
    struct TestModel {
        id: usize,
        disposals: Arc<Mutex<Vec<usize>>>,
    }

    impl PoseModel for TestModel {
        fn estimate(&mut self, _: &VideoFrame, _: &EstimationConfig) -> Result<Vec<Pose>> {
            Ok(vec![])
        }
        fn dispose(&mut self) {
            self.disposals.lock().unwrap().push(self.id);
        }
    }

    struct TestLoader {
        created: AtomicUsize,
        disposals: Arc<Mutex<Vec<usize>>>,
    }

    impl TestLoader {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                disposals: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ModelLoader for TestLoader {
        fn load(&self, _: &ModelConfig) -> Result<Box<dyn PoseModel>> {
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestModel {
                id,
                disposals: Arc::clone(&self.disposals),
            }))
        }
    }

    fn config() -> ModelConfig {
        ModelConfig {
            variant: ModelVariant::default(),
            models_dir: "models".into(),
        }
    }

    fn manager() -> (ModelLifecycleManager, Arc<TestLoader>) {
        let loader = Arc::new(TestLoader::new());
        (
            ModelLifecycleManager::new(loader.clone() as Arc<dyn ModelLoader>),
            loader,
        )
    }

    #[test]
    fn test_load_success_transitions() {
        let (mut mgr, _loader) = manager();
        assert_eq!(mgr.status(), ModelStatus::Idle);

        let (generation, loader, cfg) = mgr.begin_load(config());
        assert_eq!(mgr.status(), ModelStatus::Loading);

        mgr.finish_load(generation, loader.load(&cfg));
        assert_eq!(mgr.status(), ModelStatus::Loaded);
    }

    #[test]
    fn test_load_failure_lands_in_error_and_is_retryable() {
        let (mut mgr, _loader) = manager();
        let (generation, _, _) = mgr.begin_load(config());
        mgr.finish_load(generation, Err(anyhow::anyhow!("404 fetching weights")));
        assert_eq!(mgr.status(), ModelStatus::Error);

        // user retries by re-issuing load
        let (generation, loader, cfg) = mgr.begin_load(config());
        mgr.finish_load(generation, loader.load(&cfg));
        assert_eq!(mgr.status(), ModelStatus::Loaded);
    }

    #[test]
    fn test_back_to_back_loads_leave_one_instance_alive() {
        let (mut mgr, test_loader) = manager();

        // three loads issued without awaiting completion
        let (g1, l1, c1) = mgr.begin_load(config());
        let (g2, l2, c2) = mgr.begin_load(config());
        let (g3, l3, c3) = mgr.begin_load(config());

        // completions settle in issue order; instance ids are 0, 1, 2
        mgr.finish_load(g1, l1.load(&c1));
        mgr.finish_load(g2, l2.load(&c2));
        mgr.finish_load(g3, l3.load(&c3));

        assert_eq!(mgr.status(), ModelStatus::Loaded);
        let disposals = test_loader.disposals.lock().unwrap().clone();
        assert_eq!(disposals, vec![0, 1], "all but the last disposed exactly once");
    }

    #[test]
    fn test_out_of_order_completion_disposes_stale_load() {
        let (mut mgr, test_loader) = manager();

        let (g1, l1, c1) = mgr.begin_load(config());
        let (g2, l2, c2) = mgr.begin_load(config());

        // the newer load resolves first...
        mgr.finish_load(g2, l2.load(&c2)); // instance 0
        assert_eq!(mgr.status(), ModelStatus::Loaded);

        // ...and the older one resolves later: disposed, state untouched
        mgr.finish_load(g1, l1.load(&c1)); // instance 1
        assert_eq!(mgr.status(), ModelStatus::Loaded);
        let disposals = test_loader.disposals.lock().unwrap().clone();
        assert_eq!(disposals, vec![1]);
        assert_eq!(mgr.generation(), g2);
    }

    #[test]
    fn test_reload_disposes_resident_before_replacement() {
        let (mut mgr, test_loader) = manager();
        let (g1, l1, c1) = mgr.begin_load(config());
        mgr.finish_load(g1, l1.load(&c1)); // instance 0 resident

        // reload: the resident instance is disposed at begin, not at finish
        let (g2, l2, c2) = mgr.begin_load(config());
        assert_eq!(
            test_loader.disposals.lock().unwrap().clone(),
            vec![0],
            "old instance released before the new one exists"
        );
        mgr.finish_load(g2, l2.load(&c2));
        assert_eq!(mgr.status(), ModelStatus::Loaded);
    }

    #[test]
    fn test_check_in_with_current_generation_reinstalls() {
        let (mut mgr, _) = manager();
        let (g1, l1, c1) = mgr.begin_load(config());
        mgr.finish_load(g1, l1.load(&c1));

        let (model, tag) = mgr.check_out().unwrap();
        // checked out still reads as Loaded in the published status
        assert_eq!(mgr.status(), ModelStatus::Loaded);
        assert!(mgr.check_out().is_none(), "one estimate call at a time");

        assert!(mgr.check_in(model, tag));
        assert!(mgr.check_out().is_some());
    }

    #[test]
    fn test_check_in_after_reload_disposes_and_suppresses() {
        let (mut mgr, test_loader) = manager();
        let (g1, l1, c1) = mgr.begin_load(config());
        mgr.finish_load(g1, l1.load(&c1)); // instance 0

        let (model, tag) = mgr.check_out().unwrap();

        // reload completes while the estimate call is still running
        let (g2, l2, c2) = mgr.begin_load(config());
        mgr.finish_load(g2, l2.load(&c2)); // instance 1 resident

        // the in-flight call returns: stale, disposed, result not publishable
        assert!(!mgr.check_in(model, tag));
        let disposals = test_loader.disposals.lock().unwrap().clone();
        assert_eq!(disposals, vec![0]);
        assert_eq!(mgr.status(), ModelStatus::Loaded);
        assert!(mgr.check_out().is_some(), "new instance unaffected");
    }

    #[test]
    fn test_dispose_releases_resident() {
        let (mut mgr, test_loader) = manager();
        let (g1, l1, c1) = mgr.begin_load(config());
        mgr.finish_load(g1, l1.load(&c1));

        mgr.dispose();
        assert_eq!(mgr.status(), ModelStatus::Idle);
        assert_eq!(test_loader.disposals.lock().unwrap().clone(), vec![0]);
    }

    #[test]
    fn test_late_completion_after_dispose_is_released() {
        let (mut mgr, test_loader) = manager();
        let (g1, l1, c1) = mgr.begin_load(config());
        mgr.dispose();

        mgr.finish_load(g1, l1.load(&c1)); // instance 0, stale
        assert_eq!(mgr.status(), ModelStatus::Idle);
        assert_eq!(test_loader.disposals.lock().unwrap().clone(), vec![0]);
    }
}
