//! Module teardown sequencing.
//!
//! Finalizes registered modules one at a time, in registration order. A
//! module's `fini` hook is spawned on the runtime captured when teardown
//! began and receives a [`FiniCompletion`] token; the sequence moves on when
//! that token is completed or dropped, whether that happens inside the hook or
//! much later. Modules without a hook are skipped immediately.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::AccelError;
use crate::registry::ModuleList;

/// Invoked once after the last module has been finalized.
pub type FinishCallback = Box<dyn FnOnce() + Send>;

/// Observable teardown progress.
///
/// State machine: Running -> Finalizing(0) -> ... -> Finalizing(n-1) -> Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownPhase {
    /// Teardown has not been requested.
    Running,
    /// Waiting on the module at this registration index.
    Finalizing(usize),
    /// Every module has been finalized.
    Done,
}

struct Sequence {
    modules: ModuleList,
    current: Option<usize>,
    runtime: Handle,
    on_done: Option<FinishCallback>,
}

/// Drives the finalize sequence. Shared by the framework and every
/// outstanding [`FiniCompletion`].
pub struct TeardownCoordinator {
    sequence: Mutex<Option<Sequence>>,
    phase: ArcSwap<TeardownPhase>,
}

impl TeardownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: Mutex::new(None),
            phase: ArcSwap::from_pointee(TeardownPhase::Running),
        }
    }

    #[must_use]
    pub fn phase(&self) -> TeardownPhase {
        **self.phase.load()
    }

    /// Claims the coordinator for a new sequence over `modules` without
    /// finalizing anything yet. The sequence starts when the returned
    /// [`Reservation`] is run.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidState`] while a previous sequence is still
    /// in progress.
    pub fn reserve(
        self: &Arc<Self>,
        modules: ModuleList,
        runtime: Handle,
        on_done: FinishCallback,
    ) -> Result<Reservation, AccelError> {
        let mut seq = self.sequence.lock();
        if seq.is_some() {
            return Err(AccelError::InvalidState(
                "teardown already in progress".to_string(),
            ));
        }
        info!(modules = modules.len(), "accel teardown started");
        *seq = Some(Sequence {
            modules,
            current: None,
            runtime,
            on_done: Some(on_done),
        });
        Ok(Reservation {
            coordinator: Arc::clone(self),
        })
    }

    /// Starts finalizing `modules` and arranges for `on_done` to run after
    /// the last one.
    ///
    /// # Errors
    ///
    /// As [`reserve`](Self::reserve).
    pub fn begin(
        self: &Arc<Self>,
        modules: ModuleList,
        runtime: Handle,
        on_done: FinishCallback,
    ) -> Result<(), AccelError> {
        self.reserve(modules, runtime, on_done)?.run();
        Ok(())
    }

    /// Moves past the module at `from` (or starts at the first module when
    /// `from` is `None`). Hookless modules are skipped in a loop; the first
    /// module with a hook is scheduled and the call returns.
    fn advance(self: &Arc<Self>, from: Option<usize>) {
        let mut from = from;
        loop {
            let mut guard = self.sequence.lock();
            let Some(seq) = guard.as_mut() else {
                return;
            };
            if seq.current != from {
                warn!(
                    expected = ?seq.current,
                    got = ?from,
                    "stale module finalize completion ignored"
                );
                return;
            }

            let next = from.map_or(0, |i| i + 1);
            let Some(module) = seq.modules.get(next).cloned() else {
                let on_done = seq.on_done.take();
                *guard = None;
                self.phase.store(Arc::new(TeardownPhase::Done));
                drop(guard);
                info!("accel teardown complete");
                if let Some(cb) = on_done {
                    cb();
                }
                return;
            };

            seq.current = Some(next);
            let runtime = seq.runtime.clone();
            self.phase.store(Arc::new(TeardownPhase::Finalizing(next)));
            drop(guard);

            if module.finalizer().is_none() {
                debug!(module = module.name(), "module has no finalize hook, skipping");
                from = Some(next);
                continue;
            }

            debug!(module = module.name(), index = next, "finalizing module");
            // Created outside the task so that a task dropped unrun (runtime
            // shutting down) still resumes the sequence.
            let done = FiniCompletion {
                coordinator: Arc::clone(self),
                index: next,
            };
            runtime.spawn(async move {
                match module.finalizer() {
                    Some(hook) => hook.fini(done),
                    None => done.complete(),
                }
            });
            return;
        }
    }
}

impl Default for TeardownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// A claimed but not yet started teardown sequence.
#[must_use = "the sequence only starts when the reservation is run"]
pub struct Reservation {
    coordinator: Arc<TeardownCoordinator>,
}

impl Reservation {
    /// Begins finalizing the first module.
    pub fn run(self) {
        self.coordinator.advance(None);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FiniCompletion
// ---------------------------------------------------------------------------

/// Token handed to a module's finalize hook. Completing or dropping it
/// resumes the teardown sequence with the next module.
pub struct FiniCompletion {
    coordinator: Arc<TeardownCoordinator>,
    index: usize,
}

impl FiniCompletion {
    /// Signals that the module has finished tearing down.
    pub fn complete(self) {
        drop(self);
    }

    /// Registration index of the module being finalized.
    #[must_use]
    pub fn module_index(&self) -> usize {
        self.index
    }
}

impl Drop for FiniCompletion {
    fn drop(&mut self) {
        self.coordinator.advance(Some(self.index));
    }
}

impl std::fmt::Debug for FiniCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiniCompletion")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use offload_core::Opcode;
    use tokio::sync::oneshot;

    use super::*;
    use crate::module::AccelModule;
    use crate::testing::{wait_for_deferred, DeferredFini, EventLog, MockModule};

    fn list(modules: Vec<MockModule>) -> ModuleList {
        Arc::new(modules.into_iter().map(MockModule::into_arc).collect::<Vec<Arc<dyn AccelModule>>>())
    }

    fn begin_with_signal(
        coordinator: &Arc<TeardownCoordinator>,
        modules: ModuleList,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        coordinator
            .begin(modules, Handle::current(), Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn empty_module_list_completes_immediately() {
        let coordinator = Arc::new(TeardownCoordinator::new());
        let mut rx = begin_with_signal(&coordinator, Arc::new(Vec::new()));
        assert!(rx.try_recv().is_ok());
        assert_eq!(coordinator.phase(), TeardownPhase::Done);
    }

    #[tokio::test]
    async fn hookless_modules_are_skipped_synchronously() {
        let coordinator = Arc::new(TeardownCoordinator::new());
        let mut rx = begin_with_signal(
            &coordinator,
            list(vec![MockModule::new("a", &[]), MockModule::new("b", &[])]),
        );
        assert!(rx.try_recv().is_ok());
        assert_eq!(coordinator.phase(), TeardownPhase::Done);
    }

    #[tokio::test]
    async fn mixed_hooks_finalize_in_order_exactly_once() {
        let log = EventLog::default();
        let deferred = DeferredFini::default();
        let coordinator = Arc::new(TeardownCoordinator::new());

        let rx = begin_with_signal(
            &coordinator,
            list(vec![
                MockModule::new("software", &Opcode::ALL)
                    .with_immediate_fini()
                    .with_log(log.clone()),
                MockModule::new("nohook", &[]).with_log(log.clone()),
                MockModule::new("slow", &[Opcode::Copy])
                    .with_deferred_fini(&deferred)
                    .with_log(log.clone()),
                MockModule::new("last", &[Opcode::Fill])
                    .with_immediate_fini()
                    .with_log(log.clone()),
            ]),
        );

        let token = wait_for_deferred(&deferred).await;
        assert_eq!(coordinator.phase(), TeardownPhase::Finalizing(2));
        assert_eq!(token.module_index(), 2);
        assert_eq!(log.entries(), vec!["fini:software", "fini:slow"]);

        token.complete();
        rx.await.unwrap();
        assert_eq!(log.entries(), vec!["fini:software", "fini:slow", "fini:last"]);
        assert_eq!(coordinator.phase(), TeardownPhase::Done);
    }

    #[tokio::test]
    async fn second_begin_while_finalizing_is_rejected() {
        let deferred = DeferredFini::default();
        let coordinator = Arc::new(TeardownCoordinator::new());
        let modules = list(vec![MockModule::new("slow", &[]).with_deferred_fini(&deferred)]);

        let rx = begin_with_signal(&coordinator, Arc::clone(&modules));
        let err = coordinator
            .begin(modules, Handle::current(), Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, AccelError::InvalidState(_)));

        wait_for_deferred(&deferred).await.complete();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn reservation_blocks_a_second_sequence_before_running() {
        let log = EventLog::default();
        let coordinator = Arc::new(TeardownCoordinator::new());
        let modules = list(vec![MockModule::new("m", &[])
            .with_immediate_fini()
            .with_log(log.clone())]);
        let (tx, rx) = oneshot::channel();

        let reservation = coordinator
            .reserve(Arc::clone(&modules), Handle::current(), Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        assert!(matches!(
            coordinator.reserve(modules, Handle::current(), Box::new(|| {})),
            Err(AccelError::InvalidState(_))
        ));
        assert_eq!(coordinator.phase(), TeardownPhase::Running);
        assert!(log.entries().is_empty());

        reservation.run();
        rx.await.unwrap();
        assert_eq!(log.entries(), vec!["fini:m"]);
    }

    #[tokio::test]
    async fn restart_from_done_callback_keeps_new_phase() {
        let deferred = DeferredFini::default();
        let coordinator = Arc::new(TeardownCoordinator::new());
        let modules = list(vec![MockModule::new("slow", &[]).with_deferred_fini(&deferred)]);
        let (tx, rx) = oneshot::channel();

        let again = Arc::clone(&coordinator);
        let next_modules = Arc::clone(&modules);
        coordinator
            .begin(modules, Handle::current(), Box::new(move || {
                let restarted = again.begin(next_modules, Handle::current(), Box::new(|| {}));
                let _ = tx.send(restarted.is_ok());
            }))
            .unwrap();

        wait_for_deferred(&deferred).await.complete();
        assert!(rx.await.unwrap());
        // The second sequence owns the phase; the first must not overwrite it
        // with Done.
        assert_eq!(coordinator.phase(), TeardownPhase::Finalizing(0));
        wait_for_deferred(&deferred).await.complete();
        assert_eq!(coordinator.phase(), TeardownPhase::Done);
    }

    #[tokio::test]
    async fn dropped_token_still_resumes() {
        let deferred = DeferredFini::default();
        let coordinator = Arc::new(TeardownCoordinator::new());
        let rx = begin_with_signal(
            &coordinator,
            list(vec![MockModule::new("slow", &[]).with_deferred_fini(&deferred)]),
        );
        drop(wait_for_deferred(&deferred).await);
        rx.await.unwrap();
        assert_eq!(coordinator.phase(), TeardownPhase::Done);
    }

    #[tokio::test]
    async fn sequence_can_run_again_after_done() {
        let log = EventLog::default();
        let coordinator = Arc::new(TeardownCoordinator::new());
        let modules = list(vec![MockModule::new("m", &[])
            .with_immediate_fini()
            .with_log(log.clone())]);

        begin_with_signal(&coordinator, Arc::clone(&modules)).await.unwrap();
        begin_with_signal(&coordinator, modules).await.unwrap();
        assert_eq!(log.entries(), vec!["fini:m", "fini:m"]);
    }
}
