//! The coordination primitive for compound store operations.
//!
//! Every ingest step fans out many dependent requests; a [`Baton`] collects
//! that fan-out and [`Baton::quiesce`] is the phase barrier: nothing from a
//! later phase may start until every request spawned in the current one has
//! completed. On failure the barrier still drains everything already issued
//! before reporting, so no reply ever lands on a torn-down phase.
//!
//! [`PhaseChain`] sequences named phases over a shared context, stopping at
//! the first failed phase; bootstrap is expressed this way.

use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::future::Future;

pub struct Baton<'a, E> {
    label: &'static str,
    tasks: FuturesUnordered<LocalBoxFuture<'a, Result<(), E>>>,
    error: Option<E>,
}

impl<'a, E: std::fmt::Display> Baton<'a, E> {
    pub fn new(label: &'static str) -> Baton<'a, E> {
        Baton {
            label,
            tasks: FuturesUnordered::new(),
            error: None,
        }
    }

    /// Add one request to the current fan-out.
    pub fn spawn(&mut self, task: impl Future<Output = Result<(), E>> + 'a) {
        self.tasks.push(task.boxed_local());
    }

    /// Requests spawned and not yet completed.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// The phase barrier: wait for every spawned request, then report the
    /// first failure. Later failures while draining are demoted to a log
    /// line, since the phase is already doomed and the I/O merely settles.
    pub async fn quiesce(&mut self) -> Result<(), E> {
        while let Some(result) = self.tasks.next().await {
            if let Err(err) = result {
                if self.error.is_none() {
                    self.error = Some(err);
                } else {
                    tracing::debug!(
                        phase = self.label,
                        error = %err,
                        "another failure while draining",
                    );
                }
            }
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

type PhaseFn<C, E> = for<'c> fn(&'c mut C) -> LocalBoxFuture<'c, Result<(), E>>;

/// An ordered list of named phases over a context `C`. Phases run strictly
/// in order; the first failure stops the chain.
pub struct PhaseChain<C, E> {
    label: &'static str,
    phases: Vec<(&'static str, PhaseFn<C, E>)>,
}

impl<C, E: std::fmt::Display> PhaseChain<C, E> {
    pub fn new(label: &'static str) -> PhaseChain<C, E> {
        PhaseChain {
            label,
            phases: Vec::new(),
        }
    }

    pub fn phase(mut self, name: &'static str, run: PhaseFn<C, E>) -> Self {
        self.phases.push((name, run));
        self
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub async fn run(&self, ctx: &mut C) -> Result<(), E> {
        for (name, run) in &self.phases {
            tracing::debug!(chain = self.label, phase = name, "phase starting");
            if let Err(err) = run(ctx).await {
                tracing::error!(chain = self.label, phase = name, error = %err, "phase failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, thiserror::Error)]
    #[error("phase fault {0}")]
    struct Fault(u32);

    // No work of a later phase may start before every task spawned in the
    // current one has returned, however the scheduler interleaves them.
    #[tokio::test]
    async fn test_phase_barrier_ordering() {
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let mut first: Baton<'_, Fault> = Baton::new("first");
        for extra_yields in 0..5usize {
            let order = order.clone();
            first.spawn(async move {
                for _ in 0..extra_yields {
                    tokio::task::yield_now().await;
                }
                order.borrow_mut().push(1);
                Ok(())
            });
        }
        assert_eq!(first.pending(), 5);
        first.quiesce().await.unwrap();

        let mut second: Baton<'_, Fault> = Baton::new("second");
        for _ in 0..3 {
            let order = order.clone();
            second.spawn(async move {
                order.borrow_mut().push(2);
                Ok(())
            });
        }
        second.quiesce().await.unwrap();

        let seen = order.borrow();
        assert_eq!(seen.len(), 8);
        assert!(seen[..5].iter().all(|&phase| phase == 1));
        assert!(seen[5..].iter().all(|&phase| phase == 2));
    }

    // A failing task does not stop the rest of the fan-out from draining,
    // and the first error is the one reported.
    #[tokio::test]
    async fn test_quiesce_drains_after_error() {
        let drained = Rc::new(RefCell::new(0u32));

        let mut baton: Baton<'_, Fault> = Baton::new("draining");
        baton.spawn(async { Err(Fault(1)) });
        for _ in 0..4 {
            let drained = drained.clone();
            baton.spawn(async move {
                tokio::task::yield_now().await;
                *drained.borrow_mut() += 1;
                Ok(())
            });
        }
        baton.spawn(async {
            tokio::task::yield_now().await;
            Err(Fault(2))
        });

        let err = baton.quiesce().await.unwrap_err();
        assert_eq!(err.0, 1);
        assert_eq!(*drained.borrow(), 4);

        // The barrier is reusable after an error has been taken.
        baton.spawn(async { Ok(()) });
        baton.quiesce().await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        struct Ctx {
            ran: Vec<&'static str>,
        }

        fn ok_phase(ctx: &mut Ctx) -> LocalBoxFuture<'_, Result<(), Fault>> {
            async move {
                ctx.ran.push("ok");
                Ok(())
            }
            .boxed_local()
        }

        fn bad_phase(ctx: &mut Ctx) -> LocalBoxFuture<'_, Result<(), Fault>> {
            async move {
                ctx.ran.push("bad");
                Err(Fault(7))
            }
            .boxed_local()
        }

        let chain = PhaseChain::new("test")
            .phase("ok", ok_phase)
            .phase("bad", bad_phase)
            .phase("never", ok_phase);
        assert_eq!(chain.len(), 3);

        let mut ctx = Ctx { ran: Vec::new() };
        let err = chain.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.0, 7);
        assert_eq!(ctx.ran, vec!["ok", "bad"]);
    }
}
