use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use log::debug;

use crate::{
    coordinates::CoordinateSet,
    error::{Error, Result},
    node::{EvalContext, Node},
    units::UnitsArray,
};

/// The process-wide worker-thread budget. Claims are granted with an atomic
/// compare-and-update so nested composites can never exceed the limit
/// between them.
pub struct ThreadBudget {
    limit: usize,
    in_use: AtomicUsize,
}

impl ThreadBudget {
    pub fn new(limit: usize) -> ThreadBudget {
        ThreadBudget { limit, in_use: AtomicUsize::new(0) }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Grants up to `want` threads, possibly zero. The claim returns its
    /// threads to the budget on drop.
    pub fn claim(self: &Arc<Self>, want: usize) -> Claim {
        let mut granted = 0;
        while granted == 0 && want > 0 {
            let used = self.in_use.load(Ordering::Acquire);
            let take = want.min(self.limit.saturating_sub(used));
            if take == 0 {
                break;
            }
            if self
                .in_use
                .compare_exchange(used, used + take, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                granted = take;
            }
        }
        Claim { budget: Arc::clone(self), count: granted }
    }

    fn release(&self, count: usize) {
        self.in_use.fetch_sub(count, Ordering::AcqRel);
    }
}

pub struct Claim {
    budget: Arc<ThreadBudget>,
    count: usize,
}

impl Claim {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.count > 0 {
            self.budget.release(self.count);
        }
    }
}

/// Evaluates independent sources, in parallel when the budget allows.
/// Results are assembled into the declared order regardless of completion
/// order; cancellation is checked before each dispatch.
pub fn eval_parallel(
    sources: &[Arc<dyn Node>],
    request: &CoordinateSet,
    ctx: &EvalContext,
) -> Vec<Result<UnitsArray>> {
    if sources.len() <= 1 {
        return eval_sequential(sources, request, ctx);
    }

    let want = sources.len().min(ctx.settings().n_threads);
    let claim = ctx.budget().claim(want);
    if claim.count() == 0 {
        debug!(target: "scheduler", "thread budget exhausted, evaluating {} sources sequentially", sources.len());
        return eval_sequential(sources, request, ctx);
    }
    debug!(target: "scheduler", "evaluating {} sources on {} worker threads", sources.len(), claim.count());

    let cursor = AtomicUsize::new(0);
    let slots: Vec<Mutex<Option<Result<UnitsArray>>>> =
        sources.iter().map(|_| Mutex::new(None)).collect();

    std::thread::scope(|scope| {
        for _ in 0..claim.count() {
            scope.spawn(|| {
                loop {
                    let i = cursor.fetch_add(1, Ordering::Relaxed);
                    if i >= sources.len() {
                        break;
                    }
                    let result = match ctx.check_cancelled() {
                        Ok(()) => sources[i].eval(request, ctx),
                        Err(err) => Err(err),
                    };
                    *slots[i].lock().expect("result slot lock poisoned") = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("result slot lock poisoned")
                .unwrap_or(Err(Error::Cancelled))
        })
        .collect()
}

fn eval_sequential(
    sources: &[Arc<dyn Node>],
    request: &CoordinateSet,
    ctx: &EvalContext,
) -> Vec<Result<UnitsArray>> {
    sources
        .iter()
        .map(|source| {
            ctx.check_cancelled()?;
            source.eval(request, ctx)
        })
        .collect()
}
