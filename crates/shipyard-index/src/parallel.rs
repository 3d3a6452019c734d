//! Bounded parallel evaluation on scoped threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// How many evaluations a recompute may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    Fixed(usize),
    /// One evaluation per available CPU.
    #[default]
    Auto,
}

impl Concurrency {
    pub fn from_config(n: usize) -> Self {
        if n == 0 { Self::Auto } else { Self::Fixed(n) }
    }

    pub fn limit(self) -> usize {
        match self {
            Self::Fixed(n) => n.max(1),
            Self::Auto => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Evaluate `f` over `items` with at most `concurrency` threads.
///
/// Items not started before `cancel` fires yield `None`. Evaluations
/// already running are allowed to finish.
pub fn evaluate_bounded<I, O, F>(
    items: &[I],
    concurrency: Concurrency,
    cancel: &CancellationToken,
    f: F,
) -> Vec<Option<O>>
where
    I: Sync,
    O: Send,
    F: Fn(&I) -> O + Sync,
{
    let workers = concurrency.limit().min(items.len());
    if workers <= 1 {
        return items
            .iter()
            .map(|item| (!cancel.is_cancelled()).then(|| f(item)))
            .collect();
    }

    let cursor = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<O>>> =
        Mutex::new(std::iter::repeat_with(|| None).take(items.len()).collect());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(idx) else { break };
                    let out = f(item);
                    results.lock()[idx] = Some(out);
                }
            });
        }
    });

    results.into_inner()
}
