use std::sync::{
    Barrier,
    atomic::{AtomicU64, Ordering},
};

/// Runs a function on exactly one executor while every other executor is
/// parked.
///
/// Every participating executor calls [`run_exclusive`] with its own copy of
/// the body. All of them meet at a barrier; the barrier leader holds the
/// exclusive token and runs its body; the rest wait at a second barrier until
/// the body has finished. Afterwards every executor resumes.
///
/// [`run_exclusive`]: Self::run_exclusive
#[derive(Debug)]
pub struct Rendezvous {
    barrier: Barrier,
    executors: usize,
    rounds: AtomicU64,
}

impl Rendezvous {
    /// Creates a rendezvous for `executors` participants.
    pub fn new(executors: usize) -> Self {
        Self {
            barrier: Barrier::new(executors),
            executors,
            rounds: AtomicU64::new(0),
        }
    }

    /// Returns the number of participants.
    pub fn executors(&self) -> usize {
        self.executors
    }

    /// Returns how many times a body has run.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Parks the caller until every executor arrived, then runs `body` on
    /// exactly one of them.
    ///
    /// Returns the body's result on the executor that ran it and `None` on
    /// every other executor.
    pub fn run_exclusive<R>(&self, body: impl FnOnce() -> R) -> Option<R> {
        let arrival = self.barrier.wait();

        let result = if arrival.is_leader() {
            tracing::debug!(executors = self.executors, "running exclusive body");
            let result = body();
            self.rounds.fetch_add(1, Ordering::AcqRel);
            Some(result)
        }
        else {
            None
        };

        self.barrier.wait();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn single_executor_runs_body() {
        let rendezvous = Rendezvous::new(1);
        assert_eq!(rendezvous.run_exclusive(|| 42), Some(42));
        assert_eq!(rendezvous.rounds(), 1);
    }

    #[test]
    fn exactly_one_executor_runs_body() {
        const EXECUTORS: usize = 4;

        let rendezvous = Arc::new(Rendezvous::new(EXECUTORS));
        let runs = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles = (0..EXECUTORS)
            .map(|_| {
                let rendezvous = Arc::clone(&rendezvous);
                let runs = Arc::clone(&runs);
                let inside = Arc::clone(&inside);

                std::thread::spawn(move || {
                    for _ in 0..8 {
                        rendezvous.run_exclusive(|| {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            runs.fetch_add(1, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 8);
        assert_eq!(rendezvous.rounds(), 8);
    }
}
