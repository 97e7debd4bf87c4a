//! The in-process pool: N threads sharing the job factory and the board.

use crate::dispatch::{invoke, Board, Hooks};
use crate::factory::JobFactory;
use crate::options::Options;
use fanout_base::{DispatchResult, Fault};
use std::thread;

/// There are no pids here, so a Kill verdict has nothing to hard-kill; it
/// stops dispatch exactly like Break does.
pub(crate) fn run<I, O, F>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
    count: usize,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone + Send + Sync,
    O: Send,
    F: Fn(I, usize) -> Result<O, Fault> + Sync,
{
    let board = Board::new(if options.preserve_results {
        factory.size()
    } else {
        None
    });
    let hooks = Hooks::new(options);
    thread::scope(|scope| {
        for _ in 0..count {
            scope.spawn(|| loop {
                if board.halted() {
                    break;
                }
                let Some((item, index)) = factory.next() else {
                    break;
                };
                hooks.before(&item, index);
                match invoke(call, item.clone(), index) {
                    Ok(output) => {
                        hooks.after(&item, index, Some(&output));
                        if options.preserve_results {
                            board.store(index, output);
                        }
                    }
                    Err(fault) => {
                        hooks.after(&item, index, None);
                        board.record(fault.into());
                        break;
                    }
                }
            });
        }
    });
    board.into_outcome(options.preserve_results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{Produced, Source};
    use anyhow::anyhow;
    use itertools::Itertools as _;
    use std::sync::Mutex;

    fn options() -> Options<i32, i32> {
        Options::new()
    }

    #[test]
    fn results_come_back_in_source_order() {
        let factory = JobFactory::new(Source::from((1..=100).collect_vec()), None);
        let outcome = run(&factory, &options(), &|x, _| Ok::<_, Fault>(x * x), 4);
        assert_eq!(
            outcome.unwrap().unwrap(),
            (1..=100).map(|x| x * x).collect_vec()
        );
    }

    #[test]
    fn a_break_verdict_yields_none_and_stops_dispatch() {
        let calls = Mutex::new(0);
        let factory = JobFactory::new(Source::from((1..=1000).collect_vec()), None);
        let outcome = run(
            &factory,
            &options(),
            &|x, _| {
                *calls.lock().unwrap() += 1;
                if x == 5 {
                    Err(Fault::Break)
                } else {
                    Ok(x)
                }
            },
            2,
        );
        assert_eq!(outcome.unwrap(), None);
        // Two workers: at most one job each was already in flight when the
        // verdict landed.
        assert!(*calls.lock().unwrap() <= 7);
    }

    #[test]
    fn a_kill_verdict_behaves_like_break_here() {
        let factory = JobFactory::new(Source::from((1..=10).collect_vec()), None);
        let outcome = run(
            &factory,
            &options(),
            &|x, _| if x == 1 { Err(Fault::Kill) } else { Ok(x) },
            2,
        );
        assert_eq!(outcome.unwrap(), None);
    }

    #[test]
    fn callback_errors_surface_with_their_message() {
        let factory = JobFactory::new(Source::from((1..=10).collect_vec()), None);
        let outcome = run(
            &factory,
            &options(),
            &|x, _| {
                if x == 3 {
                    Err(Fault::Error(anyhow!("boom")))
                } else {
                    Ok(x)
                }
            },
            3,
        );
        assert_eq!(outcome.unwrap_err().to_string(), "boom");
    }

    #[test]
    fn panics_are_contained_and_surfaced() {
        let factory = JobFactory::new(Source::from((1..=10).collect_vec()), None);
        let outcome = run(
            &factory,
            &options(),
            &|x, _| -> Result<i32, Fault> {
                if x == 2 {
                    panic!("sideways")
                }
                Ok(x)
            },
            2,
        );
        assert!(outcome.unwrap_err().to_string().contains("sideways"));
    }

    #[test]
    fn producer_items_are_each_dispatched_once() {
        let produced = Mutex::new(vec![10, 20, 30]);
        let factory = JobFactory::new(
            Source::from_fn(move || match produced.lock().unwrap().pop() {
                Some(item) => Produced::Item(item),
                None => Produced::Stop,
            }),
            None,
        );
        let outcome = run(&factory, &options(), &|x, _| Ok::<_, Fault>(x), 4);
        let results = outcome.unwrap().unwrap();
        assert_eq!(results.iter().sorted().collect_vec(), vec![&10, &20, &30]);
    }

    #[test]
    fn discarded_results_come_back_empty() {
        let factory = JobFactory::new(Source::from((1..=10).collect_vec()), None);
        let outcome = run(
            &factory,
            &options().preserve_results(false),
            &|x, _| Ok::<_, Fault>(x),
            2,
        );
        assert_eq!(outcome.unwrap(), Some(vec![]));
    }

    #[test]
    fn hooks_fire_for_every_job() {
        let starts = std::sync::Arc::new(Mutex::new(vec![]));
        let finishes = std::sync::Arc::new(Mutex::new(vec![]));
        let options = {
            let starts = starts.clone();
            let finishes = finishes.clone();
            Options::<i32, i32>::new()
                .start(move |item, index| starts.lock().unwrap().push((*item, index)))
                .finish(move |_, index, result| {
                    finishes.lock().unwrap().push((index, result.copied()))
                })
        };
        let factory = JobFactory::new(Source::from(vec![5, 6, 7]), None);
        run(&factory, &options, &|x, _| Ok::<_, Fault>(x + 1), 2)
            .unwrap()
            .unwrap();
        assert_eq!(starts.lock().unwrap().len(), 3);
        let finishes = finishes.lock().unwrap().iter().cloned().sorted().collect_vec();
        assert_eq!(finishes, vec![(0, Some(6)), (1, Some(7)), (2, Some(8))]);
    }
}
