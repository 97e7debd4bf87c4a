//! Serial execution in the caller's thread, for a resolved pool size of zero.

use crate::dispatch::{invoke, Board, Hooks};
use crate::factory::JobFactory;
use crate::options::Options;
use fanout_base::{DispatchResult, Fault};

pub(crate) fn run<I, O, F>(
    factory: &JobFactory<I>,
    options: &Options<I, O>,
    call: &F,
) -> DispatchResult<Option<Vec<O>>>
where
    I: Clone,
    F: Fn(I, usize) -> Result<O, Fault>,
{
    let board = Board::new(if options.preserve_results {
        factory.size()
    } else {
        None
    });
    let hooks = Hooks::new(options);
    while let Some((item, index)) = factory.next() {
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
    }
    board.into_outcome(options.preserve_results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Source;
    use anyhow::anyhow;

    #[test]
    fn runs_everything_in_order() {
        let factory = JobFactory::new(Source::from(vec![1, 2, 3]), None);
        let outcome = run(&factory, &Options::new(), &|x: i32, _| Ok::<_, Fault>(x * 10));
        assert_eq!(outcome.unwrap(), Some(vec![10, 20, 30]));
    }

    #[test]
    fn stops_at_the_first_fault() {
        let calls = std::sync::Mutex::new(0);
        let factory = JobFactory::new(Source::from(vec![1, 2, 3]), None);
        let outcome = run(&factory, &Options::new(), &|x: i32, _| {
            *calls.lock().unwrap() += 1;
            if x == 2 {
                Err(Fault::Error(anyhow!("boom")))
            } else {
                Ok(x)
            }
        });
        assert!(outcome.is_err());
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
