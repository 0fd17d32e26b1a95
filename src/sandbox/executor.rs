//! Runs submitted code on its own thread, away from the orchestrator's stack.

use std::any::Any;
use std::panic;
use std::thread;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rhai::{Engine, EvalAltResult, Scope, AST};

/// Held for the whole of a pipeline run; the panic hook swap below is
/// process-wide, so runs must not overlap.
static SINGLE_FLIGHT: Mutex<()> = parking_lot::const_mutex(());

pub fn single_flight() -> MutexGuard<'static, ()> {
    if let Some(guard) = SINGLE_FLIGHT.try_lock() {
        return guard;
    }
    log::warn!("Another grading run is in progress in this process, waiting for it to finish");
    SINGLE_FLIGHT.lock()
}

/// Runs its closure when dropped, on every exit path
struct Restore<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Restore<F> {
    fn drop(&mut self) {
        if let Some(restore) = self.0.take() {
            restore();
        }
    }
}

/// Replaces the panic hook with a silent one until the guard drops, so a
/// panic on the worker leaves no stack report behind.
fn silence_panics() -> Restore<impl FnOnce()> {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    Restore(Some(move || panic::set_hook(previous)))
}

/// Everything the worker hands back after joining
pub struct Outcome {
    pub engine: Engine,
    pub ast: AST,
    pub scope: Scope<'static>,
    pub error: Option<Box<EvalAltResult>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `ast` against `scope` on a fresh named thread and blocks until it
/// finishes. Script errors are part of the outcome; only a failure of the
/// worker itself is an `Err`.
///
/// `settle` runs on the worker too, so whatever the script left behind is
/// reduced and released there rather than on the caller's stack.
pub fn run_isolated<T, F>(engine: Engine, ast: AST, scope: Scope<'static>, stack_size: usize, settle: F) -> Result<T>
where
    F: FnOnce(Outcome) -> T + Send + 'static,
    T: Send + 'static,
{
    let _restore = silence_panics();

    let worker = thread::Builder::new()
        .name("submission".to_string())
        .stack_size(stack_size)
        .spawn(move || {
            let mut scope = scope;
            let error = engine.run_ast_with_scope(&mut scope, &ast).err();
            settle(Outcome {
                engine,
                ast,
                scope,
                error,
            })
        })
        .context("Failed to spawn submission worker")?;

    worker
        .join()
        .map_err(|payload| anyhow!("Submission worker panicked: {}", panic_message(&*payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const STACK: usize = 4 * 1024 * 1024;

    fn keep(outcome: Outcome) -> Outcome {
        outcome
    }

    fn panic_after() {
        panic!("after");
    }

    #[test]
    fn test_outcome_carries_scope_and_error() {
        let _flight = single_flight();
        let engine = Engine::new();
        let ast = engine.compile("let answer = 42; throw \"late\";").unwrap();
        let outcome = run_isolated(engine, ast, Scope::new(), STACK, keep).unwrap();
        assert_eq!(outcome.scope.get_value::<i64>("answer"), Some(42));
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_settle_runs_on_the_worker() {
        let _flight = single_flight();
        let engine = Engine::new();
        let ast = engine.compile("let x = 1;").unwrap();
        let name = run_isolated(engine, ast, Scope::new(), STACK, |_| {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(name.as_deref(), Some("submission"));
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let _flight = single_flight();
        let mut engine = Engine::new();
        engine.register_fn("explode", || -> i64 { panic!("kaboom") });
        let ast = engine.compile("explode();").unwrap();

        let err = match run_isolated(engine, ast, Scope::new(), STACK, keep) {
            Ok(_) => panic!("expected the worker to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_panic_hook_restored_after_worker_panic() {
        let _flight = single_flight();
        let fired = Arc::new(AtomicBool::new(false));
        let marker = Arc::clone(&fired);
        let original = panic::take_hook();
        panic::set_hook(Box::new(move |_| marker.store(true, Ordering::SeqCst)));

        let mut engine = Engine::new();
        engine.register_fn("explode", || -> i64 { panic!("kaboom") });
        let ast = engine.compile("explode();").unwrap();
        assert!(run_isolated(engine, ast, Scope::new(), STACK, keep).is_err());
        assert!(!fired.load(Ordering::SeqCst));

        let _ = thread::spawn(panic_after).join();
        panic::set_hook(original);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_single_flight_excludes_second_run() {
        let flight = single_flight();
        let (tx, rx) = mpsc::channel();
        let contender = thread::spawn(move || {
            tx.send(SINGLE_FLIGHT.try_lock().is_some()).unwrap();
            let _second = single_flight();
            tx.send(true).unwrap();
        });

        assert!(!rx.recv().unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(flight);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        contender.join().unwrap();
    }

    #[test]
    fn test_single_flight_is_reentrant_after_release() {
        drop(single_flight());
        drop(single_flight());
    }
}
