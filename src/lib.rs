//! Stackful cooperative coroutines: the execution primitive underneath an
//! asynchronous networking stack. One OS thread runs one chain of
//! coroutines; control moves only at explicit resume points.

mod coroutine;
mod current;
mod event;
mod exceptions;
#[cfg(unix)]
mod stack;
mod sys;

pub use coroutine::{Coroutine, Resume, State, Termination, DEFAULT_STACK_SIZE};
pub use current::current;
pub use event::Event;
pub use exceptions::{CoroutineException, ExitException, GenericException};

pub type PhantomUnsync = std::marker::PhantomData<std::cell::Cell<()>>;
pub type PhantomUnsend = std::marker::PhantomData<std::sync::MutexGuard<'static, ()>>;

pub(crate) fn die(message: &str) -> ! {
    log::error!("{}, aborting.", message);
    eprintln!("{}, aborting.", message);
    std::process::abort();
}
