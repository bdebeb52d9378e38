use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::current;
use crate::event::Event;
use crate::exceptions::{CoroutineException, ExitException};
use crate::sys;

/// Stack size used by [`Coroutine::spawn`].
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Life-cycle phase. Only ever moves forward:
/// `Initialized` → `Started` → `Stopped` → `Joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed; no execution context exists yet.
    Initialized,
    /// The entry trampoline has begun executing.
    Started,
    /// The body returned, was cancelled, or panicked.
    Stopped,
    /// Reaped by an outer join facility.
    Joined,
}

/// Outcome of [`Coroutine::resume`] and [`Coroutine::raise`].
#[derive(Debug)]
#[must_use]
pub enum Resume {
    /// A switch happened and control came back normally.
    Resumed,
    /// Refused; no switch happened.
    Failed,
    /// Control came back carrying a cancellation aimed at the caller.
    Cancelled(Box<dyn CoroutineException>),
}

impl Resume {
    #[inline]
    pub fn is_resumed(&self) -> bool {
        matches!(self, Resume::Resumed)
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Resume::Failed)
    }

    /// `?`-friendly form for coroutine bodies: a delivered cancellation
    /// becomes `Err`; `Ok(true)` means a switch happened.
    pub fn into_result(self) -> Result<bool, Box<dyn CoroutineException>> {
        match self {
            Resume::Resumed => Ok(true),
            Resume::Failed => Ok(false),
            Resume::Cancelled(exception) => Err(exception),
        }
    }
}

/// How a coroutine ended; payload of the `finished` hook.
#[derive(Debug)]
pub enum Termination {
    /// The body returned.
    Completed,
    /// A cancellation unwound the body; exit requests land here too.
    Cancelled(Box<dyn CoroutineException>),
    /// The body panicked. The panic stops at the trampoline: letting it
    /// unwind across a raw context switch is undefined behavior.
    Panicked(Option<String>),
}

type Body = Box<dyn FnOnce() -> Result<(), Box<dyn CoroutineException>>>;

/// A stackful cooperative coroutine.
///
/// One `Coroutine` owns one execution context, created lazily on the first
/// resume. Control moves between coroutines only through [`resume`], plus
/// the implicit switches performed by [`raise`] and by the finish path;
/// between switches a coroutine owns its stack exclusively. The type is
/// neither `Send` nor `Sync`: a coroutine belongs to the thread whose
/// chain created it.
///
/// [`resume`]: Coroutine::resume
/// [`raise`]: Coroutine::raise
pub struct Coroutine {
    state: Cell<State>,
    /// Set once when context creation fails; every later resume fails fast.
    bad: Cell<bool>,
    stack_size: usize,
    /// Where control goes when this coroutine finishes. Lookup only, never
    /// extends the target's lifetime.
    previous: Weak<Coroutine>,
    myself: Weak<Coroutine>,
    context: RefCell<Option<sys::Context>>,
    /// At most one armed cancellation, consumed at the next switch back in.
    pending: RefCell<Option<Box<dyn CoroutineException>>>,
    body: RefCell<Option<Body>>,
    started: Event<()>,
    finished: Event<Termination>,
}

impl Coroutine {
    /// `previous` is where control returns when this coroutine finishes.
    /// `stack_size` 0 is reserved for the adopted root and must not be
    /// passed here.
    pub fn new<F>(previous: Option<&Rc<Coroutine>>, stack_size: usize, body: F) -> Rc<Coroutine>
    where
        F: FnOnce() -> Result<(), Box<dyn CoroutineException>> + 'static,
    {
        debug_assert!(
            stack_size != 0,
            "stack size 0 is reserved for the adopted root"
        );
        Rc::new_cyclic(|myself| Coroutine {
            state: Cell::new(State::Initialized),
            bad: Cell::new(false),
            stack_size,
            previous: previous.map(Rc::downgrade).unwrap_or_default(),
            myself: myself.clone(),
            context: RefCell::new(None),
            pending: RefCell::new(None),
            body: RefCell::new(Some(Box::new(body))),
            started: Event::new(),
            finished: Event::new(),
        })
    }

    /// A coroutine returning to the caller's, with the default stack
    /// size.
    pub fn spawn<F>(body: F) -> Rc<Coroutine>
    where
        F: FnOnce() -> Result<(), Box<dyn CoroutineException>> + 'static,
    {
        Self::new(Some(&current::current()), DEFAULT_STACK_SIZE, body)
    }

    /// Root constructor: adopts the calling thread's native stack. Called
    /// once per thread by the current-coroutine register.
    pub(crate) fn adopt_thread() -> std::io::Result<Rc<Coroutine>> {
        let context = sys::Context::adopt_current_thread()?;
        Ok(Rc::new_cyclic(|myself| Coroutine {
            // Already running by construction.
            state: Cell::new(State::Started),
            bad: Cell::new(false),
            stack_size: 0,
            previous: Weak::new(),
            myself: myself.clone(),
            context: RefCell::new(Some(context)),
            pending: RefCell::new(None),
            body: RefCell::new(None),
            started: Event::new(),
            finished: Event::new(),
        }))
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// The coroutine control returns to when this one finishes.
    pub fn previous(&self) -> Option<Rc<Coroutine>> {
        self.previous.upgrade()
    }

    /// `true` once context creation has failed; the coroutine can never
    /// run.
    #[inline]
    pub fn is_bad(&self) -> bool {
        self.bad.get()
    }

    /// Fires once, before any of the body runs.
    #[inline]
    pub fn started(&self) -> &Event<()> {
        &self.started
    }

    /// Fires once, after the body terminated, before control returns to
    /// `previous`.
    #[inline]
    pub fn finished(&self) -> &Event<Termination> {
        &self.finished
    }

    /// `Stopped` → `Joined`, for the outer join facility. Refuses any
    /// other starting state.
    pub fn mark_joined(&self) -> bool {
        if self.state.get() == State::Stopped {
            self.state.set(State::Joined);
            true
        } else {
            false
        }
    }

    fn init_context(&self) -> bool {
        if self.context.borrow().is_some() {
            return true;
        }
        let arg = self as *const Coroutine as *mut c_void;
        match sys::Context::new(trampoline, arg, self.stack_size) {
            Ok(context) => {
                *self.context.borrow_mut() = Some(context);
                true
            }
            Err(e) => {
                log::warn!("can not create an execution context: {}", e);
                self.bad.set(true);
                false
            }
        }
    }

    /// Switches control from the calling coroutine into this one.
    ///
    /// Returns [`Resume::Resumed`] once something switches back to the
    /// caller, [`Resume::Failed`] without switching when this coroutine
    /// cannot run (bad, already finished, or the caller itself), and
    /// [`Resume::Cancelled`] when the switch back delivered a cancellation
    /// aimed at the caller.
    pub fn resume(&self) -> Resume {
        if self.bad.get() {
            return Resume::Failed;
        }
        if !matches!(self.state.get(), State::Initialized | State::Started) {
            return Resume::Failed;
        }
        if !self.init_context() {
            return Resume::Failed;
        }

        let old = current::current();
        if std::ptr::eq(Rc::as_ptr(&old), self) {
            log::warn!("a coroutine can not resume itself");
            return Resume::Failed;
        }
        let me = match self.myself.upgrade() {
            Some(me) => me,
            None => return Resume::Failed,
        };

        let to = match self.context.borrow().as_ref() {
            Some(context) => context.raw(),
            None => return Resume::Failed,
        };
        let from = match old.context.borrow().as_ref() {
            Some(context) => context.raw(),
            None => {
                log::warn!("the calling coroutine has no execution context");
                return Resume::Failed;
            }
        };

        current::set_current(me);
        unsafe { sys::Context::switch(from, to) };

        // Back on `old`'s stack. A chain of switches may have handed
        // control back without anyone re-registering `old`.
        if !current::is_current(&old) {
            current::set_current(old.clone());
        }
        let taken = old.pending.borrow_mut().take();
        match taken {
            Some(exception) => Resume::Cancelled(exception),
            None => Resume::Resumed,
        }
    }

    /// Asks this coroutine to terminate: arms `exception` (an
    /// [`ExitException`] when `None`) and delivers it by resuming the
    /// target, so the cancellation surfaces at the target's own suspension
    /// point. Delivery completes before this call returns, and its outcome
    /// is handed to the caller, including a cancellation that was aimed at
    /// the raiser itself while it delivered.
    pub fn raise(&self, exception: Option<Box<dyn CoroutineException>>) -> Resume {
        if current::is_current(self) {
            log::warn!("a coroutine can not kill itself");
            return Resume::Failed;
        }
        if self.pending.borrow().is_some() {
            log::warn!("coroutine already has a pending cancellation");
            return Resume::Failed;
        }
        if self.state.get() != State::Started {
            log::warn!("can not raise on a coroutine that is not started");
            return Resume::Failed;
        }

        *self.pending.borrow_mut() = Some(exception.unwrap_or_else(|| Box::new(ExitException)));
        let delivery = self.resume();
        if delivery.is_failed() {
            // The switch never happened; do not leave the payload armed.
            self.pending.borrow_mut().take();
        }
        delivery
    }

    /// Runs on this coroutine's own stack, right after the body
    /// terminated. The switch out of here never comes back, and this stack
    /// is freed without unwinding, so no strong reference may be live at
    /// the switch; `resume` is not usable for that last hop.
    fn cleanup(&self) {
        let Some(previous) = self.previous.upgrade() else {
            // Fall off the end of the context, ending the thread's
            // coroutine chain.
            return;
        };
        if previous.bad.get() || !matches!(previous.state(), State::Initialized | State::Started) {
            log::warn!("finished coroutine could not return control to its previous");
            return;
        }
        let to = match previous.context.borrow().as_ref() {
            Some(context) => context.raw(),
            None => {
                log::warn!("finished coroutine could not return control to its previous");
                return;
            }
        };
        let from = match self.context.borrow().as_ref() {
            Some(context) => context.raw(),
            None => return,
        };
        // Hands the only strong reference in this frame to the register.
        current::set_current(previous);
        unsafe { sys::Context::switch(from, to) };
        // Never reached: nothing resumes a stopped coroutine.
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if current::is_current(self) {
            log::warn!("dropping the coroutine that is currently running");
        }
        // The context goes with us. A stack freed while suspended is not
        // unwound, so values parked on it leak.
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        Some((*message).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

/// First and only frame on an allocated context's stack.
unsafe extern "C" fn trampoline(arg: *mut c_void) {
    let q = &*(arg as *const Coroutine);
    q.state.set(State::Started);
    q.started.notify(&());

    let body = q.body.borrow_mut().take();
    let outcome = match body {
        Some(body) => catch_unwind(AssertUnwindSafe(body)),
        None => Ok(Ok(())),
    };
    let termination = match outcome {
        Ok(Ok(())) => Termination::Completed,
        Ok(Err(exception)) => Termination::Cancelled(exception),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::warn!(
                "coroutine body panicked: {}",
                message.as_deref().unwrap_or("<non-string payload>")
            );
            Termination::Panicked(message)
        }
    };
    q.state.set(State::Stopped);
    q.finished.notify(&termination);
    // This stack is abandoned at the switch below; nothing owned may
    // outlive this point.
    drop(termination);
    q.cleanup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current::current;
    use crate::exceptions::GenericException;
    use std::cell::RefCell;

    fn yield_to_previous() -> Result<(), Box<dyn CoroutineException>> {
        let previous = current().previous().expect("no previous coroutine");
        previous.resume().into_result()?;
        Ok(())
    }

    #[test]
    fn runs_to_completion_and_returns_to_previous() {
        let root = current();
        let counter = Rc::new(Cell::new(0));
        let seen = counter.clone();
        let co = Coroutine::new(Some(&root), DEFAULT_STACK_SIZE, move || {
            seen.set(1);
            yield_to_previous()?;
            seen.set(2);
            Ok(())
        });
        assert_eq!(co.state(), State::Initialized);

        assert!(co.resume().is_resumed());
        assert_eq!(counter.get(), 1);
        assert_eq!(co.state(), State::Started);

        assert!(co.resume().is_resumed());
        assert_eq!(counter.get(), 2);
        assert_eq!(co.state(), State::Stopped);
    }

    #[test]
    fn stopped_coroutine_can_not_be_resumed() {
        let co = Coroutine::spawn(|| Ok(()));
        assert!(co.resume().is_resumed());
        assert_eq!(co.state(), State::Stopped);
        assert!(co.resume().is_failed());
        assert!(co.mark_joined());
        assert!(co.resume().is_failed());
    }

    #[test]
    fn self_resume_is_refused() {
        let refused = Rc::new(Cell::new(false));
        let seen = refused.clone();
        let co = Coroutine::spawn(move || {
            seen.set(current().resume().is_failed());
            Ok(())
        });
        assert!(co.resume().is_resumed());
        assert!(refused.get());
    }

    #[test]
    fn started_and_finished_fire_exactly_once() {
        let started = Rc::new(Cell::new(0));
        let finished = Rc::new(Cell::new(0));
        let co = Coroutine::spawn(|| {
            yield_to_previous()?;
            Ok(())
        });
        let s = started.clone();
        co.started().add_callback(move |_| s.set(s.get() + 1));
        let f = finished.clone();
        co.finished().add_callback(move |_| f.set(f.get() + 1));

        assert!(co.resume().is_resumed());
        assert_eq!((started.get(), finished.get()), (1, 0));
        assert!(co.resume().is_resumed());
        assert_eq!((started.get(), finished.get()), (1, 1));
    }

    #[test]
    fn panicking_body_stops_cleanly() {
        let finished = Rc::new(Cell::new(0));
        let panicked = Rc::new(Cell::new(false));
        let co = Coroutine::spawn(|| panic!("boom"));
        let f = finished.clone();
        let p = panicked.clone();
        co.finished().add_callback(move |termination| {
            f.set(f.get() + 1);
            if let Termination::Panicked(Some(message)) = termination {
                p.set(message.as_str() == "boom");
            }
        });

        // No panic observable here; the resume completes normally.
        assert!(co.resume().is_resumed());
        assert_eq!(co.state(), State::Stopped);
        assert_eq!(finished.get(), 1);
        assert!(panicked.get());
    }

    #[test]
    fn raise_delivers_exit_and_stops_target() {
        let cancelled = Rc::new(Cell::new(false));
        let seen = cancelled.clone();
        let co = Coroutine::spawn(move || loop {
            if let Err(e) = yield_to_previous() {
                seen.set(e.is_exit());
                return Err(e);
            }
        });
        assert!(co.resume().is_resumed());
        assert_eq!(co.state(), State::Started);

        assert!(co.raise(None).is_resumed());
        assert_eq!(co.state(), State::Stopped);
        assert!(cancelled.get());
    }

    #[test]
    fn raise_with_custom_exception() {
        let text = Rc::new(RefCell::new(String::new()));
        let seen = text.clone();
        let co = Coroutine::spawn(move || loop {
            if let Err(e) = yield_to_previous() {
                seen.borrow_mut().push_str(e.description());
                return Err(e);
            }
        });
        assert!(co.resume().is_resumed());
        assert!(co
            .raise(Some(Box::new(GenericException::new("shutting down"))))
            .is_resumed());
        assert_eq!(text.borrow().as_str(), "shutting down");
        assert_eq!(co.state(), State::Stopped);
    }

    #[test]
    fn finished_payload_reports_cancellation() {
        let report = Rc::new(RefCell::new(String::new()));
        let co = Coroutine::spawn(|| {
            yield_to_previous()?;
            Ok(())
        });
        let r = report.clone();
        co.finished().add_callback(move |termination| {
            *r.borrow_mut() = match termination {
                Termination::Completed => "completed".to_string(),
                Termination::Cancelled(e) => format!("cancelled: {}", e.description()),
                Termination::Panicked(_) => "panicked".to_string(),
            };
        });
        assert!(co.resume().is_resumed());
        assert!(co.raise(None).is_resumed());
        assert_eq!(report.borrow().as_str(), "cancelled: coroutine exit");
    }

    #[test]
    fn raise_on_self_and_wrong_states_is_refused() {
        let root = current();

        // Not started yet: no established suspension point to deliver to.
        let co = Coroutine::new(Some(&root), DEFAULT_STACK_SIZE, || Ok(()));
        assert!(co.raise(None).is_failed());
        assert!(co.pending.borrow().is_none());
        assert_eq!(co.state(), State::Initialized);

        // The running coroutine itself.
        let refused = Rc::new(Cell::new(false));
        let seen = refused.clone();
        let co = Coroutine::spawn(move || {
            seen.set(current().raise(None).is_failed());
            Ok(())
        });
        assert!(co.resume().is_resumed());
        assert!(refused.get());

        // Already stopped.
        assert!(co.raise(None).is_failed());
    }

    #[test]
    fn second_raise_while_one_is_pending_is_refused() {
        let co = Coroutine::spawn(|| {
            yield_to_previous()?;
            Ok(())
        });
        assert!(co.resume().is_resumed());

        *co.pending.borrow_mut() = Some(Box::new(ExitException));
        assert!(co
            .raise(Some(Box::new(GenericException::new("second"))))
            .is_failed());
        // The armed object is untouched.
        assert!(co.pending.borrow().as_ref().map_or(false, |e| e.is_exit()));
    }

    #[test]
    fn child_can_cancel_the_root_resume() {
        let delivery_done = Rc::new(Cell::new(false));
        let seen = delivery_done.clone();
        let co = Coroutine::spawn(move || {
            let root = current().previous().expect("no previous coroutine");
            let delivery = root.raise(Some(Box::new(GenericException::new("wake up"))));
            seen.set(delivery.is_resumed());
            Ok(())
        });

        match co.resume() {
            Resume::Cancelled(e) => assert_eq!(e.description(), "wake up"),
            other => panic!("expected a cancellation, got {:?}", other),
        }
        assert_eq!(co.state(), State::Started);

        // Resume the child out of its delivery switch; it then finishes.
        assert!(co.resume().is_resumed());
        assert!(delivery_done.get());
        assert_eq!(co.state(), State::Stopped);
    }

    #[test]
    fn body_may_decline_a_cancellation() {
        let co = Coroutine::spawn(|| {
            let mut cancellations = 0;
            while cancellations == 0 {
                if yield_to_previous().is_err() {
                    cancellations += 1;
                }
            }
            yield_to_previous()?;
            Ok(())
        });
        assert!(co.resume().is_resumed());
        // Delivered, swallowed, parked again.
        assert!(co.raise(None).is_resumed());
        assert_eq!(co.state(), State::Started);
        assert!(co.resume().is_resumed());
        assert_eq!(co.state(), State::Stopped);
    }

    #[test]
    fn nested_chain_returns_level_by_level() {
        let root = current();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let outer = Coroutine::new(Some(&root), DEFAULT_STACK_SIZE, move || {
            o.borrow_mut().push("outer:in");
            let oo = o.clone();
            let inner = Coroutine::spawn(move || {
                oo.borrow_mut().push("inner:in");
                Ok(())
            });
            let resumed = inner.resume().is_resumed();
            o.borrow_mut()
                .push(if resumed { "inner:done" } else { "inner:failed" });
            Ok(())
        });

        assert!(outer.resume().is_resumed());
        assert_eq!(outer.state(), State::Stopped);
        assert_eq!(*order.borrow(), vec!["outer:in", "inner:in", "inner:done"]);
    }

    #[test]
    fn failed_context_creation_marks_bad_and_preserves_register() {
        let root = current();
        let co = Coroutine::new(Some(&root), usize::MAX, || Ok(()));
        assert!(co.resume().is_failed());
        assert!(co.is_bad());
        assert_eq!(co.state(), State::Initialized);
        assert!(Rc::ptr_eq(&root, &current()));
        // Stays bad.
        assert!(co.resume().is_failed());
        assert!(co.raise(None).is_failed());
    }

    #[test]
    fn mark_joined_only_from_stopped() {
        let co = Coroutine::spawn(|| Ok(()));
        assert!(!co.mark_joined());
        assert!(co.resume().is_resumed());
        assert!(co.mark_joined());
        assert_eq!(co.state(), State::Joined);
        assert!(!co.mark_joined());
    }
}
