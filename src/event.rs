use std::cell::RefCell;

type Callback<T> = Box<dyn FnMut(&T)>;

/// Single-threaded observer list behind a coroutine's `started` and
/// `finished` hooks.
pub struct Event<T> {
    callbacks: RefCell<Vec<Callback<T>>>,
}

impl<T> Event<T> {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
        }
    }

    /// Registers `f` to run on every notification, after the callbacks
    /// already present.
    pub fn add_callback<F: FnMut(&T) + 'static>(&self, f: F) {
        self.callbacks.borrow_mut().push(Box::new(f));
    }

    pub(crate) fn notify(&self, payload: &T) {
        for callback in self.callbacks.borrow_mut().iter_mut() {
            callback(payload);
        }
    }
}
