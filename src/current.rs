use std::cell::RefCell;
use std::rc::Rc;

use crate::coroutine::Coroutine;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Coroutine>>> = const { RefCell::new(None) };
}

/// The coroutine running on this thread.
///
/// The first call on a thread adopts the thread's native stack as the root
/// coroutine; from then on the register is never empty. Failing to adopt
/// the thread is fatal.
pub fn current() -> Rc<Coroutine> {
    CURRENT.with(|cell| {
        if let Some(current) = cell.borrow().as_ref() {
            return current.clone();
        }
        let root = match Coroutine::adopt_thread() {
            Ok(root) => root,
            Err(e) => crate::die(&format!("can not adopt the thread as a coroutine: {}", e)),
        };
        *cell.borrow_mut() = Some(root.clone());
        root
    })
}

/// Written only immediately before and after a context switch.
pub(crate) fn set_current(coroutine: Rc<Coroutine>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(coroutine));
}

/// Tolerates TLS teardown so `Drop` impls may call it.
pub(crate) fn is_current(coroutine: &Coroutine) -> bool {
    CURRENT
        .try_with(|cell| match cell.borrow().as_ref() {
            Some(current) => std::ptr::eq(Rc::as_ptr(current), coroutine),
            None => false,
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;

    #[test]
    fn first_use_adopts_the_thread() {
        let root = current();
        assert_eq!(root.state(), State::Started);
        assert!(root.previous().is_none());
        assert!(is_current(&root));
        assert!(Rc::ptr_eq(&root, &current()));
    }

    #[test]
    fn each_thread_gets_its_own_root() {
        let here = Rc::as_ptr(&current()) as usize;
        let there = std::thread::spawn(|| Rc::as_ptr(&current()) as usize)
            .join()
            .unwrap();
        assert_ne!(here, there);
    }
}
