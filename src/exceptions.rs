use std::any::Any;
use std::fmt;

/// Why a coroutine is being asked to stop.
///
/// An open hierarchy: schedulers and user code define their own kinds by
/// implementing this trait. [`ExitException`] is the graceful default.
pub trait CoroutineException: Any + fmt::Debug {
    /// Short diagnostic text.
    fn description(&self) -> &str {
        "coroutine exception"
    }

    /// `true` only for the graceful exit request.
    fn is_exit(&self) -> bool {
        false
    }
}

/// Graceful termination request; the default payload of
/// [`Coroutine::raise`](crate::Coroutine::raise). A coroutine finishing
/// because it received this has terminated normally, not failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitException;

impl CoroutineException for ExitException {
    fn description(&self) -> &str {
        "coroutine exit"
    }

    fn is_exit(&self) -> bool {
        true
    }
}

/// Catch-all cancellation kind carrying a free-form message.
#[derive(Debug)]
pub struct GenericException {
    message: String,
}

impl GenericException {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl CoroutineException for GenericException {
    fn description(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_is_distinguished() {
        let exit: Box<dyn CoroutineException> = Box::new(ExitException);
        assert!(exit.is_exit());
        assert_eq!(exit.description(), "coroutine exit");

        let generic: Box<dyn CoroutineException> = Box::new(GenericException::new("going away"));
        assert!(!generic.is_exit());
        assert_eq!(generic.description(), "going away");
    }

    #[test]
    fn user_kinds_default_to_non_exit() {
        #[derive(Debug)]
        struct Custom;
        impl CoroutineException for Custom {}

        let custom: Box<dyn CoroutineException> = Box::new(Custom);
        assert!(!custom.is_exit());
        assert_eq!(custom.description(), "coroutine exception");
    }
}
