//! Panic Capture
//!
//! User closures (thunks, continuations, finalizers, callbacks) run on
//! worker threads. A panic in any of them must not take a worker down; it is
//! caught here and turned into a [`Defect`] that travels through the
//! failing fiber's `Die` channel instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use marrow_runtime::panic::{catch_defect, panic_count};
//!
//! let result = catch_defect(|| -> i32 { panic!("oops") });
//! assert_eq!(result.unwrap_err().message(), "panic: oops");
//! assert!(panic_count() >= 1);
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cause::Defect;

/// Counter for panics captured from user code.
static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, converting a panic into a [`Defect`].
///
/// The closure is wrapped in `AssertUnwindSafe`: state touched by a
/// panicking closure belongs to that closure's fiber, which is failed
/// with the defect and never resumes.
pub fn catch_defect<F, R>(f: F) -> Result<R, Defect>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        PANIC_COUNT.fetch_add(1, Ordering::Relaxed);
        let message = panic_message(payload.as_ref());
        tracing::debug!(%message, "captured panic from user code");
        Defect::new(format!("panic: {}", message))
    })
}

/// Number of panics captured since process start.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_defect_success() {
        assert_eq!(catch_defect(|| 42), Ok(42));
    }

    #[test]
    fn test_catch_defect_str() {
        let before = panic_count();
        let result = catch_defect(|| -> i32 { panic!("static message") });
        assert_eq!(result.unwrap_err().message(), "panic: static message");
        assert!(panic_count() > before);
    }

    #[test]
    fn test_catch_defect_string() {
        let result = catch_defect(|| -> () { panic!("formatted {}", 7) });
        assert_eq!(result.unwrap_err().message(), "panic: formatted 7");
    }

    #[test]
    fn test_panic_message_unknown_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
