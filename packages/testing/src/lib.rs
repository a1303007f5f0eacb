#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the unmanaged array packages.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than the timeout to complete, the calling test panics instead of
/// blocking the test run forever. The timeout is 10 seconds under normal conditions and
/// 60 seconds under Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly, so mutation testing can detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode) and resumes
/// the panic of the test function if it panics.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let sum = with_watchdog(|| 2 + 2);
/// assert_eq!(sum, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}
