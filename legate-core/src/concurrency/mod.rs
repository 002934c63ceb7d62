//! Bridge between synchronous callers and the async lifecycle.

use std::future::Future;

/// Executes a future and blocks until its result is returned.
///
/// Supports both callers already inside a tokio runtime (the calling worker
/// thread is released to the runtime while blocking, so this must run on a
/// multi-threaded runtime) and plain synchronous callers, for which a
/// throwaway runtime is built.
pub fn run_sync<F: Future>(future: F) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(future)),
        Err(_) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build a runtime for the synchronous bridge")
            .block_on(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridges_without_a_runtime() {
        let value = run_sync(async { 21 * 2 });
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridges_inside_a_runtime() {
        let value = tokio::task::spawn_blocking(|| run_sync(async { 7 }))
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
