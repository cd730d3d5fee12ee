use crate::errors::{Error, Result};
use once_cell::sync::OnceCell;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

static FALLBACK: OnceCell<Runtime> = OnceCell::new();

fn fallback() -> Result<&'static Runtime> {
    FALLBACK.get_or_try_init(|| {
        Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("dualkey-rt")
            .build()
            .map_err(|err| Error::Config(format!("failed to start blocking runtime: {err}")))
    })
}

/// Drive `fut` to completion from synchronous code.
///
/// Outside any runtime a shared two-worker runtime is used. Inside a multi-threaded runtime the
/// current worker is handed over with `block_in_place`. A current-thread runtime cannot give up
/// its only worker, so that case is refused instead of deadlocking.
pub fn block_on<F>(fut: F) -> Result<F::Output>
where
    F: Future,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(
            Error::Config("blocking key operations need a multi-threaded runtime".into()),
        ),
        Ok(handle) => Ok(tokio::task::block_in_place(|| handle.block_on(fut))),
        Err(_) => Ok(fallback()?.block_on(fut)),
    }
}
