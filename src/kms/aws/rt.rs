use once_cell::sync::OnceCell;
use tokio::runtime::{self, Runtime};

use crate::error::{Error, Result};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Drive an SDK future to completion from a blocking backend call.
///
/// Backend calls already run on a `Context::run` worker thread, never
/// inside a runtime, so a plain `block_on` is safe here.
pub fn sync_await<F>(fut: F) -> Result<F::Output>
where
    F: std::future::Future,
{
    let rt = RUNTIME
        .get_or_try_init(|| {
            runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .thread_name("sealwrap-aws-rt")
                .build()
        })
        .map_err(|e| Error::Internal(format!("start AWS runtime: {e}")))?;
    Ok(rt.block_on(fut))
}
