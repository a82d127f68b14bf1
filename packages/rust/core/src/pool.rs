//! Bounded parallel map for blocking work.

use std::sync::Arc;

use ctfforge_shared::{CtfForgeError, Result};
use tokio::sync::Semaphore;

/// Run `f` over `items` on the blocking pool with at most `workers` calls in
/// flight. Results come back in input order. A panic inside `f` is resumed
/// on the caller.
pub async fn map_blocking<T, R, F>(items: Vec<T>, workers: usize, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let f = Arc::new(f);

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let sem = semaphore.clone();
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || f(item)).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) | Err(e) => {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                return Err(CtfForgeError::generation(format!("worker task cancelled: {e}")));
            }
        }
    }
    Ok(results)
}
