use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type SharedCall<V> = Shared<BoxFuture<'static, Result<V, String>>>;

/// Collapses concurrent calls with the same key into one spawned task whose
/// output every caller receives.
///
/// The task removes its own key when it finishes, so the next call after
/// that starts fresh work. Because the work is spawned, it runs to
/// completion even if every caller stops waiting.
pub struct SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    calls: Arc<Mutex<HashMap<String, SharedCall<V>>>>,
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `make()` unless a call for `key` is already in flight, in which
    /// case its result is awaited instead. Returns `Err` with the panic or
    /// abort message if the spawned task did not complete.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<V, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock().await;
            match calls.get(key) {
                Some(call) => {
                    debug!(key, "Joining in-flight call");
                    call.clone()
                }
                None => {
                    let work = make();
                    let registry = Arc::clone(&self.calls);
                    let owned_key = key.to_string();
                    let handle = tokio::spawn(async move {
                        let value = work.await;
                        registry.lock().await.remove(&owned_key);
                        value
                    });
                    let call = async move { handle.await.map_err(|e| e.to_string()) }
                        .boxed()
                        .shared();
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };
        call.await
    }

    #[cfg(test)]
    async fn in_flight(&self) -> usize {
        self.calls.lock().await.len()
    }
}

impl<V> Default for SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
