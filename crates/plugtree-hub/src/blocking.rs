//! Blocking entry points for callers outside any async context
//!
//! Each call gets a private current-thread runtime that is dropped before the
//! call returns. Inside a running runtime the private one lives on a helper
//! thread, since a runtime cannot be started on a thread that is driving one.
//! The caller's call frame travels with the future.

use crate::hub::{Hub, Resolved};
use crate::stack;
use plugtree_core::{Args, Error, Result, Value};
use std::future::Future;

fn run_once<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn block<F: Future<Output = Result<T>>, T>(fut: F) -> Result<T> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("cannot start runtime: {}", e)))?;
        let out = runtime.block_on(fut);
        drop(runtime);
        out
    }

    let fut = stack::reenter(stack::current(), fut);
    if tokio::runtime::Handle::try_current().is_ok() {
        std::thread::spawn(move || block(fut))
            .join()
            .map_err(|_| Error::Runtime("blocking helper thread panicked".into()))?
    } else {
        block(fut)
    }
}

impl Hub {
    /// [`Hub::resolve`] for synchronous callers.
    pub fn resolve_blocking(&self, path: &str) -> Result<Resolved> {
        let hub = self.clone();
        let path = path.to_string();
        run_once(async move { hub.resolve(&path).await })
    }

    /// [`Hub::call`] for synchronous callers.
    pub fn call_blocking(&self, path: &str, args: Args) -> Result<Value> {
        let hub = self.clone();
        let path = path.to_string();
        run_once(async move { hub.call(&path, args).await })
    }

    /// [`Hub::load_all`] for synchronous callers, over a whole subtree.
    pub fn load_all_blocking(&self, path: &str) -> Result<()> {
        let hub = self.clone();
        let id = self.node(path).ok_or_else(|| Error::not_found(path))?;
        run_once(async move { hub.load_all_recursive(id).await })
    }
}
