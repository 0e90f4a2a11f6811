//! Call stack: the currently executing reference, per task
//!
//! Frames are installed with `task_local` scopes, so the previous frame comes
//! back on every exit path, including when the future is dropped mid-call.

use crate::contracted::Contracted;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static FRAME: Frame;
}

#[derive(Clone)]
pub struct Frame {
    reference: String,
    active: Arc<Contracted>,
    previous: Option<Arc<Frame>>,
}

impl Frame {
    /// A frame for `active` on top of the current one.
    pub(crate) fn push(active: Arc<Contracted>) -> Self {
        Self {
            reference: active.reference().to_string(),
            previous: current().map(Arc::new),
            active,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn active(&self) -> &Arc<Contracted> {
        &self.active
    }

    pub fn previous(&self) -> Option<&Frame> {
        self.previous.as_deref()
    }
}

/// Innermost frame of the running task, if any.
pub fn current() -> Option<Frame> {
    FRAME.try_with(Clone::clone).ok()
}

/// Run `fut` with a new frame pushed on top of the current one.
pub async fn scope<F: Future>(active: Arc<Contracted>, fut: F) -> F::Output {
    FRAME.scope(Frame::push(active), fut).await
}

/// Re-enter an existing frame, e.g. on the blocking pool or around a stream poll.
pub async fn reenter<F: Future>(frame: Option<Frame>, fut: F) -> F::Output {
    match frame {
        Some(frame) => FRAME.scope(frame, fut).await,
        None => fut.await,
    }
}

pub fn sync_scope<R>(frame: Option<Frame>, f: impl FnOnce() -> R) -> R {
    match frame {
        Some(frame) => FRAME.sync_scope(frame, f),
        None => f(),
    }
}

/// References of every frame, innermost first.
pub fn call_stack() -> Vec<String> {
    let mut out = Vec::new();
    let mut frame = current();
    while let Some(f) = frame {
        out.push(f.reference.clone());
        frame = f.previous.as_deref().cloned();
    }
    out
}

/// Whether any frame on the current stack runs a function matching `pred`.
pub(crate) fn any_frame(pred: impl Fn(&Contracted) -> bool) -> bool {
    let mut frame = current();
    while let Some(f) = frame {
        if pred(&f.active) {
            return true;
        }
        frame = f.previous.as_deref().cloned();
    }
    false
}
