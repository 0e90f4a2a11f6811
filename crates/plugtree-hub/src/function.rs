//! Plugin functions: one uniform async calling convention over three body kinds

use crate::contract::ContractCtx;
use crate::hub::Hub;
use crate::stack;
use futures::{Stream, StreamExt};
use plugtree_core::{Args, Convention, Error, Map, Result, Signature, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

pub type AsyncBody = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type BlockingBody = Arc<dyn Fn(Call) -> Result<Value> + Send + Sync>;
pub type StreamBody = Arc<dyn Fn(Call) -> BoxStream<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub enum Body {
    Async(AsyncBody),
    /// Synchronous body, always executed off the scheduler thread.
    Blocking(BlockingBody),
    Stream(StreamBody),
}

/// A named plugin function with its parameter signature.
#[derive(Clone)]
pub struct Function {
    name: String,
    signature: Arc<Signature>,
    body: Body,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("signature", &self.signature.to_string())
            .field("convention", &self.convention())
            .finish()
    }
}

impl Function {
    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            signature: Arc::new(Signature::variadic()),
            body: Body::Async(Arc::new(move |call| Box::pin(f(call)))),
        }
    }

    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Call) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            signature: Arc::new(Signature::variadic()),
            body: Body::Blocking(Arc::new(f)),
        }
    }

    pub fn stream<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Call) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            signature: Arc::new(Signature::variadic()),
            body: Body::Stream(Arc::new(move |call| Box::pin(f(call)))),
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Arc::new(signature);
        self
    }

    /// Same body under another name (symbol aliasing).
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn convention(&self) -> Convention {
        match self.body {
            Body::Async(_) => Convention::Async,
            Body::Blocking(_) => Convention::Sync,
            Body::Stream(_) => Convention::Stream,
        }
    }

    /// Bind arguments against this function's signature.
    pub fn bind(&self, target: &str, args: &Args) -> Result<Map> {
        self.signature
            .bind(args)
            .map_err(|message| Error::bind_error(target, message))
    }

    /// Run the body to completion. Stream bodies are collected into an array.
    pub async fn run(&self, call: Call) -> Result<Value> {
        match &self.body {
            Body::Async(body) => body(call).await,
            Body::Blocking(body) => {
                let body = Arc::clone(body);
                let frame = stack::current();
                tokio::task::spawn_blocking(move || stack::sync_scope(frame, || body(call)))
                    .await
                    .map_err(|e| Error::Runtime(format!("blocking call failed: {}", e)))?
            }
            Body::Stream(body) => {
                let mut items = body(call);
                let mut out = Vec::new();
                while let Some(item) = items.next().await {
                    out.push(item?);
                }
                Ok(Value::Array(out))
            }
        }
    }

    /// Open the body as a stream. Only stream bodies produce sequences.
    pub fn open_stream(&self, call: Call) -> Result<BoxStream<'static, Result<Value>>> {
        match &self.body {
            Body::Stream(body) => Ok(body(call)),
            _ => Err(Error::Runtime(format!(
                "{} is {}, a stream is required",
                self.name,
                self.convention()
            ))),
        }
    }
}

/// Everything a function body receives for one invocation.
#[derive(Clone)]
pub struct Call {
    hub: Hub,
    args: Args,
    bound: Map,
    ctx: Option<ContractCtx>,
    reference: String,
}

impl Call {
    pub(crate) fn new(hub: Hub, args: Args, bound: Map, reference: impl Into<String>) -> Self {
        Self {
            hub,
            args,
            bound,
            ctx: None,
            reference: reference.into(),
        }
    }

    pub(crate) fn with_contract(mut self, ctx: ContractCtx) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn bound(&self) -> &Map {
        &self.bound
    }

    /// A bound parameter by name, falling back to the raw keywords.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.bound.get(name).or_else(|| self.args.keywords.get(name))
    }

    pub fn arg_i64(&self, name: &str) -> Option<i64> {
        self.arg(name).and_then(Value::as_i64)
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.arg(name).and_then(Value::as_str)
    }

    /// The contract context, present when this body runs as a contract hook.
    pub fn contract(&self) -> Option<&ContractCtx> {
        self.ctx.as_ref()
    }

    /// Fully qualified reference of the function being invoked.
    pub fn reference(&self) -> &str {
        &self.reference
    }
}
