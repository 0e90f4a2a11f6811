//! Contracted functions: a target wrapped in its pre/call/post chain

use crate::contract::{ContractChain, ContractCtx};
use crate::function::{BoxStream, Function};
use crate::hub::Hub;
use crate::stack::{self, Frame};
use crate::tree::NodeId;
use async_stream::try_stream;
use futures::StreamExt;
use plugtree_core::{Args, Convention, Error, Result, Signature, Value};
use std::sync::Arc;
use tracing::{debug_span, Instrument};

pub struct Contracted {
    name: String,
    reference: String,
    node: NodeId,
    unit: String,
    function: Function,
    chain: ContractChain,
}

impl Contracted {
    pub(crate) fn new(
        function: Function,
        reference: impl Into<String>,
        node: NodeId,
        unit: impl Into<String>,
        chain: ContractChain,
    ) -> Self {
        Self {
            name: function.name().to_string(),
            reference: reference.into(),
            node,
            unit: unit.into(),
            function,
            chain,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Name of the unit this function belongs to.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn signature(&self) -> &Signature {
        self.function.signature()
    }

    pub fn convention(&self) -> Convention {
        self.function.convention()
    }

    pub fn contracts(&self) -> &ContractChain {
        &self.chain
    }

    fn context(self: &Arc<Self>, hub: Hub, args: Args) -> Result<ContractCtx> {
        let bound = self.function.bind(&self.reference, &args)?;
        Ok(ContractCtx::new(hub, Arc::clone(self), args, bound))
    }

    /// Invoke through the contract chain. Stream targets are collected.
    pub async fn call(self: &Arc<Self>, hub: &Hub, args: Args) -> Result<Value> {
        if self.convention() == Convention::Stream {
            let mut items = self.stream(hub, args);
            let mut out = Vec::new();
            while let Some(item) = items.next().await {
                out.push(item?);
            }
            return Ok(Value::Array(out));
        }
        let span = debug_span!("invoke", reference = %self.reference);
        stack::scope(Arc::clone(self), Arc::clone(self).invoke(hub.clone(), args))
            .instrument(span)
            .await
    }

    async fn invoke(self: Arc<Self>, hub: Hub, args: Args) -> Result<Value> {
        let ctx = self.context(hub, args)?;
        self.run_pre(&ctx).await?;
        let value = match self.chain.call.first() {
            Some(hook) => hook.function.run(ctx.hook_call(hook)).await?,
            None => ctx.invoke_target().await?,
        };
        ctx.set_return_value(value);
        self.run_post(&ctx).await
    }

    async fn run_pre(&self, ctx: &ContractCtx) -> Result<()> {
        for hook in &self.chain.pre {
            let out = hook.function.run(ctx.hook_call(hook)).await?;
            if let Some(message) = rejection(&out) {
                return Err(Error::precondition_failed(&hook.reference, &self.reference, message));
            }
        }
        Ok(())
    }

    /// Post hooks in reverse discovery order; each result replaces the running value.
    async fn run_post(&self, ctx: &ContractCtx) -> Result<Value> {
        for hook in self.chain.post.iter().rev() {
            let value = hook.function.run(ctx.hook_call(hook)).await?;
            ctx.set_return_value(value);
        }
        Ok(ctx.return_value().unwrap_or(Value::Null))
    }

    async fn open(&self, ctx: &ContractCtx) -> Result<BoxStream<'static, Result<Value>>> {
        self.run_pre(ctx).await?;
        match self.chain.call.first() {
            Some(hook) => hook.function.open_stream(ctx.hook_call(hook)),
            None => ctx.open_target_stream(),
        }
    }

    /// Lazily evaluated invocation of a stream target. Pre hooks run once on the
    /// first poll; every element passes through the post chain.
    pub fn stream(self: &Arc<Self>, hub: &Hub, args: Args) -> BoxStream<'static, Result<Value>> {
        let this = Arc::clone(self);
        let hub = hub.clone();
        let frame = Frame::push(Arc::clone(self));
        let span = debug_span!("invoke", reference = %self.reference);
        Box::pin(try_stream! {
            let ctx = this.context(hub, args)?;
            let mut items = stack::reenter(Some(frame.clone()), this.open(&ctx))
                .instrument(span.clone())
                .await?;
            while let Some(item) = stack::reenter(Some(frame.clone()), items.next()).await {
                ctx.set_return_value(item?);
                let value = stack::reenter(Some(frame.clone()), this.run_post(&ctx))
                    .instrument(span.clone())
                    .await?;
                yield value;
            }
        })
    }
}

/// A pre hook rejects by returning `false` or a `false`-led array.
fn rejection(value: &Value) -> Option<String> {
    match value {
        Value::Bool(false) => Some("pre contract returned false".to_string()),
        Value::Array(items) if items.first() == Some(&Value::Bool(false)) => Some(
            items
                .get(1)
                .map(plugtree_core::value_text)
                .unwrap_or_else(|| "pre contract returned false".to_string()),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pre_rejection_shapes() {
        assert!(rejection(&json!(false)).is_some());
        assert_eq!(rejection(&json!([false, "two args"])).as_deref(), Some("two args"));
        assert!(rejection(&json!(true)).is_none());
        assert!(rejection(&json!(null)).is_none());
        assert!(rejection(&json!("false")).is_none());
        assert!(rejection(&json!([true, "ok"])).is_none());
    }
}
