//! Contract engine: hook classification, discovery, and the per-call context
//!
//! Hooks are functions exported by contract units whose names follow
//! `[r_]<phase>[_<target>]`, with phase one of `sig`/`signature`, `pre`, `call`,
//! `post`. A bare phase applies to every function of the unit; a suffixed one
//! only to the named target. The `r_` prefix makes a hook visible to every
//! descendant node as well.

use crate::contracted::Contracted;
use crate::function::{BoxStream, Call, Function};
use crate::hub::Hub;
use crate::tree::NodeId;
use plugtree_core::{Args, Map, Result, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const RECURSIVE_PREFIX: &str = "r_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Signature,
    Pre,
    Call,
    Post,
}

impl Phase {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "sig" | "signature" => Some(Self::Signature),
            "pre" => Some(Self::Pre),
            "call" => Some(Self::Call),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

/// Classification of one hook, derived once from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractPhase {
    pub phase: Phase,
    pub recursive: bool,
    /// `None` for a universal hook.
    pub target: Option<String>,
}

impl ContractPhase {
    pub fn applies_to(&self, target: &str) -> bool {
        self.target.as_deref().map_or(true, |t| t == target)
    }
}

/// Classify a hook by name; `None` if the name is not a hook name.
pub fn classify(name: &str) -> Option<ContractPhase> {
    let (recursive, rest) = match name.strip_prefix(RECURSIVE_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    if let Some(phase) = Phase::from_keyword(rest) {
        return Some(ContractPhase { phase, recursive, target: None });
    }
    let (keyword, target) = rest.split_once('_')?;
    if target.is_empty() {
        return None;
    }
    Phase::from_keyword(keyword).map(|phase| ContractPhase {
        phase,
        recursive,
        target: Some(target.to_string()),
    })
}

#[derive(Debug, Clone)]
pub struct ContractFn {
    pub name: String,
    /// `<contract unit reference>.<hook name>`
    pub reference: String,
    pub phase: ContractPhase,
    pub function: Function,
}

/// A loaded contract unit: classified hooks, in name order.
#[derive(Debug, Clone)]
pub struct ContractUnit {
    pub name: String,
    pub aliases: BTreeSet<String>,
    /// Loaded from a recursive-contract directory; every hook counts as recursive.
    pub recursive_source: bool,
    pub hooks: Vec<ContractFn>,
}

impl ContractUnit {
    pub fn matches(&self, wanted: &BTreeSet<String>) -> bool {
        wanted.contains(&self.name) || self.aliases.iter().any(|a| wanted.contains(a))
    }
}

/// Hooks for one target, nearest node first within each phase.
#[derive(Debug, Clone, Default)]
pub struct ContractChain {
    pub signature: Vec<ContractFn>,
    pub pre: Vec<ContractFn>,
    pub call: Vec<ContractFn>,
    pub post: Vec<ContractFn>,
}

impl ContractChain {
    fn push(&mut self, hook: ContractFn) {
        match hook.phase.phase {
            // Only signatures bound to a target are verifiable.
            Phase::Signature if hook.phase.target.is_none() => {}
            Phase::Signature => self.signature.push(hook),
            Phase::Pre => self.pre.push(hook),
            Phase::Call => self.call.push(hook),
            Phase::Post => self.post.push(hook),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty() && self.pre.is_empty() && self.call.is_empty() && self.post.is_empty()
    }
}

/// Contract units visible at one node on the way to the root.
pub(crate) struct Level {
    pub depth: usize,
    pub units: Arc<Vec<Arc<ContractUnit>>>,
    pub wanted: BTreeSet<String>,
}

/// Every hook visible through `levels`, nearest first. The owning node
/// (depth 0) contributes every matching hook; ancestors only recursive ones.
fn visible(levels: &[Level]) -> impl Iterator<Item = &ContractFn> {
    levels.iter().flat_map(|level| {
        level
            .units
            .iter()
            .filter(move |u| u.matches(&level.wanted))
            .flat_map(move |unit| {
                unit.hooks
                    .iter()
                    .filter(move |h| level.depth == 0 || h.phase.recursive || unit.recursive_source)
            })
    })
}

pub(crate) fn chain_for(levels: &[Level], target: &str) -> ContractChain {
    let mut chain = ContractChain::default();
    for hook in visible(levels).filter(|h| h.phase.applies_to(target)) {
        chain.push(hook.clone());
    }
    chain
}

/// Signature hooks bound to a target, whether or not the target exists.
pub(crate) fn signature_hooks(levels: &[Level]) -> Vec<ContractFn> {
    visible(levels)
        .filter(|h| h.phase.phase == Phase::Signature && h.phase.target.is_some())
        .cloned()
        .collect()
}

/// Result of one discovery walk for a unit.
pub(crate) struct Discovery {
    pub chains: BTreeMap<String, ContractChain>,
    pub signatures: Vec<ContractFn>,
}

impl Hub {
    /// Discover contract chains for every function of a unit in one walk.
    pub(crate) async fn discover(
        &self,
        node: NodeId,
        unit_names: &BTreeSet<String>,
        targets: &[String],
    ) -> Result<Discovery> {
        let path = self.with_arena(|arena| arena.ancestors(node));
        let mut levels = Vec::with_capacity(path.len());
        for (depth, id) in path.into_iter().enumerate() {
            let units = self.contract_units(id).await?;
            if units.is_empty() {
                continue;
            }
            let mut wanted = unit_names.clone();
            wanted.insert("init".to_string());
            wanted.extend(self.with_arena(|arena| arena.get(id).default_contracts.clone()));
            levels.push(Level { depth, units, wanted });
        }
        let chains: BTreeMap<String, ContractChain> = targets
            .iter()
            .map(|t| (t.clone(), chain_for(&levels, t)))
            .collect();
        debug!(
            "Discovered contracts for {} targets across {} levels",
            chains.len(),
            levels.len()
        );
        Ok(Discovery {
            chains,
            signatures: signature_hooks(&levels),
        })
    }
}

struct CtxState {
    args: Args,
    bound: Map,
    return_value: Option<Value>,
    cache: Map,
}

struct CtxInner {
    hub: Hub,
    target: Arc<Contracted>,
    state: Mutex<CtxState>,
}

/// Shared state of one contracted invocation, handed to every hook.
#[derive(Clone)]
pub struct ContractCtx {
    inner: Arc<CtxInner>,
}

impl ContractCtx {
    pub(crate) fn new(hub: Hub, target: Arc<Contracted>, args: Args, bound: Map) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                hub,
                target,
                state: Mutex::new(CtxState {
                    args,
                    bound,
                    return_value: None,
                    cache: Map::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> &Arc<Contracted> {
        &self.inner.target
    }

    pub fn reference(&self) -> &str {
        self.inner.target.reference()
    }

    pub fn args(&self) -> Args {
        self.lock().args.clone()
    }

    pub fn bound(&self) -> Map {
        self.lock().bound.clone()
    }

    pub fn arg(&self, name: &str) -> Option<Value> {
        self.lock().bound.get(name).cloned()
    }

    /// Replace the arguments the target will receive. They must bind.
    pub fn set_args(&self, args: Args) -> Result<()> {
        let target = &self.inner.target;
        let bound = target.function().bind(target.reference(), &args)?;
        let mut state = self.lock();
        state.args = args;
        state.bound = bound;
        Ok(())
    }

    pub fn return_value(&self) -> Option<Value> {
        self.lock().return_value.clone()
    }

    pub fn set_return_value(&self, value: Value) {
        self.lock().return_value = Some(value);
    }

    pub fn cache(&self, key: &str) -> Option<Value> {
        self.lock().cache.get(key).cloned()
    }

    pub fn set_cache(&self, key: impl Into<String>, value: Value) {
        self.lock().cache.insert(key.into(), value);
    }

    fn target_call(&self) -> Call {
        let (args, bound) = {
            let state = self.lock();
            (state.args.clone(), state.bound.clone())
        };
        Call::new(self.inner.hub.clone(), args, bound, self.reference())
    }

    /// Run the wrapped function itself with the current arguments.
    pub async fn invoke_target(&self) -> Result<Value> {
        let call = self.target_call();
        self.inner.target.function().run(call).await
    }

    pub fn open_target_stream(&self) -> Result<BoxStream<'static, Result<Value>>> {
        self.inner.target.function().open_stream(self.target_call())
    }

    pub(crate) fn hook_call(&self, hook: &ContractFn) -> Call {
        let (args, bound) = {
            let state = self.lock();
            (state.args.clone(), state.bound.clone())
        };
        Call::new(self.inner.hub.clone(), args, bound, hook.reference.clone()).with_contract(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(name: &str) -> ContractFn {
        ContractFn {
            name: name.to_string(),
            reference: format!("c.{}", name),
            phase: classify(name).unwrap(),
            function: Function::new_async(name, |_| async { Ok(json!(null)) }),
        }
    }

    fn unit(name: &str, recursive_source: bool, hooks: &[&str]) -> Arc<ContractUnit> {
        Arc::new(ContractUnit {
            name: name.to_string(),
            aliases: BTreeSet::new(),
            recursive_source,
            hooks: hooks.iter().map(|h| hook(h)).collect(),
        })
    }

    fn level(depth: usize, units: Vec<Arc<ContractUnit>>, wanted: &[&str]) -> Level {
        Level {
            depth,
            units: Arc::new(units),
            wanted: wanted.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn classify_names() {
        let c = classify("pre").unwrap();
        assert_eq!((c.phase, c.recursive, c.target), (Phase::Pre, false, None));
        let c = classify("r_post_x").unwrap();
        assert_eq!((c.phase, c.recursive), (Phase::Post, true));
        assert_eq!(c.target.as_deref(), Some("x"));
        let c = classify("signature_do_work").unwrap();
        assert_eq!(c.phase, Phase::Signature);
        assert_eq!(c.target.as_deref(), Some("do_work"));
        assert_eq!(classify("sig").unwrap().phase, Phase::Signature);
        assert!(classify("helper").is_none());
        assert!(classify("pre_").is_none());
        assert!(classify("r_").is_none());
        assert!(classify("prelude").is_none());
    }

    #[test]
    fn ancestors_only_contribute_recursive_hooks() {
        let levels = vec![
            level(0, vec![unit("net", false, &["pre", "post_x"])], &["net"]),
            level(1, vec![unit("init", false, &["pre_x", "r_pre_x"])], &["net", "init"]),
            level(2, vec![unit("init", true, &["post"])], &["net", "init"]),
        ];
        let chain = chain_for(&levels, "x");
        let pre: Vec<_> = chain.pre.iter().map(|h| h.name.as_str()).collect();
        let post: Vec<_> = chain.post.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(pre, vec!["pre", "r_pre_x"]);
        assert_eq!(post, vec!["post_x", "post"]);
    }

    #[test]
    fn unmatched_units_and_other_targets_are_skipped() {
        let levels = vec![level(
            0,
            vec![unit("other", false, &["pre"]), unit("net", false, &["pre_y", "call_x", "sig"])],
            &["net"],
        )];
        let chain = chain_for(&levels, "x");
        assert!(chain.pre.is_empty());
        assert_eq!(chain.call.len(), 1);
        assert!(chain.signature.is_empty());
    }
}
