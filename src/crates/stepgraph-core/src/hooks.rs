//! Callbacks around node dispatch
//!
//! [`NodeHooks`] implementations observe (and optionally short-circuit) node
//! invocations. Hooks run inside the node's timeout and never touch the run
//! state: the only way a hook influences state is by returning a substitute
//! update from [`NodeHooks::before`], which is merged exactly like a node
//! result.
//!
//! ```text
//! before ──Skip(update)──────────────────────────────> merged as the result
//!    │
//!    └─Continue──> body ──Ok──> after ──> merged
//!                    │
//!                    └──Err──> on_error (after the last retry)
//! ```

use crate::error::{GraphError, Result};
use crate::node::{NodeContext, NodeKind};
use crate::state::State;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of a before-hook
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    /// Run the node body
    Continue,
    /// Do not run the body; use this update as the node's result
    Skip(Value),
}

#[async_trait]
pub trait NodeHooks: Send + Sync {
    /// Restrict the hook to some node kinds
    fn applies_to(&self, _kind: NodeKind) -> bool {
        true
    }

    async fn before(&self, _ctx: &NodeContext, _state: &State) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }

    async fn after(&self, _ctx: &NodeContext, _update: &Value) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &NodeContext, _error: &GraphError) {}
}

/// Ordered list of hooks applied to every dispatch
#[derive(Clone, Default)]
pub(crate) struct HookChain {
    hooks: Vec<Arc<dyn NodeHooks>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn NodeHooks>>) -> Self {
        Self { hooks }
    }

    fn matching(&self, kind: NodeKind) -> impl Iterator<Item = &Arc<dyn NodeHooks>> {
        self.hooks.iter().filter(move |h| h.applies_to(kind))
    }

    /// First `Skip` wins; later before-hooks are not consulted
    pub async fn before(&self, ctx: &NodeContext, state: &State) -> Result<HookAction> {
        for hook in self.matching(ctx.kind()) {
            if let HookAction::Skip(update) = hook.before(ctx, state).await? {
                return Ok(HookAction::Skip(update));
            }
        }
        Ok(HookAction::Continue)
    }

    pub async fn after(&self, ctx: &NodeContext, update: &Value) -> Result<()> {
        for hook in self.matching(ctx.kind()) {
            hook.after(ctx, update).await?;
        }
        Ok(())
    }

    pub async fn on_error(&self, ctx: &NodeContext, error: &GraphError) {
        for hook in self.matching(ctx.kind()) {
            hook.on_error(ctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Counting {
        calls: AtomicUsize,
        skip: bool,
    }

    #[async_trait]
    impl NodeHooks for Counting {
        fn applies_to(&self, kind: NodeKind) -> bool {
            kind == NodeKind::Function
        }

        async fn before(&self, _ctx: &NodeContext, _state: &State) -> Result<HookAction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.skip {
                HookAction::Skip(json!({"cached": true}))
            } else {
                HookAction::Continue
            })
        }
    }

    fn ctx(kind: NodeKind) -> NodeContext {
        NodeContext::new("n", kind, 1, CancellationToken::new(), Arc::new(BTreeMap::new()))
    }

    #[tokio::test]
    async fn test_first_skip_wins() {
        let skipping = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            skip: true,
        });
        let later = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            skip: false,
        });
        let chain = HookChain::new(vec![skipping.clone(), later.clone()]);

        let action = chain.before(&ctx(NodeKind::Function), &State::new()).await.unwrap();
        assert_eq!(action, HookAction::Skip(json!({"cached": true})));
        assert_eq!(skipping.calls.load(Ordering::SeqCst), 1);
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_applies_to_filters_kinds() {
        let hook = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            skip: true,
        });
        let chain = HookChain::new(vec![hook.clone()]);

        let action = chain.before(&ctx(NodeKind::Router), &State::new()).await.unwrap();
        assert_eq!(action, HookAction::Continue);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
    }
}
