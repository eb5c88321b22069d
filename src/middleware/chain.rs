//! Chain composition and execution.
//!
//! A [`Chain`] is the fully composed, immutable sequence of middleware plus
//! the terminal handler for one route:
//!
//! ```text
//! global ++ group₁ ++ … ++ groupₙ ++ route ++ [handler]
//! ```
//!
//! Running it is strictly sequential: control moves forward through each
//! `next.run(ctx)` and unwinds back in reverse, like a call stack.

use std::fmt;
use std::sync::Arc;

use super::BoxedMiddleware;
use crate::context::Context;
use crate::handler::{BoxFuture, BoxedHandler};

struct Inner {
    middleware: Vec<BoxedMiddleware>,
    handler: BoxedHandler,
}

/// An executable middleware chain. Cheap to clone.
#[derive(Clone)]
pub struct Chain {
    inner: Arc<Inner>,
}

impl Chain {
    /// Runs the chain from its first middleware.
    pub fn run(&self, ctx: Context) -> BoxFuture {
        Next { inner: Arc::clone(&self.inner), index: 0 }.run(ctx)
    }

    /// Number of middleware in front of the handler.
    pub fn len(&self) -> usize {
        self.inner.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.middleware.is_empty()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("middleware", &self.len()).finish()
    }
}

/// The remainder of a chain, handed to each middleware.
///
/// Consumed by [`run`](Next::run): a middleware continues at most once, and
/// one that drops `Next` without running it short-circuits the chain.
pub struct Next {
    inner: Arc<Inner>,
    index: usize,
}

impl Next {
    /// Runs the following middleware, or the handler once none are left, and
    /// returns its result unchanged.
    pub fn run(self, ctx: Context) -> BoxFuture {
        match self.inner.middleware.get(self.index) {
            Some(mw) => {
                let mw = Arc::clone(mw);
                let next = Next { inner: self.inner, index: self.index + 1 };
                mw.call(ctx, next)
            }
            None => self.inner.handler.call(ctx),
        }
    }

    /// How many middleware (and the handler) are still ahead.
    pub fn remaining(&self) -> usize {
        self.inner.middleware.len() - self.index + 1
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.remaining()).finish()
    }
}

/// Composes a chain. Pure: the same inputs always produce a chain that runs
/// the same middleware in the same order.
pub fn build_chain<G>(
    global: &[BoxedMiddleware],
    groups_outer_to_inner: &[G],
    route: &[BoxedMiddleware],
    handler: BoxedHandler,
) -> Chain
where
    G: AsRef<[BoxedMiddleware]>,
{
    let capacity = global.len()
        + groups_outer_to_inner.iter().map(|g| g.as_ref().len()).sum::<usize>()
        + route.len();
    let mut middleware = Vec::with_capacity(capacity);
    middleware.extend(global.iter().cloned());
    for group in groups_outer_to_inner {
        middleware.extend(group.as_ref().iter().cloned());
    }
    middleware.extend(route.iter().cloned());

    Chain { inner: Arc::new(Inner { middleware, handler }) }
}
