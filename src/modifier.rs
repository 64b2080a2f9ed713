//! Onion-style modifier chains
//!
//! A chain wraps a terminal handler in decorators. The first decorator
//! registered is the outermost one: it sees the input first and the result
//! last. A decorator that never calls the handler it was given
//! short-circuits everything inside it, the terminal handler included.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use http::{Request, Response};

use crate::body::Body;
use crate::error::Result;

/// An async step taking `I` and producing `O`
pub type Handler<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// A decorator: given the next handler, returns a handler wrapping it
pub type Modifier<I, O> = Arc<dyn Fn(Handler<I, O>) -> Handler<I, O> + Send + Sync>;

/// Request phase: the terminal handler forwards to the origin
pub type RequestHandler = Handler<Request<Body>, Response<Body>>;

/// Response phase: the terminal handler delivers to the client
pub type ResponseHandler = Handler<Response<Body>, ()>;

/// Build a [`Handler`] from an async closure
pub fn handler_fn<I, O, F, Fut>(f: F) -> Handler<I, O>
where
  F: Fn(I) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<O>> + Send + 'static,
{
  Arc::new(move |input| f(input).boxed())
}

/// Ordered decorators around a terminal handler
pub struct ModifierChain<I, O> {
  modifiers: Vec<Modifier<I, O>>,
}

impl<I, O> ModifierChain<I, O> {
  /// Create an empty chain
  pub fn new() -> Self {
    Self {
      modifiers: Vec::new(),
    }
  }

  /// Register a decorator inside every decorator registered before it
  pub fn push<F>(&mut self, modifier: F)
  where
    F: Fn(Handler<I, O>) -> Handler<I, O> + Send + Sync + 'static,
  {
    self.modifiers.push(Arc::new(modifier));
  }

  /// Number of registered decorators
  pub fn len(&self) -> usize {
    self.modifiers.len()
  }

  /// Check if any decorators are registered
  pub fn is_empty(&self) -> bool {
    self.modifiers.is_empty()
  }

  /// Compose the chain around `terminal`
  pub fn wrap(&self, terminal: Handler<I, O>) -> Handler<I, O> {
    self
      .modifiers
      .iter()
      .rev()
      .fold(terminal, |next, modifier| modifier(next))
  }
}

impl<I, O> Default for ModifierChain<I, O> {
  fn default() -> Self {
    Self::new()
  }
}

impl<I, O> Clone for ModifierChain<I, O> {
  fn clone(&self) -> Self {
    Self {
      modifiers: self.modifiers.clone(),
    }
  }
}

impl<I, O> fmt::Debug for ModifierChain<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModifierChain")
      .field("modifiers", &self.modifiers.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  type Trace = Arc<Mutex<Vec<String>>>;

  fn tracing_modifier(
    name: &'static str,
    trace: Trace,
  ) -> impl Fn(Handler<u32, u32>) -> Handler<u32, u32> + Send + Sync + 'static {
    move |next| {
      let trace = trace.clone();
      handler_fn(move |input: u32| {
        let next = next.clone();
        let trace = trace.clone();
        async move {
          trace.lock().unwrap().push(format!("{}-before", name));
          let output = next(input + 1).await?;
          trace.lock().unwrap().push(format!("{}-after", name));
          Ok(output * 10)
        }
      })
    }
  }

  #[tokio::test]
  async fn first_registered_is_outermost() {
    let trace: Trace = Arc::default();
    let mut chain = ModifierChain::new();
    chain.push(tracing_modifier("a", trace.clone()));
    chain.push(tracing_modifier("b", trace.clone()));

    let terminal_trace = trace.clone();
    let handler = chain.wrap(handler_fn(move |input: u32| {
      let trace = terminal_trace.clone();
      async move {
        trace.lock().unwrap().push(format!("terminal-{}", input));
        Ok(input)
      }
    }));

    assert_eq!(handler(0).await.unwrap(), 200);
    assert_eq!(
      *trace.lock().unwrap(),
      vec!["a-before", "b-before", "terminal-2", "b-after", "a-after"]
    );
  }

  #[tokio::test]
  async fn short_circuit_skips_terminal() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut chain: ModifierChain<u32, u32> = ModifierChain::new();
    chain.push(|_next| handler_fn(|_input: u32| async { Ok(7) }));

    let counted = calls.clone();
    let handler = chain.wrap(handler_fn(move |input: u32| {
      counted.fetch_add(1, Ordering::SeqCst);
      async move { Ok(input) }
    }));

    assert_eq!(handler(1).await.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn decorator_can_replace_errors() {
    let mut chain: ModifierChain<u32, u32> = ModifierChain::new();
    chain.push(|next| {
      handler_fn(move |input: u32| {
        let next = next.clone();
        async move {
          match next(input).await {
            Err(Error::Upstream(_)) => Ok(0),
            other => other,
          }
        }
      })
    });
    let handler = chain.wrap(handler_fn(|_input: u32| async {
      Err(Error::Upstream("down".into()))
    }));
    assert_eq!(handler(1).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn empty_chain_is_terminal() {
    let chain: ModifierChain<u32, u32> = ModifierChain::default();
    assert!(chain.is_empty());
    let handler = chain.wrap(handler_fn(|input: u32| async move { Ok(input * 2) }));
    assert_eq!(handler(21).await.unwrap(), 42);
  }
}
