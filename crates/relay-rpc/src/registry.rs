//! Method registry: a [`Handler`] that routes by method name and replies automatically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_core::errors::rpc::ErrorObject;
use relay_core::ids::RequestId;
use relay_core::wire::Payload;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::handler::{Handler, Incoming};

/// Requests slower than this are logged.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);

/// What a method handler sees besides its params.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// The connection the message arrived on.
    pub connection: Connection,
    /// Fires when the connection stops being open.
    pub cancel: CancellationToken,
    /// Request id; `None` for notifications.
    pub id: Option<RequestId>,
    /// Caller metadata.
    pub meta: Option<Payload>,
}

/// Trait implemented by every registered method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the method. The returned value becomes the response `result`.
    async fn handle(&self, params: Option<Payload>, ctx: &CallContext) -> Result<Value, ErrorObject>;
}

/// [`MethodHandler`] built from an async closure. See [`method_fn`].
pub struct FnMethod<F>(F);

/// Adapt an async closure into a [`MethodHandler`].
pub fn method_fn<F, Fut>(f: F) -> FnMethod<F>
where
    F: Fn(Option<Payload>, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorObject>> + Send,
{
    FnMethod(f)
}

#[async_trait]
impl<F, Fut> MethodHandler for FnMethod<F>
where
    F: Fn(Option<Payload>, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorObject>> + Send,
{
    async fn handle(&self, params: Option<Payload>, ctx: &CallContext) -> Result<Value, ErrorObject> {
        (self.0)(params, ctx.clone()).await
    }
}

/// Registry mapping method names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    timeout: Option<Duration>,
}

impl MethodRegistry {
    /// Create an empty registry with no handler timeout.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: None,
        }
    }

    /// Fail handlers running longer than `timeout` with `INTERNAL_ERROR`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Run the handler for `method`.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Payload>,
        ctx: &CallContext,
    ) -> Result<Value, ErrorObject> {
        let Some(handler) = self.handlers.get(method) else {
            return Err(ErrorObject::method_not_found(method));
        };

        let start = Instant::now();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.handle(params, ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    error!(method, "handler timed out after {limit:?}");
                    Err(ErrorObject::internal(format!(
                        "handler for '{method}' timed out"
                    )))
                }
            },
            None => handler.handle(params, ctx).await,
        };

        let elapsed = start.elapsed();
        if elapsed >= SLOW_CALL_THRESHOLD {
            warn!(method, duration_secs = elapsed.as_secs_f64(), "slow method handler");
        }
        result
    }

    /// All registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for MethodRegistry {
    async fn handle(&self, cancel: CancellationToken, conn: Connection, incoming: Incoming) {
        let method = incoming.method().to_owned();
        let ctx = CallContext {
            connection: conn.clone(),
            cancel,
            id: incoming.id().cloned(),
            meta: incoming.meta().cloned(),
        };
        let params = incoming.params().cloned();

        match incoming {
            Incoming::Request(req) => {
                let sent = match self.dispatch(&method, params, &ctx).await {
                    Ok(value) => conn.reply(&req.id, &value).await,
                    Err(err) => conn.reply_with_error(&req.id, err).await,
                };
                if let Err(e) = sent {
                    debug!(id = %req.id, method = %method, error = %e, "reply not sent");
                }
            }
            Incoming::Notification(_) => {
                if !self.has_method(&method) {
                    debug!(method = %method, "no handler for notification");
                    return;
                }
                if let Err(err) = self.dispatch(&method, params, &ctx).await {
                    warn!(method = %method, error = %err, "notification handler failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryObjectStream;
    use assert_matches::assert_matches;
    use relay_core::errors::rpc::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
    use serde_json::json;

    // ── Test handler implementations ────────────────────────────────

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Option<Payload>, _ctx: &CallContext) -> Result<Value, ErrorObject> {
            match params {
                Some(p) => p.decode().map_err(|e| ErrorObject::invalid_params(e.to_string())),
                None => Ok(Value::Null),
            }
        }
    }

    struct GreetHandler;

    #[async_trait]
    impl MethodHandler for GreetHandler {
        async fn handle(&self, params: Option<Payload>, _ctx: &CallContext) -> Result<Value, ErrorObject> {
            let p: Value = params
                .ok_or_else(|| ErrorObject::invalid_params("params required"))?
                .decode()
                .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;
            let name = p
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ErrorObject::invalid_params("missing 'name'"))?;
            Ok(json!({ "hello": name }))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MethodHandler for SlowHandler {
        async fn handle(&self, _params: Option<Payload>, _ctx: &CallContext) -> Result<Value, ErrorObject> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn context() -> CallContext {
        let (a, _b) = MemoryObjectStream::pair();
        let connection = Connection::builder(a).start();
        CallContext {
            cancel: connection.cancellation(),
            connection,
            id: Some(1.into()),
            meta: None,
        }
    }

    fn payload(v: Value) -> Option<Payload> {
        Some(Payload::from_value(&v).unwrap())
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn dispatch_success() {
        let mut reg = MethodRegistry::new();
        reg.register("echo", EchoHandler);
        let out = reg.dispatch("echo", payload(json!({"x": 1})), &context()).await;
        assert_eq!(out.unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let reg = MethodRegistry::new();
        let err = reg.dispatch("nope", None, &context()).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    async fn dispatch_handler_error() {
        let mut reg = MethodRegistry::new();
        reg.register("greet", GreetHandler);
        let err = reg.dispatch("greet", payload(json!({})), &context()).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        let ok = reg
            .dispatch("greet", payload(json!({"name": "ada"})), &context())
            .await
            .unwrap();
        assert_eq!(ok, json!({"hello": "ada"}));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_timeout_is_internal_error() {
        let mut reg = MethodRegistry::new().with_timeout(Duration::from_secs(1));
        reg.register("slow", SlowHandler);
        let err = reg.dispatch("slow", None, &context()).await.unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);
        assert!(err.message.contains("slow"));
    }

    #[tokio::test]
    async fn closure_handlers_see_context() {
        let mut reg = MethodRegistry::new();
        reg.register(
            "whoami",
            method_fn(|_params, ctx: CallContext| async move {
                Ok(json!({ "id": ctx.id.map(|id| id.to_string()) }))
            }),
        );
        let out = reg.dispatch("whoami", None, &context()).await.unwrap();
        assert_eq!(out, json!({"id": "1"}));
    }

    #[test]
    fn methods_sorted_and_queryable() {
        let mut reg = MethodRegistry::default();
        reg.register("b.two", EchoHandler);
        reg.register("a.one", EchoHandler);
        assert_eq!(reg.methods(), vec!["a.one", "b.two"]);
        assert!(reg.has_method("a.one"));
        assert!(!reg.has_method("c.three"));
    }

    #[tokio::test]
    async fn register_replaces() {
        let mut reg = MethodRegistry::new();
        reg.register("m", GreetHandler);
        reg.register("m", EchoHandler);
        assert_matches!(reg.dispatch("m", None, &context()).await, Ok(Value::Null));
    }
}
