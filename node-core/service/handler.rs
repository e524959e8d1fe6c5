use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::service::tree::LoopHandle;

/// A callable method a service publishes under `"ServiceName.MethodName"`.
/// Invoked on the owning service's loop; `call` runs to completion before
/// the loop advances to the next inbound item, which is what makes the
/// single-threaded-per-service guarantee hold. A handler that needs to wait
/// on another call's reply should use [`LoopHandle::async_call`] and return
/// rather than block on it here.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &LoopHandle, args: serde_json::Value) -> Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(LoopHandle, serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send,
{
    async fn call(&self, ctx: &LoopHandle, args: serde_json::Value) -> Result<serde_json::Value> {
        (self)(ctx.clone(), args).await
    }
}

struct HandlerEntry {
    handler: Arc<dyn Handler>,
    no_reply: bool,
}

/// Built once at `Init` and read-only afterward, per §4.1.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, HandlerEntry>,
    sealed: bool,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under this service. Panics if called after
    /// [`HandlerTable::seal`] — registration only happens during `Init`.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn Handler>, no_reply: bool) {
        assert!(
            !self.sealed,
            "handler table is read-only once the service starts"
        );
        self.handlers
            .insert(method.into(), HandlerEntry { handler, no_reply });
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn no_reply(&self, method: &str) -> bool {
        self.handlers.get(method).map(|e| e.no_reply).unwrap_or(false)
    }

    pub fn get(&self, method: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(method)
            .map(|e| e.handler.clone())
            .ok_or_else(|| CoreError::NoService(method.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, _ctx: &LoopHandle, args: serde_json::Value) -> Result<serde_json::Value> {
            Ok(args)
        }
    }

    #[test]
    fn unknown_method_is_no_service() {
        let table = HandlerTable::new();
        let err = table.get("Foo.Bar").unwrap_err();
        assert_eq!(err.kind(), crate::error::CoreErrorKind::NoService);
    }

    #[test]
    #[should_panic]
    fn registering_after_seal_panics() {
        let mut table = HandlerTable::new();
        table.seal();
        table.register("Foo.Bar", Arc::new(Echo), false);
    }
}
