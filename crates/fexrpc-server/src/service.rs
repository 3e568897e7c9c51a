//! Service adapter.
//!
//! Reflects a user object into named methods the dispatch engine can invoke
//! without knowing their argument or reply types. Registration stores one
//! type-erased thunk per method; the thunk owns the "fresh argument value"
//! and "fresh reply value" factories, so the engine hands it nothing but the
//! connection's codec and the raw body bytes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use fexrpc_common::CodecKind;

/// Handler outcome: an encoded reply, or error text transported to the
/// caller verbatim.
pub type MethodResult = std::result::Result<Vec<u8>, String>;

type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;
type MethodHandler = Box<dyn Fn(CodecKind, Vec<u8>) -> MethodFuture + Send + Sync>;

/// One invocable method: its thunk plus a call counter for the debug page.
pub struct MethodType {
    name: String,
    num_calls: AtomicU64,
    handler: MethodHandler,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub(crate) async fn invoke(&self, kind: CodecKind, body: Vec<u8>) -> MethodResult {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, body).await
    }
}

/// A named collection of methods exported from one user object.
///
/// Methods take two parameters: an argument decoded from the request body
/// and a reply slot the handler writes into. Handlers that need to await
/// use [`method_async`](Service::method_async) and return their reply
/// instead.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a synchronous method.
    ///
    /// The reply slot starts from `R::default()`; returning `Err` transports
    /// that text to the caller and discards the slot.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered on this service; duplicate
    /// method names are a programmer error.
    pub fn method<A, R, F>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(A, &mut R) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.insert(name, move |kind, body| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = kind
                    .from_slice(&body)
                    .map_err(|err| format!("rpc server: read argv error: {err}"))?;
                let mut reply = R::default();
                f(args, &mut reply)?;
                kind.to_vec(&reply)
                    .map_err(|err| format!("rpc server: encode reply error: {err}"))
            })
        })
    }

    /// Registers an asynchronous method.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered on this service.
    pub fn method_async<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(name, move |kind, body| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = kind
                    .from_slice(&body)
                    .map_err(|err| format!("rpc server: read argv error: {err}"))?;
                let reply = f(args).await?;
                kind.to_vec(&reply)
                    .map_err(|err| format!("rpc server: encode reply error: {err}"))
            })
        })
    }

    fn insert<H>(mut self, name: &str, handler: H) -> Self
    where
        H: Fn(CodecKind, Vec<u8>) -> MethodFuture + Send + Sync + 'static,
    {
        let method = MethodType {
            name: name.to_string(),
            num_calls: AtomicU64::new(0),
            handler: Box::new(handler),
        };
        if self
            .methods
            .insert(name.to_string(), Arc::new(method))
            .is_some()
        {
            panic!("rpc service: duplicate method {}.{}", self.name, name);
        }
        self
    }

    pub(crate) fn method_named(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    /// Methods in name order, for the debug listing.
    pub fn methods(&self) -> Vec<Arc<MethodType>> {
        let mut methods: Vec<_> = self.methods.values().cloned().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct FooArgs {
        num1: i64,
        num2: i64,
    }

    fn foo_service() -> Service {
        Service::new("FooSvc")
            .method("Sum", |args: FooArgs, reply: &mut i64| {
                *reply = args.num1 + args.num2;
                Ok(())
            })
            .method("Fail", |_args: FooArgs, _reply: &mut i64| {
                Err("intentional failure".to_string())
            })
    }

    #[tokio::test]
    async fn invoke_writes_the_reply_slot() {
        let svc = foo_service();
        let method = svc.method_named("Sum").unwrap();
        let kind = CodecKind::Json;
        let body = kind.to_vec(&FooArgs { num1: 3, num2: 9 }).unwrap();

        let reply = method.invoke(kind, body).await.unwrap();
        let sum: i64 = kind.from_slice(&reply).unwrap();
        assert_eq!(sum, 12);
    }

    #[tokio::test]
    async fn handler_errors_are_verbatim() {
        let svc = foo_service();
        let method = svc.method_named("Fail").unwrap();
        let kind = CodecKind::Binary;
        let body = kind.to_vec(&FooArgs { num1: 1, num2: 1 }).unwrap();

        let err = method.invoke(kind, body).await.unwrap_err();
        assert_eq!(err, "intentional failure");
    }

    #[tokio::test]
    async fn undecodable_argv_is_an_invocation_error() {
        let svc = foo_service();
        let method = svc.method_named("Sum").unwrap();

        let err = method
            .invoke(CodecKind::Json, vec![0xff, 0x00])
            .await
            .unwrap_err();
        assert!(err.contains("read argv error"));
    }

    #[tokio::test]
    async fn async_methods_can_await() {
        let svc = Service::new("Clock").method_async("Tick", |n: u64| async move {
            tokio::time::sleep(std::time::Duration::from_millis(n)).await;
            Ok(n + 1)
        });
        let method = svc.method_named("Tick").unwrap();
        let kind = CodecKind::Binary;
        let body = kind.to_vec(&5u64).unwrap();

        let reply = method.invoke(kind, body).await.unwrap();
        let tick: u64 = kind.from_slice(&reply).unwrap();
        assert_eq!(tick, 6);
    }

    #[tokio::test]
    async fn call_counts_accumulate() {
        let svc = foo_service();
        let method = svc.method_named("Sum").unwrap();
        let kind = CodecKind::Json;
        for _ in 0..3 {
            let body = kind.to_vec(&FooArgs { num1: 0, num2: 0 }).unwrap();
            method.invoke(kind, body).await.unwrap();
        }
        assert_eq!(method.num_calls(), 3);
    }

    #[test]
    #[should_panic(expected = "duplicate method")]
    fn duplicate_method_panics() {
        let _ = Service::new("FooSvc")
            .method("Sum", |_: i64, _: &mut i64| Ok(()))
            .method("Sum", |_: i64, _: &mut i64| Ok(()));
    }

    #[test]
    fn methods_are_listed_in_name_order() {
        let svc = foo_service();
        let names: Vec<_> = svc.methods().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["Fail", "Sum"]);
    }
}
