// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Handler invocation
//!
//! Runs a resolved handler against a loaded asset with a timeout, and
//! validates that the result is a module mapping. Inline handlers are polled
//! on the invoking task; every other handler gets a task of its own that is
//! aborted on timeout.

use crate::error::{ExecutionFailure, ImportError, Result};
use crate::handler::{HandlerContext, HandlerDescriptor, HandlerOrigin};
use crate::record::{CacheKey, ModuleRecord};
use crate::source::SourceAsset;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Invokes handlers with isolation and a timeout
#[derive(Debug, Clone)]
pub struct HandlerInvoker {
    timeout: Duration,
}

impl HandlerInvoker {
    /// Create an invoker
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execution timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the context a handler sees for `asset`
    pub fn context(asset: &SourceAsset, asserted_type: &str) -> HandlerContext {
        HandlerContext {
            url: asset.url.to_string(),
            asserted_type: asserted_type.to_string(),
            mime_type: asset.mime_type.clone(),
            encoding: asset.encoding.clone(),
            native_handler_available: asset.native_handler_available,
        }
    }

    /// Run `descriptor` against `asset` and build the record for `key`
    #[instrument(skip_all, fields(key = %key))]
    pub async fn invoke(
        &self,
        descriptor: &HandlerDescriptor,
        asset: &SourceAsset,
        key: CacheKey,
    ) -> Result<ModuleRecord> {
        let fail = |kind: ExecutionFailure, message: String, detail: Option<String>| {
            ImportError::HandlerExecution {
                url: key.url.clone(),
                asserted_type: key.asserted_type.clone(),
                handler: descriptor.id(),
                kind,
                message,
                detail,
            }
        };

        let ctx = Self::context(asset, &key.asserted_type);
        let handler = descriptor.handler();

        // Handlers may panic before returning their future
        let future = panic::catch_unwind(AssertUnwindSafe(|| handler.call(asset.bytes.clone(), ctx)))
            .map_err(|payload| {
                fail(ExecutionFailure::Panicked, panic_message(payload.as_ref()), None)
            })?;

        debug!("Invoking handler '{}' ({})", handler.name(), descriptor.origin());
        let outcome = match descriptor.origin() {
            HandlerOrigin::Inline => self.run_in_place(future).await,
            _ => self.run_spawned(future).await,
        };

        let value = match outcome {
            Outcome::Value(value) => value,
            Outcome::Failed(err) => {
                return Err(fail(
                    ExecutionFailure::Failed,
                    err.to_string(),
                    Some(format!("{:?}", err)),
                ));
            }
            Outcome::Panicked(message) => return Err(fail(ExecutionFailure::Panicked, message, None)),
            Outcome::Cancelled(message) => return Err(fail(ExecutionFailure::Cancelled, message, None)),
            Outcome::TimedOut => {
                warn!("Handler '{}' timed out after {:?}", handler.name(), self.timeout);
                return Err(fail(
                    ExecutionFailure::TimedOut,
                    format!("no result after {} ms", self.timeout.as_millis()),
                    None,
                ));
            }
        };

        let exports = validate_exports(value)
            .map_err(|message| fail(ExecutionFailure::InvalidShape, message, None))?;

        Ok(ModuleRecord::new(
            exports,
            descriptor.origin(),
            key,
            asset.fingerprint.clone(),
        ))
    }
}

impl HandlerInvoker {
    /// Poll an inline handler on the invoking task
    async fn run_in_place(&self, future: HandlerFuture) -> Outcome {
        match tokio::time::timeout(self.timeout, AssertUnwindSafe(future).catch_unwind()).await {
            Ok(Ok(Ok(value))) => Outcome::Value(value),
            Ok(Ok(Err(err))) => Outcome::Failed(err),
            Ok(Err(payload)) => Outcome::Panicked(panic_message(payload.as_ref())),
            Err(_) => Outcome::TimedOut,
        }
    }

    /// Run a module, registry or native handler on its own task
    async fn run_spawned(&self, future: HandlerFuture) -> Outcome {
        let mut task = tokio::spawn(future);
        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Outcome::Value(value),
            Ok(Ok(Err(err))) => Outcome::Failed(err),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Outcome::Panicked(panic_message(join_err.into_panic().as_ref()))
            }
            Ok(Err(join_err)) => Outcome::Cancelled(join_err.to_string()),
            Err(_) => {
                task.abort();
                Outcome::TimedOut
            }
        }
    }
}

type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

enum Outcome {
    Value(Value),
    Failed(anyhow::Error),
    Panicked(String),
    Cancelled(String),
    TimedOut,
}

/// Check that a handler result is a mapping of non-empty export names
pub fn validate_exports(value: Value) -> std::result::Result<BTreeMap<String, Value>, String> {
    let map = match value {
        Value::Object(map) => map,
        other => {
            return Err(format!(
                "expected an object of exports, got {}",
                value_kind(&other)
            ));
        }
    };

    if map.keys().any(|name| name.is_empty()) {
        return Err("export names must not be empty".to_string());
    }

    Ok(map.into_iter().collect())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Encoding, Handler, HandlerId};
    use bytes::Bytes;
    use serde_json::json;
    use url::Url;

    fn asset(text: &'static str) -> SourceAsset {
        SourceAsset {
            url: Url::parse("file:///project/a.txt").unwrap(),
            bytes: Bytes::from_static(text.as_bytes()),
            mime_type: "text/plain".into(),
            encoding: Encoding::text("utf-8"),
            fingerprint: crate::source::fingerprint(text.as_bytes()),
            native_handler_available: false,
        }
    }

    fn run(handler: Handler) -> (HandlerId, CacheKey, HandlerDescriptor) {
        let descriptor = HandlerDescriptor::inline(handler);
        let key = CacheKey::new("file:///project/a.txt", descriptor.id(), "text");
        (descriptor.id(), key, descriptor)
    }

    #[tokio::test]
    async fn test_successful_invocation_builds_record() {
        let (id, key, descriptor) = run(Handler::from_fn("upper", |bytes: &[u8], ctx: &HandlerContext| {
            let text = ctx.decode_text(bytes)?;
            Ok(json!({ "default": text.to_uppercase(), "type": ctx.asserted_type }))
        }));

        let record = HandlerInvoker::new(Duration::from_secs(1))
            .invoke(&descriptor, &asset("abc"), key)
            .await
            .unwrap();

        assert_eq!(record.default_export(), Some(&json!("ABC")));
        assert_eq!(record.get_export("type"), Some(&json!("text")));
        assert_eq!(record.handler(), id);
        assert_eq!(record.fingerprint(), crate::source::fingerprint(b"abc"));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_message() {
        let (id, key, descriptor) = run(Handler::from_fn("bad", |_, _| {
            anyhow::bail!("row 3 has 2 columns, expected 4")
        }));

        let err = HandlerInvoker::new(Duration::from_secs(1))
            .invoke(&descriptor, &asset("x"), key)
            .await
            .unwrap_err();

        match err {
            ImportError::HandlerExecution { handler, kind, message, .. } => {
                assert_eq!(handler, id);
                assert_eq!(kind, ExecutionFailure::Failed);
                assert_eq!(message, "row 3 has 2 columns, expected 4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (_, key, descriptor) = run(Handler::from_fn("boom", |_, _| panic!("boom")));

        let err = HandlerInvoker::new(Duration::from_secs(1))
            .invoke(&descriptor, &asset("x"), key)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ImportError::HandlerExecution { kind: ExecutionFailure::Panicked, ref message, .. } if message == "boom"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let slow = Handler::new("slow", |_bytes: Bytes, _ctx: HandlerContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(json!({}))
        });
        let (_, key, descriptor) = run(slow);

        let err = HandlerInvoker::new(Duration::from_millis(100))
            .invoke(&descriptor, &asset("x"), key)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ImportError::HandlerExecution { kind: ExecutionFailure::TimedOut, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_mapping_results_are_rejected() {
        for value in [json!([1, 2]), json!("text"), json!(null), json!({ "": 1 })] {
            let returned = value.clone();
            let (_, key, descriptor) = run(Handler::from_fn("shape", move |_, _| Ok(returned.clone())));

            let err = HandlerInvoker::new(Duration::from_secs(1))
                .invoke(&descriptor, &asset("x"), key)
                .await
                .unwrap_err();

            assert!(
                matches!(err, ImportError::HandlerExecution { kind: ExecutionFailure::InvalidShape, .. }),
                "{value}"
            );
        }
    }

    #[test]
    fn test_empty_mapping_is_valid() {
        assert!(validate_exports(json!({})).unwrap().is_empty());
    }

    tokio::task_local! {
        static CALLER: u32;
    }

    fn caller_reporting() -> Handler {
        Handler::new("caller", |_bytes: Bytes, _ctx: HandlerContext| async {
            Ok::<_, anyhow::Error>(json!({ "caller": CALLER.try_with(|id| *id).ok() }))
        })
    }

    #[tokio::test]
    async fn test_only_inline_handlers_share_the_invoking_task() {
        let invoker = HandlerInvoker::new(Duration::from_secs(1));

        let (_, key, inline) = run(caller_reporting());
        let record = CALLER
            .scope(7, invoker.invoke(&inline, &asset("x"), key))
            .await
            .unwrap();
        assert_eq!(record.get_export("caller"), Some(&json!(7)));

        let native = HandlerDescriptor::native(caller_reporting());
        let key = CacheKey::new("file:///project/a.txt", native.id(), "text");
        let record = CALLER
            .scope(7, invoker.invoke(&native, &asset("x"), key))
            .await
            .unwrap();
        assert_eq!(record.get_export("caller"), Some(&json!(null)));
    }
}
