//! Import pipeline integration tests
//!
//! Drives whole imports through `ModuleLoader` against in-memory and
//! on-disk assets.

use serde_json::json;
use spacey_loader::{
    builtin, ExecutionFailure, FallbackPolicy, Handler, HandlerContext, HandlerModule,
    HandlerOrigin, HandlerRegistry, ImportAssertion, ImportBindings, ImportError, LoaderConfig,
    MemoryFetcher, ModuleLoader, StaticModuleTable, UrlSpecifierResolver,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

struct Harness {
    fetcher: Arc<MemoryFetcher>,
    modules: Arc<StaticModuleTable>,
    loader: Arc<ModuleLoader>,
}

fn harness(config: LoaderConfig) -> Harness {
    let fetcher = Arc::new(MemoryFetcher::new());
    let modules = Arc::new(StaticModuleTable::new());
    let loader = ModuleLoader::builder(config)
        .registry(Arc::new(HandlerRegistry::default()))
        .fetcher(fetcher.clone())
        .instantiator(modules.clone())
        .specifier_resolver(Arc::new(UrlSpecifierResolver::new(
            Url::parse("mem:///app/").unwrap(),
        )))
        .build();
    Harness {
        fetcher,
        modules,
        loader: Arc::new(loader),
    }
}

fn asset(path: &str) -> Url {
    Url::parse("mem:///app/").unwrap().join(path).unwrap()
}

/// CSV handler that counts its invocations
fn counting_csv(calls: Arc<AtomicUsize>, delay: Duration) -> Handler {
    Handler::new("counting-csv", move |bytes: bytes::Bytes, ctx: HandlerContext| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            let text = ctx.decode_text(&bytes)?;
            Ok::<_, anyhow::Error>(json!({ "default": builtin::parse_csv(&text) }))
        }
    })
}

#[tokio::test]
async fn test_csv_import_yields_rows() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("a.csv"), "1,2\n3,4\n", None);

    let handler = Handler::from_fn("rows", |bytes: &[u8], ctx: &HandlerContext| {
        let text = ctx.decode_text(bytes)?;
        Ok(json!({ "default": builtin::parse_csv(&text) }))
    });

    let record = h
        .loader
        .import(
            "./a.csv",
            None,
            ImportAssertion::new("csv").with_handler(handler.clone()),
            ImportBindings::Default("rows".into()),
        )
        .await
        .unwrap();

    assert_eq!(record.default_export(), Some(&json!([[1, 2], [3, 4]])));
    assert_eq!(record.handler(), handler.id());
    assert_eq!(record.cache_key().url, "mem:///app/a.csv");
    assert_eq!(record.cache_key().asserted_type, "csv");
}

#[tokio::test]
async fn test_concurrent_imports_invoke_handler_once() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("a.csv"), "1,2\n3,4\n", None);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = counting_csv(Arc::clone(&calls), Duration::from_millis(50));

    let imports = (0..10).map(|_| {
        h.loader.import(
            "./a.csv",
            None,
            ImportAssertion::new("csv").with_handler(handler.clone()),
            ImportBindings::Default("rows".into()),
        )
    });
    let records: Vec<_> = futures::future::join_all(imports)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
    assert_eq!(h.loader.stats().joined.load(Ordering::Relaxed), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_imports_across_tasks() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("a.csv"), "1,2\n", None);
    let calls = Arc::new(AtomicUsize::new(0));
    h.loader
        .define(["csv"], counting_csv(Arc::clone(&calls), Duration::from_millis(100)))
        .unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let loader = Arc::clone(&h.loader);
            tokio::spawn(async move {
                loader
                    .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
                    .await
            })
        })
        .collect();

    let mut records = Vec::new();
    for task in tasks {
        records.push(task.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
}

#[tokio::test]
async fn test_define_covers_every_listed_type() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    let styles = Handler::from_fn("styles", |bytes: &[u8], ctx: &HandlerContext| {
        Ok(json!({ "default": ctx.decode_text(bytes)?.len() }))
    });
    h.loader.define(["scss", "css", "sass"], styles.clone()).unwrap();

    for t in ["scss", "css", "sass"] {
        let descriptor = h.loader.registry().for_type(t).unwrap();
        assert_eq!(descriptor.id(), styles.id());
    }

    h.fetcher.insert(&asset("theme.scss"), "$a: 1;", None);
    let record = h
        .loader
        .import("./theme.scss", None, ImportAssertion::new("scss"), ImportBindings::Dynamic)
        .await
        .unwrap();
    assert_eq!(record.origin(), HandlerOrigin::Registry);
    assert_eq!(record.default_export(), Some(&json!(6)));
}

#[tokio::test]
async fn test_changed_bytes_reinvoke_handler() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    let calls = Arc::new(AtomicUsize::new(0));
    h.loader
        .define(["csv"], counting_csv(Arc::clone(&calls), Duration::ZERO))
        .unwrap();

    h.fetcher.insert(&asset("a.csv"), "1,2\n", None);
    let first = h
        .loader
        .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
        .await
        .unwrap();

    h.fetcher.insert(&asset("a.csv"), "5,6\n", None);
    let second = h
        .loader
        .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.default_export(), Some(&json!([[1, 2]])));
    assert_eq!(second.default_export(), Some(&json!([[5, 6]])));
    assert_ne!(first.fingerprint(), second.fingerprint());
    assert_eq!(h.loader.cache().len(), 1);
}

#[tokio::test]
async fn test_handler_error_reaches_importer() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("bad.csv"), "1,2\n3\n", None);
    let strict = Handler::from_fn("strict-csv", |bytes: &[u8], ctx: &HandlerContext| {
        let rows = builtin::parse_csv(&ctx.decode_text(bytes)?);
        if let Some((i, _)) = rows.iter().enumerate().find(|(_, r)| r.len() != 2) {
            anyhow::bail!("row {} has the wrong number of columns", i + 1);
        }
        Ok(json!({ "default": rows }))
    });

    let err = h
        .loader
        .import(
            "./bad.csv",
            None,
            ImportAssertion::new("csv").with_handler(strict.clone()),
            ImportBindings::Default("rows".into()),
        )
        .await
        .unwrap_err();

    match &err {
        ImportError::HandlerExecution {
            kind,
            message,
            handler,
            ..
        } => {
            assert_eq!(*kind, ExecutionFailure::Failed);
            assert_eq!(message, "row 2 has the wrong number of columns");
            assert_eq!(*handler, strict.id());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.url(), Some("mem:///app/bad.csv"));
    assert_eq!(err.asserted_type(), Some("csv"));
    assert!(h.loader.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out() {
    let mut config = LoaderConfig::new(FallbackPolicy::RegistryOnly);
    config.handler_timeout_ms = 100;
    let h = harness(config);
    h.fetcher.insert(&asset("a.csv"), "1\n", None);
    let calls = Arc::new(AtomicUsize::new(0));

    let err = h
        .loader
        .import(
            "./a.csv",
            None,
            ImportAssertion::new("csv").with_handler(counting_csv(calls, Duration::from_secs(10))),
            ImportBindings::Dynamic,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ImportError::HandlerExecution {
            kind: ExecutionFailure::TimedOut,
            ..
        }
    ));
    assert_eq!(h.loader.cache().in_flight_count(), 0);
}

#[tokio::test]
async fn test_abandoned_import_still_populates_cache() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("a.csv"), "1,2\n", None);
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let handler = {
        let gate = Arc::clone(&gate);
        let calls = Arc::clone(&calls);
        Handler::new("gated", move |_bytes: bytes::Bytes, _ctx: HandlerContext| {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok::<_, anyhow::Error>(json!({ "default": "done" }))
            }
        })
    };
    h.loader.define(["csv"], handler).unwrap();

    let abandoned = {
        let loader = Arc::clone(&h.loader);
        tokio::spawn(async move {
            loader
                .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
                .await
        })
    };
    while h.loader.cache().in_flight_count() == 0 {
        tokio::task::yield_now().await;
    }
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    gate.notify_one();
    while h.loader.cache().in_flight_count() != 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(h.loader.cache().len(), 1);

    let record = h
        .loader
        .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Dynamic)
        .await
        .unwrap();
    assert_eq!(record.default_export(), Some(&json!("done")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fallback_policy_governs_registry_miss() {
    for (policy, native) in [
        (FallbackPolicy::RegistryOnly, false),
        (FallbackPolicy::NativeOnRegistryMiss, true),
        (FallbackPolicy::PreferNative, true),
    ] {
        let h = harness(LoaderConfig::new(policy));
        h.fetcher.insert(&asset("data.json"), r#"{"ok":true}"#, None);

        let result = h
            .loader
            .import("./data.json", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await;

        if native {
            let record = result.unwrap();
            assert_eq!(record.origin(), HandlerOrigin::Native, "{policy}");
            assert_eq!(record.default_export(), Some(&json!({ "ok": true })));
        } else {
            assert!(matches!(result, Err(ImportError::HandlerResolution { .. })), "{policy}");
        }
    }
}

#[tokio::test]
async fn test_native_fallback_follows_served_content_type() {
    for policy in [FallbackPolicy::NativeOnRegistryMiss, FallbackPolicy::PreferNative] {
        let h = harness(LoaderConfig::new(policy));
        h.fetcher.insert(&asset("api/data?v=2"), r#"{"ok":true}"#, Some("application/json"));

        let record = h
            .loader
            .import("./api/data?v=2", None, ImportAssertion::new("json"), ImportBindings::Dynamic)
            .await
            .unwrap();

        assert_eq!(record.origin(), HandlerOrigin::Native, "{policy}");
        assert_eq!(record.default_export(), Some(&json!({ "ok": true })));
        assert_eq!(h.fetcher.fetch_count(), 1);
    }
}

#[tokio::test]
async fn test_explicit_handler_overrides_native() {
    let h = harness(LoaderConfig::new(FallbackPolicy::PreferNative));
    h.fetcher.insert(&asset("data.json"), r#"{"a":1}"#, None);
    let keys = Handler::from_fn("keys", |bytes: &[u8], _ctx: &HandlerContext| {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let keys: Vec<String> = value
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        Ok(json!({ "default": keys }))
    });

    let record = h
        .loader
        .import(
            "./data.json",
            None,
            ImportAssertion::new("json").with_handler(keys),
            ImportBindings::Dynamic,
        )
        .await
        .unwrap();

    assert_eq!(record.origin(), HandlerOrigin::Inline);
    assert_eq!(record.default_export(), Some(&json!(["a"])));
}

#[tokio::test]
async fn test_handler_module_import() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));
    h.fetcher.insert(&asset("a.csv"), "1,2\n", None);
    h.fetcher.insert(&asset("b.csv"), "3,4\n", None);
    h.modules
        .register("./csv-handler.js", || HandlerModule::with_default_handler(builtin::csv_handler()));

    for file in ["./a.csv", "./b.csv", "./a.csv"] {
        let record = h
            .loader
            .import(
                file,
                None,
                ImportAssertion::new("csv").with_handler_module("./csv-handler.js"),
                ImportBindings::Named(vec!["rows".into(), "columns".into()]),
            )
            .await
            .unwrap();
        assert_eq!(record.origin(), HandlerOrigin::ExternalModule);
        assert!(record.has_export("rows"));
        assert!(record.has_export("columns"));
    }

    assert_eq!(h.modules.instantiation_count(), 1);
    assert_eq!(h.loader.stats().cache_hits.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_missing_handler_module_rejects_import() {
    let h = harness(LoaderConfig::new(FallbackPolicy::PreferNative));
    h.fetcher.insert(&asset("data.json"), "{}", None);

    let err = h
        .loader
        .import(
            "./data.json",
            None,
            ImportAssertion::new("json").with_handler_module("./nope.js"),
            ImportBindings::Dynamic,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::HandlerResolution { .. }));
    assert_eq!(h.fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_side_effect_import_cannot_name_handler() {
    let h = harness(LoaderConfig::new(FallbackPolicy::RegistryOnly));

    let err = h
        .loader
        .import(
            "./a.csv",
            None,
            ImportAssertion::new("csv").with_handler(builtin::csv_handler()),
            ImportBindings::SideEffectOnly,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::Assertion { .. }));
    assert_eq!(err.url(), Some("mem:///app/a.csv"));
    assert_eq!(err.asserted_type(), Some("csv"));
    assert_eq!(h.fetcher.fetch_count(), 0);
}

#[tokio::test]
async fn test_imports_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/notes.txt"), "alpha\nbeta\n").unwrap();

    let registry = Arc::new(HandlerRegistry::default());
    registry.define(["lines"], builtin::lines_handler()).unwrap();
    let loader = ModuleLoader::builder(LoaderConfig::new(FallbackPolicy::RegistryOnly))
        .registry(registry)
        .specifier_resolver(Arc::new(
            UrlSpecifierResolver::from_directory(dir.path()).unwrap(),
        ))
        .build();

    let record = loader
        .import(
            "./data/notes.txt",
            None,
            ImportAssertion::new("lines"),
            ImportBindings::Namespace("notes".into()),
        )
        .await
        .unwrap();

    assert_eq!(record.default_export(), Some(&json!(["alpha", "beta"])));
    assert_eq!(record.get_export("count"), Some(&json!(2)));
}
