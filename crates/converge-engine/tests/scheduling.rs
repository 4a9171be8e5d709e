mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    FakeAnalyzer, FakeProvider, Harness, analyzer_loader, custom, entry, host, props,
    provider_loader,
};
use converge_engine::provider::BoxFuture;
use converge_engine::{
    CreateRequest, CreateResponse, DeploymentOptions, EngineError, InvokeRequest,
    MemorySnapshotStore, Parameterization, PluginHost, Provider, ProviderError, ProviderLoader,
    RegisterPackageRequest, ResourceMonitor,
};
use tokio::sync::Notify;
use converge_policy::RequiredPolicy;
use serde_json::{Value, json};

fn failing_create_for(name: &'static str) -> FakeProvider {
    FakeProvider {
        create: Some(Arc::new(move |req: &CreateRequest| {
            if req.urn.name() == name {
                return Err(ProviderError::Failed("quota exceeded".into()));
            }
            Ok(CreateResponse {
                id: format!("{}-id", req.urn.name()),
                outputs: req.inputs.clone(),
            })
        })),
        ..Default::default()
    }
}

#[tokio::test]
async fn siblings_registered_from_many_tasks_all_commit() {
    let provider = Arc::new(failing_create_for("never"));
    let harness = Harness::new();

    let outcome = harness
        .run(host(provider.clone()), |m| async move {
            let root = m.register_resource(custom("root", json!({}))).await?;
            let mut tasks = Vec::new();
            for i in 0..5 {
                let m = m.clone();
                let root = root.urn.clone();
                tasks.push(tokio::spawn(async move {
                    let req = custom(&format!("leaf-{i}"), json!({ "i": i }))
                        .with_dependencies(vec![root]);
                    m.register_resource(req).await
                }));
            }
            for task in tasks {
                let res = task.await.expect("task panicked")?;
                assert_eq!(res.id, format!("{}-id", res.urn.name()));
            }
            Ok(())
        })
        .await;

    outcome.result.unwrap();
    assert_eq!(outcome.snapshot.len(), 6);
    assert_eq!(provider.calls_of("create")[0], "root");
    assert_eq!(provider.count("create"), 6);
}

#[tokio::test]
async fn failure_halts_the_run_and_cancels_pending_work() {
    let harness = Harness::new();
    let provider = Arc::new(failing_create_for("resA"));

    let outcome = harness
        .run(host(provider.clone()), |m| async move {
            let a = m.register_resource(custom("resA", json!({}))).await;
            assert!(matches!(a, Err(EngineError::ProviderOperation { op: "create", .. })));

            let b = m.register_resource(custom("resB", json!({}))).await;
            assert!(matches!(b, Err(EngineError::Canceled)));
            Ok(())
        })
        .await;

    assert!(matches!(
        outcome.result,
        Err(EngineError::ProviderOperation { op: "create", .. })
    ));
    assert!(outcome.snapshot.is_empty());
    assert_eq!(provider.calls_of("create"), ["resA"]);
    assert!(provider.was_canceled());
}

#[tokio::test]
async fn continue_on_error_skips_only_dependents() {
    let harness = Harness::new().with_options(DeploymentOptions {
        continue_on_error: true,
        ..Default::default()
    });
    harness
        .run(host(Arc::new(FakeProvider::default())), |m| async move {
            m.register_resource(custom("stale", json!({}))).await?;
            Ok(())
        })
        .await
        .result
        .unwrap();

    let provider = Arc::new(failing_create_for("resA"));
    let outcome = harness
        .run(host(provider.clone()), |m| async move {
            let a = m.register_resource(custom("resA", json!({}))).await;
            assert!(a.is_err());

            let urn_a = converge_core::Urn::new("test", "test", None, common::TYPE_A, "resA");
            let b = m
                .register_resource(custom("resB", json!({})).with_dependencies(vec![urn_a]))
                .await;
            assert!(matches!(b, Err(EngineError::DependencyFailed { .. })));

            m.register_resource(custom("resC", json!({}))).await?;
            Ok(())
        })
        .await;

    assert!(matches!(
        outcome.result,
        Err(EngineError::ProviderOperation { op: "create", .. })
    ));
    assert_eq!(outcome.snapshot.len(), 1);
    assert_eq!(entry(&outcome.snapshot, "resC").id, "resC-id");
    assert_eq!(provider.calls_of("delete"), ["stale"]);
}

#[tokio::test]
async fn unknown_references_and_duplicates_are_rejected() {
    let harness = Harness::new().with_options(DeploymentOptions {
        continue_on_error: true,
        ..Default::default()
    });
    let provider = Arc::new(FakeProvider::default());

    let outcome = harness
        .run(host(provider.clone()), |m| async move {
            m.register_resource(custom("resA", json!({}))).await?;
            let again = m.register_resource(custom("resA", json!({}))).await;
            assert!(matches!(again, Err(EngineError::DuplicateUrn { .. })));

            let ghost = converge_core::Urn::new("test", "test", None, common::TYPE_A, "ghost");
            let orphan = m
                .register_resource(custom("resB", json!({})).with_parent(ghost))
                .await;
            assert!(matches!(
                orphan,
                Err(EngineError::UnknownReference { field: "parent", .. })
            ));
            Ok(())
        })
        .await;

    assert!(matches!(outcome.result, Err(EngineError::DuplicateUrn { .. })));
    assert_eq!(outcome.snapshot.len(), 1);
    assert_eq!(provider.count("create"), 1);
}

#[tokio::test]
async fn monitor_is_shut_down_after_the_program_returns() {
    let harness = Harness::new();
    let kept: Arc<Mutex<Option<ResourceMonitor>>> = Arc::new(Mutex::new(None));

    let outcome = harness
        .run(host(Arc::new(FakeProvider::default())), {
            let kept = kept.clone();
            move |m| async move {
                *kept.lock().unwrap() = Some(m);
                Ok(())
            }
        })
        .await;
    outcome.result.unwrap();

    let monitor = kept.lock().unwrap().take().unwrap();
    let late = monitor.register_resource(custom("late", json!({}))).await;
    assert!(matches!(late, Err(EngineError::MonitorShutDown)));
}

#[tokio::test]
async fn cancellation_stops_the_run_and_notifies_plugins() {
    let analyzer = Arc::new(FakeAnalyzer::default());
    let provider = Arc::new(FakeProvider::default());
    let harness = Harness::new().with_options(DeploymentOptions {
        required_policies: vec![RequiredPolicy::new("analyzerA")],
        ..Default::default()
    });
    harness
        .run(
            host(provider.clone()).with_analyzer(analyzer_loader("analyzerA", analyzer.clone())),
            |m| async move {
                m.register_resource(custom("kept", json!({}))).await?;
                Ok(())
            },
        )
        .await
        .result
        .unwrap();

    let deployment = harness.deployment(
        host(provider.clone()).with_analyzer(analyzer_loader("analyzerA", analyzer.clone())),
    );
    let token = deployment.cancellation_token();
    let outcome = deployment
        .update_from_store(|m| async move {
            m.register_resource(custom("kept", json!({}))).await?;
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let res = m.register_resource(custom("late", json!({}))).await;
            assert!(matches!(res, Err(EngineError::Canceled)));
            Ok(())
        })
        .await;

    assert!(matches!(outcome.result, Err(EngineError::Canceled)));
    common::assert_valid(&outcome.snapshot);
    assert_eq!(outcome.snapshot.len(), 1, "committed steps survive, deletes are skipped");
    assert!(analyzer.was_canceled());
    assert!(provider.was_canceled());
    assert_eq!(provider.count("delete"), 0);
}

#[tokio::test]
async fn register_package_is_idempotent() {
    let parameterized = Arc::new(AtomicUsize::new(0));
    let provider = {
        let parameterized = parameterized.clone();
        Arc::new(FakeProvider {
            parameterize: Some(Arc::new(move |value: &Value| {
                parameterized.fetch_add(1, Ordering::SeqCst);
                let name = value["name"].as_str().unwrap_or("unnamed").to_string();
                Ok((name, "2.0.0".to_string()))
            })),
            ..Default::default()
        })
    };
    let host = PluginHost::new().with_provider(provider_loader("pkgA", "1.0.0", provider.clone()));
    let harness = Harness::new();

    let outcome = harness
        .run(host, |m| async move {
            let req = RegisterPackageRequest {
                name: "pkgA".into(),
                version: "1.0.0".into(),
                parameterization: Some(Parameterization {
                    name: "pkgA-param".into(),
                    version: "2.0.0".into(),
                    value: json!({ "name": "pkgA-param" }),
                }),
            };
            let (first, second) = tokio::join!(
                m.register_package(req.clone()),
                m.register_package(req.clone())
            );
            let (first, second) = (first?, second?);
            assert_eq!(first, second);
            assert_eq!(first.reference, "pkgA-param@2.0.0");

            let mut res = custom("resA", json!({}));
            res.provider = Some(first.reference);
            m.register_resource(res).await?;
            Ok(())
        })
        .await;

    outcome.result.unwrap();
    assert_eq!(parameterized.load(Ordering::SeqCst), 1);
    assert_eq!(
        entry(&outcome.snapshot, "resA").provider.as_deref(),
        Some("pkgA-param@2.0.0")
    );
}

#[tokio::test]
async fn invoke_reaches_the_provider() {
    let provider = Arc::new(FakeProvider {
        invoke: Some(Arc::new(|req: &InvokeRequest| {
            let mut out = req.args.clone();
            out.insert("echoed".into(), json!(true));
            Ok(out)
        })),
        ..Default::default()
    });
    let harness = Harness::new();

    let outcome = harness
        .run(host(provider.clone()), |m| async move {
            let out = m
                .invoke(InvokeRequest {
                    token: "pkgA:index:lookup".into(),
                    args: props(json!({ "key": "k" })),
                    provider: None,
                })
                .await?;
            assert_eq!(out, props(json!({ "key": "k", "echoed": true })));

            let unsupported = m
                .call(InvokeRequest {
                    token: "pkgA:index:method".into(),
                    args: props(json!({})),
                    provider: None,
                })
                .await;
            assert!(matches!(unsupported, Err(EngineError::Invoke { .. })));
            Ok(())
        })
        .await;

    outcome.result.unwrap();
    assert_eq!(provider.calls_of("invoke"), ["pkgA:index:lookup"]);
}

/// Provider whose creates never finish on their own; only `cancel` lets them
/// return.
#[derive(Default)]
struct StuckProvider {
    release: Notify,
    canceled: AtomicBool,
}

impl Provider for StuckProvider {
    fn create<'a>(
        &'a self,
        _req: &'a CreateRequest,
    ) -> BoxFuture<'a, Result<CreateResponse, ProviderError>> {
        Box::pin(async move {
            self.release.notified().await;
            Err(ProviderError::Failed("interrupted".into()))
        })
    }

    fn cancel(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        self.canceled.store(true, Ordering::SeqCst);
        self.release.notify_one();
        Box::pin(async { Ok(()) })
    }
}

fn loader_for<P: Provider + 'static>(provider: Arc<P>) -> ProviderLoader {
    ProviderLoader::new("pkgA", "1.0.0", move || {
        let provider: Arc<dyn Provider> = provider.clone();
        Ok(provider)
    })
}

#[tokio::test]
async fn cancel_interrupts_a_create_in_flight() {
    let provider = Arc::new(StuckProvider::default());
    let harness = Harness::new();
    let deployment = harness.deployment(PluginHost::new().with_provider(loader_for(provider.clone())));
    let token = deployment.cancellation_token();

    let run = deployment.update_from_store(|m| async move {
        let stuck = tokio::spawn({
            let m = m.clone();
            async move { m.register_resource(custom("resA", json!({}))).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        assert!(stuck.await.expect("task panicked").is_err());
        let urn_a = converge_core::Urn::new("test", "test", None, common::TYPE_A, "resA");
        let b = m
            .register_resource(custom("resB", json!({})).with_dependencies(vec![urn_a]))
            .await;
        assert!(matches!(b, Err(EngineError::Canceled)));
        Ok(())
    });
    let outcome = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("run did not stop after cancel");

    assert!(matches!(outcome.result, Err(EngineError::Canceled)));
    assert!(outcome.snapshot.is_empty());
    assert!(provider.canceled.load(Ordering::SeqCst));
}

/// Provider whose creates take a while. Records what the store held when
/// each create began and how many creates were running at once.
struct SlowProvider {
    store: Arc<MemorySnapshotStore>,
    delay: Duration,
    committed_at_start: Mutex<Vec<(String, Vec<String>)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowProvider {
    fn new(store: Arc<MemorySnapshotStore>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            committed_at_start: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn committed_when(&self, name: &str) -> Vec<String> {
        self.committed_at_start
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, committed)| committed.clone())
            .unwrap_or_else(|| panic!("{name} was never created"))
    }
}

impl Provider for SlowProvider {
    fn create<'a>(
        &'a self,
        req: &'a CreateRequest,
    ) -> BoxFuture<'a, Result<CreateResponse, ProviderError>> {
        Box::pin(async move {
            let committed = self
                .store
                .latest()
                .map(|s| s.resources.iter().map(|r| r.urn.name().to_string()).collect())
                .unwrap_or_default();
            self.committed_at_start
                .lock()
                .unwrap()
                .push((req.urn.name().to_string(), committed));

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            Ok(CreateResponse {
                id: format!("{}-id", req.urn.name()),
                outputs: req.inputs.clone(),
            })
        })
    }
}

#[tokio::test]
async fn dependent_waits_for_its_dependency_to_commit() {
    let harness = Harness::new();
    let provider = Arc::new(SlowProvider::new(harness.store.clone(), Duration::from_millis(100)));
    let host = PluginHost::new().with_provider(loader_for(provider.clone()));

    let outcome = harness
        .run(host, |m| async move {
            let urn_a = converge_core::Urn::new("test", "test", None, common::TYPE_A, "resA");
            let (a, b) = tokio::join!(
                m.register_resource(custom("resA", json!({}))),
                m.register_resource(custom("resB", json!({})).with_dependencies(vec![urn_a])),
            );
            a?;
            b?;
            Ok(())
        })
        .await;

    outcome.result.unwrap();
    assert!(provider.committed_when("resA").is_empty());
    assert_eq!(provider.committed_when("resB"), ["resA"]);
    let history = harness.store.history();
    let first_with_b = history
        .iter()
        .position(|s| s.resources.iter().any(|r| r.urn.name() == "resB"))
        .unwrap();
    assert!(history[..first_with_b]
        .iter()
        .any(|s| s.resources.iter().any(|r| r.urn.name() == "resA")));
}

#[tokio::test]
async fn independent_creates_overlap_up_to_the_parallel_limit() {
    let harness = Harness::new().with_options(DeploymentOptions {
        parallel: 3,
        ..Default::default()
    });
    let provider = Arc::new(SlowProvider::new(harness.store.clone(), Duration::from_millis(50)));
    let host = PluginHost::new().with_provider(loader_for(provider.clone()));

    let outcome = harness
        .run(host, |m| async move {
            let mut tasks = Vec::new();
            for i in 0..6 {
                let m = m.clone();
                tasks.push(tokio::spawn(async move {
                    m.register_resource(custom(&format!("res{i}"), json!({}))).await
                }));
            }
            for task in tasks {
                task.await.expect("task panicked")?;
            }
            Ok(())
        })
        .await;

    outcome.result.unwrap();
    assert_eq!(outcome.snapshot.len(), 6);
    let peak = provider.peak.load(Ordering::SeqCst);
    assert!(peak >= 2, "creates never overlapped");
    assert!(peak <= 3, "{peak} creates ran at once");
}
