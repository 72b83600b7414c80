//! End-to-end engine behaviour over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stategraph_core::{
    digest_value, AddDependency, CreateState, Direction, EdgeJobConfig, Engine, EngineConfig,
    Error, LabelPolicy, ListStates, OverallStatus, PolicyLabelValidator,
};
use stategraph_storage::{EdgeStatus, LabelValue, Labels, LockInfo, MemoryStore, ValidationStatus};

fn engine() -> Engine<MemoryStore> {
    Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
}

fn tfstate(serial: i64, outputs: Value) -> Vec<u8> {
    json!({
        "version": 4,
        "terraform_version": "1.7.0",
        "serial": serial,
        "lineage": "lineage-1",
        "outputs": outputs,
        "resources": []
    })
    .to_string()
    .into_bytes()
}

fn string_output(value: &str) -> Value {
    json!({ "value": value, "type": "string" })
}

async fn create(engine: &Engine<MemoryStore>, logic_id: &str) -> String {
    engine
        .create_state(CreateState {
            logic_id: logic_id.into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .guid
}

fn dep(from: &str, output: &str, to: &str) -> AddDependency {
    AddDependency {
        from_guid: from.into(),
        from_output: output.into(),
        to_guid: to.into(),
        ..Default::default()
    }
}

async fn edge_status(engine: &Engine<MemoryStore>, consumer: &str) -> EdgeStatus {
    let edges = engine.list_dependencies(consumer).await.unwrap();
    assert_eq!(edges.len(), 1);
    edges[0].status
}

fn lock_info(id: &str, who: &str) -> LockInfo {
    LockInfo {
        id: id.into(),
        operation: "OperationTypeApply".into(),
        who: who.into(),
        version: "1.7.0".into(),
        ..Default::default()
    }
}

// ── Drift lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn network_app_lifecycle() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    assert_ne!(network, app);

    let added = engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();
    assert_eq!(added.edge.status, EdgeStatus::Pending);

    let outcome = engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.producer_edges.updated, 1);
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Dirty);

    engine
        .update_content(&app, tfstate(1, json!({})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Clean);
    let app_content = engine.get_content(&app).await.unwrap();

    engine
        .update_content(&network, tfstate(2, json!({"vpc_id": string_output("vpc-456")})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Dirty);
    assert_eq!(engine.get_content(&app).await.unwrap(), app_content);
}

#[tokio::test]
async fn mock_value_until_producer_publishes() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;

    let mut req = dep(&network, "vpc_id", &app);
    req.mock_value_json = Some("\"vpc-mock\"".into());
    let added = engine.add_dependency(req).await.unwrap();
    assert_eq!(added.edge.status, EdgeStatus::Mock);

    engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Dirty);
}

#[tokio::test]
async fn producer_dropping_output_is_missing_output() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();

    engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    engine
        .update_content(&network, tfstate(2, json!({"subnet": string_output("s-1")})), None, None)
        .await
        .unwrap();
    let edges = engine.list_dependencies(&app).await.unwrap();
    assert_eq!(edges[0].status, EdgeStatus::MissingOutput);
    assert!(edges[0].out_digest.is_none());
}

// ── Schemas ──────────────────────────────────────────────────────────

#[tokio::test]
async fn manual_schema_violation_suffixes_invalid() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();
    engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    engine
        .update_content(&app, tfstate(1, json!({})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Clean);

    let row = engine
        .set_output_schema(&network, "vpc_id", r#"{"type":"integer"}"#)
        .await
        .unwrap();
    assert_eq!(row.validation_status, ValidationStatus::Invalid);
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::CleanInvalid);

    engine
        .update_content(&network, tfstate(2, json!({"vpc_id": string_output("vpc-456")})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::DirtyInvalid);

    let schema = engine.get_output_schema(&network, "vpc_id").await.unwrap();
    assert_eq!(schema.source, Some(stategraph_storage::SchemaSource::Manual));
}

#[tokio::test]
async fn inferred_schema_catches_type_drift() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();

    engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    let outputs = engine.list_outputs(&network).await.unwrap();
    assert_eq!(outputs[0].schema_source, Some(stategraph_storage::SchemaSource::Inferred));
    assert_eq!(outputs[0].validation_status, ValidationStatus::Valid);

    engine
        .update_content(&network, tfstate(2, json!({"vpc_id": {"value": 42, "type": "number"}})), None, None)
        .await
        .unwrap();
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::DirtyInvalid);
}

#[tokio::test]
async fn mixed_list_output_validates_against_its_inferred_schema() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "rules", &app)).await.unwrap();

    let rules = json!({
        "value": [{"port": 80, "cidr": "0.0.0.0/0"}, {"port": 443}],
        "type": ["tuple", [["object", {"port": "number"}], ["object", {"port": "number"}]]]
    });
    let tags = json!({ "value": ["a", 1], "type": ["tuple", ["string", "number"]] });
    engine
        .update_content(&network, tfstate(1, json!({"rules": rules, "tags": tags})), None, None)
        .await
        .unwrap();
    for output in engine.list_outputs(&network).await.unwrap() {
        assert_eq!(output.validation_status, ValidationStatus::Valid, "{}", output.key);
    }
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Dirty);
}

#[tokio::test]
async fn broken_schema_is_rejected_up_front() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let err = engine
        .set_output_schema(&network, "vpc_id", "{not json")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    // A schema for an output that does not exist yet creates a placeholder.
    let row = engine
        .set_output_schema(&network, "vpc_id", r#"{"type":"string"}"#)
        .await
        .unwrap();
    assert!(row.digest.is_none());
}

// ── Locking and content rules ────────────────────────────────────────

#[tokio::test]
async fn lock_exclusivity() {
    let engine = engine();
    let guid = create(&engine, "network").await;
    let l1 = lock_info("lock-1", "alice@ci");

    engine.lock(&guid, l1.clone()).await.unwrap();
    match engine.lock(&guid, lock_info("lock-2", "bob@laptop")).await {
        Err(Error::LockConflict(holder)) => assert_eq!(holder, l1),
        other => panic!("expected LockConflict, got {other:?}"),
    }
    match engine.unlock(&guid, "wrong-id").await {
        Err(Error::LockMismatch { held, .. }) => assert_eq!(held, Some(l1.clone())),
        other => panic!("expected LockMismatch, got {other:?}"),
    }
    assert_eq!(engine.get_state(&guid).await.unwrap().lock, Some(l1));

    let err = engine
        .update_content(&guid, tfstate(1, json!({})), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "lock_mismatch");
    engine
        .update_content(&guid, tfstate(1, json!({})), Some("lock-1".into()), None)
        .await
        .unwrap();

    engine.unlock(&guid, "lock-1").await.unwrap();
    assert!(engine.get_state(&guid).await.unwrap().lock.is_none());
    assert_eq!(engine.unlock(&guid, "lock-1").await.unwrap_err().kind(), "lock_mismatch");
}

#[tokio::test]
async fn lock_requires_an_id() {
    let engine = engine();
    let guid = create(&engine, "network").await;
    let err = engine.lock(&guid, LockInfo::default()).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn serial_rules() {
    let engine = engine();
    let guid = create(&engine, "network").await;
    engine
        .update_content(&guid, tfstate(5, json!({})), None, None)
        .await
        .unwrap();

    let err = engine
        .update_content(&guid, tfstate(3, json!({})), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    let err = engine
        .update_content(&guid, tfstate(6, json!({})), None, Some(4))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    let state = engine
        .update_content(&guid, tfstate(6, json!({})), None, Some(5))
        .await
        .unwrap()
        .state;
    assert_eq!(state.serial, 6);
    assert_eq!(state.lineage.as_deref(), Some("lineage-1"));
    assert_eq!(state.terraform_version.as_deref(), Some("1.7.0"));
}

#[tokio::test]
async fn invalid_content_writes_nothing() {
    let engine = engine();
    let guid = create(&engine, "network").await;
    let err = engine
        .update_content(&guid, b"{\"serial\": ".to_vec(), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_content");
    assert!(engine.get_content(&guid).await.unwrap().is_none());
    assert_eq!(engine.get_state(&guid).await.unwrap().serial, 0);
}

#[tokio::test]
async fn edge_job_timeout_does_not_fail_upload() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        EngineConfig {
            edge_job: EdgeJobConfig {
                timeout: Duration::ZERO,
            },
            ..Default::default()
        },
    );
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();

    let outcome = engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();
    assert!(outcome.producer_edges.timed_out);
    assert_eq!(outcome.producer_edges.updated, 0);
    assert_eq!(outcome.state.serial, 1);
    assert_eq!(edge_status(&engine, &app).await, EdgeStatus::Pending);
}

// ── Graph ────────────────────────────────────────────────────────────

#[tokio::test]
async fn four_chain_topology() {
    let engine = engine();
    let a = create(&engine, "a").await;
    let b = create(&engine, "b").await;
    let c = create(&engine, "c").await;
    let d = create(&engine, "d").await;
    engine.add_dependency(dep(&a, "out", &b)).await.unwrap();
    engine.add_dependency(dep(&b, "out", &c)).await.unwrap();
    engine.add_dependency(dep(&c, "out", &d)).await.unwrap();

    let layers = engine.topological_order(&d, Direction::Upstream).await.unwrap();
    let flat: Vec<(usize, Vec<String>)> = layers
        .iter()
        .map(|l| (l.level, l.states.iter().map(|s| s.guid.clone()).collect()))
        .collect();
    assert_eq!(
        flat,
        vec![(1, vec![c.clone()]), (2, vec![b.clone()]), (3, vec![a.clone()])]
    );

    let graph = engine.dependency_graph(&d).await.unwrap();
    assert_eq!(graph.producers.len(), 3);
    assert_eq!(graph.edges.len(), 3);

    let err = engine.add_dependency(dep(&d, "out", &a)).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn potentially_stale_through_clean_middle() {
    let engine = engine();
    let a = create(&engine, "a").await;
    let b = create(&engine, "b").await;
    let c = create(&engine, "c").await;
    engine.add_dependency(dep(&a, "out", &b)).await.unwrap();
    engine.add_dependency(dep(&b, "out", &c)).await.unwrap();

    let out = |v: &str| json!({"out": string_output(v)});
    engine.update_content(&a, tfstate(1, out("a1")), None, None).await.unwrap();
    engine.update_content(&b, tfstate(1, out("b1")), None, None).await.unwrap();
    engine.update_content(&c, tfstate(1, json!({})), None, None).await.unwrap();
    assert_eq!(engine.state_status(&c).await.unwrap().status, OverallStatus::Clean);

    engine.update_content(&a, tfstate(2, out("a2")), None, None).await.unwrap();
    let c_status = engine.state_status(&c).await.unwrap();
    assert_eq!(c_status.status, OverallStatus::PotentiallyStale);
    assert_eq!(c_status.incoming[0].edge.status, EdgeStatus::Clean);
    assert_eq!(engine.state_status(&b).await.unwrap().status, OverallStatus::Stale);
}

// ── States, labels, listing ──────────────────────────────────────────

#[tokio::test]
async fn identity_rules() {
    let engine = engine();
    let guid = create(&engine, "network").await;
    let err = engine
        .create_state(CreateState {
            logic_id: "network".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "already_exists");

    let too_long = "x".repeat(129);
    for bad in ["", "a/b", too_long.as_str()] {
        let err = engine
            .create_state(CreateState {
                logic_id: bad.to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    let err = engine
        .create_state(CreateState {
            guid: Some("nope".into()),
            logic_id: "other".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    let by_logic = engine.get_state_by_logic_id("network").await.unwrap();
    assert_eq!(by_logic.guid, guid);
    assert_eq!(engine.get_state(&guid.to_uppercase()).await.unwrap().guid, guid);
}

#[tokio::test]
async fn label_policy_gates_create_and_update() {
    let mut policy = LabelPolicy::default();
    policy
        .enums
        .insert("env".into(), vec!["dev".into(), "prod".into()]);
    let engine = engine().with_label_validator(Arc::new(PolicyLabelValidator::new(policy)));

    let bad = Labels::from([("env".to_string(), LabelValue::String("qa".into()))]);
    let err = engine
        .create_state(CreateState {
            logic_id: "network".into(),
            labels: bad,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_failed");

    let labels = Labels::from([
        ("env".to_string(), LabelValue::String("dev".into())),
        ("tier".to_string(), LabelValue::Number(1.0)),
    ]);
    let state = engine
        .create_state(CreateState {
            logic_id: "network".into(),
            labels,
            ..Default::default()
        })
        .await
        .unwrap();

    let updated = engine
        .update_labels(
            &state.guid,
            Labels::from([("env".to_string(), LabelValue::String("prod".into()))]),
            vec!["tier".into()],
        )
        .await
        .unwrap();
    assert_eq!(updated.labels.len(), 1);
    assert_eq!(updated.labels["env"], LabelValue::String("prod".into()));

    let err = engine
        .update_labels(
            &state.guid,
            Labels::from([("env".to_string(), LabelValue::Bool(true))]),
            vec![],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_failed");
}

#[tokio::test]
async fn list_states_paginates_and_filters() {
    let engine = engine();
    for i in 0..5 {
        let env = if i % 2 == 0 { "prod" } else { "dev" };
        engine
            .create_state(CreateState {
                guid: Some(format!("0190a1b2-0000-7000-8000-00000000000{i}")),
                logic_id: format!("svc-{i}"),
                labels: Labels::from([("env".to_string(), LabelValue::String(env.into()))]),
            })
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut token = None;
    let mut pages = 0;
    loop {
        let page = engine
            .list_states(ListStates {
                page_size: Some(2),
                page_token: token.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        pages += 1;
        seen.extend(page.states.into_iter().map(|s| s.logic_id));
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen, ["svc-0", "svc-1", "svc-2", "svc-3", "svc-4"]);

    let prod = engine
        .list_states(ListStates {
            labels: Labels::from([("env".to_string(), LabelValue::String("prod".into()))]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(prod.states.len(), 3);
    assert!(prod.next_page_token.is_none());

    let err = engine
        .list_states(ListStates {
            page_token: Some("%%%".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn state_info_renders_backend_block() {
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        EngineConfig {
            base_url: "https://stategraph.internal".into(),
            ..Default::default()
        },
    );
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;
    engine.add_dependency(dep(&network, "vpc_id", &app)).await.unwrap();
    engine
        .update_content(&network, tfstate(1, json!({"vpc_id": string_output("vpc-123")})), None, None)
        .await
        .unwrap();

    let info = engine.get_state_info(&network).await.unwrap();
    assert_eq!(
        info.backend.address,
        format!("https://stategraph.internal/tfstate/{network}")
    );
    assert!(info.backend.lock_address.ends_with("/lock"));
    assert_eq!(info.outputs.len(), 1);
    assert_eq!(info.outgoing.len(), 1);
    assert!(info.incoming.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_info_serial_matches_outputs_during_uploads() {
    let engine = engine();
    let network = create(&engine, "network").await;

    let writer = {
        let engine = engine.clone();
        let network = network.clone();
        tokio::spawn(async move {
            for serial in 1..=40 {
                let outputs = json!({ "serial": { "value": serial, "type": "number" } });
                engine
                    .update_content(&network, tfstate(serial, outputs), None, None)
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    while !writer.is_finished() {
        let info = engine.get_state_info(&network).await.unwrap();
        let serial = info.state.serial;
        if serial == 0 {
            assert!(info.outputs.is_empty());
            continue;
        }
        assert_eq!(info.outputs.len(), 1);
        assert_eq!(
            info.outputs[0].digest.as_deref(),
            Some(digest_value(&json!(serial)).as_str()),
            "serial {serial} paired with another upload's digest"
        );
    }
    writer.await.unwrap();
    assert_eq!(engine.get_state_info(&network).await.unwrap().state.serial, 40);
}

#[tokio::test]
async fn concurrent_add_dependency_creates_one_edge() {
    let engine = engine();
    let network = create(&engine, "network").await;
    let app = create(&engine, "app").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let req = dep(&network, "vpc_id", &app);
        handles.push(tokio::spawn(async move { engine.add_dependency(req).await }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap().unwrap().edge.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.list_dependencies(&app).await.unwrap().len(), 1);
}
