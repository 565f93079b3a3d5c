// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end graph scenarios: local fan-in, cross-context bridging,
//! bridge reuse and garbage collection, and parameterization.

use flowmesh_config::{Endpoints, NodeId};
use flowmesh_data::{FieldSchema, SharedStruct};
use flowmesh_engine::await_terminal;
use flowmesh_nodes::{Constant, Lambda, Noise, ParamSpec, ParametrizedLambda, Signal, Throughput, Writer, WriteMode};
use flowmesh_orchestrator::Orchestrator;
use std::future::Future;
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::sleep;

fn run_local<F: Future<Output = ()>>(fut: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let local = LocalSet::new();
    rt.block_on(local.run_until(fut));
}

/// Polls `cond` until it holds or a generous deadline passes.
async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn id(name: &str) -> NodeId {
    NodeId::from(name.to_owned())
}

/// Two emitters into a product router into a counting collector, all in a
/// single context. The collector count grows monotonically as readiness
/// cycles complete.
#[test]
fn local_fan_in_drives_the_collector() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx = orch.new_context().expect("context");

        let report = SharedStruct::new(orch.segment_manager(), FieldSchema::scalar());
        let p1 = Noise::blueprint_with_id(id("p1"), Duration::ZERO);
        let p2 = Noise::blueprint_with_id(id("p2"), Duration::ZERO);
        let p3 = Lambda::blueprint_with_id(id("p3"), |args| args[0] * args[1]);
        let p4 = Throughput::blueprint_with_id(id("p4"), Some(report.descriptor()));

        orch.add(p1, &ctx).await.expect("add p1");
        orch.add(p2, &ctx).await.expect("add p2");
        orch.add(p3, &ctx).await.expect("add p3");
        orch.add(p4, &ctx).await.expect("add p4");
        orch.connect(&id("p1"), &id("p3"), None).await.expect("p1->p3");
        orch.connect(&id("p2"), &id("p3"), None).await.expect("p2->p3");
        orch.connect(&id("p3"), &id("p4"), None).await.expect("p3->p4");

        eventually("first completed readiness cycle", || {
            report.item().expect("count") >= 1.0
        })
        .await;
        let first = report.item().expect("count");
        eventually("count keeps growing", || report.item().expect("count") > first).await;

        orch.shutdown();
    });
}

/// Unbuffered cross-context link: exactly one publisher and one
/// subscriber; the consumer converges on twice the last propagated sample
/// of the finite signal; once the signal finishes, the payload freezes.
#[test]
fn unbuffered_cross_context_link_converges() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx_a = orch.new_context().expect("ctx_a");
        let ctx_b = orch.new_context().expect("ctx_b");

        // Paced so the bridge is in place well before the signal finishes.
        let p1 = Signal::blueprint_throttled(id("p1"), f64::sin, 5.0, Duration::from_millis(10));
        let p2 = Lambda::blueprint_with_id(id("p2"), |args| 2.0 * args[0]);
        orch.add(p1, &ctx_a).await.expect("add p1");
        orch.add(p2, &ctx_b).await.expect("add p2");

        let report = SharedStruct::new(orch.segment_manager(), FieldSchema::scalar());
        let probe = Writer::blueprint(id("probe"), report.descriptor(), WriteMode::Fill);
        orch.add(probe, &ctx_b).await.expect("add probe");

        orch.connect(&id("p1"), &id("p2"), None).await.expect("link");
        orch.connect(&id("p2"), &id("probe"), None).await.expect("p2->probe");

        // Exactly one publisher in ctx_a, one subscriber in ctx_b.
        assert_eq!(orch.publication_count(), 1);
        assert_eq!(orch.subscription_count(), 1);
        let publisher = orch.publication(&id("p1")).expect("publication").publisher().clone();
        assert_eq!(orch.context_of(&publisher), Some(&ctx_a));
        let subscriber = orch.subscriber_id(&id("p1"), &ctx_b).expect("subscription").clone();
        assert_eq!(orch.context_of(&subscriber), Some(&ctx_b));

        // The last propagated tick is fun(4): tick 5 reaches the limit and
        // is replaced by the terminal notification.
        let expected = 2.0 * (4.0f64).sin();
        eventually("consumer sees 2*sin(4)", || {
            (report.item().expect("probe") - expected).abs() < 1e-12
        })
        .await;

        // After the terminal notification the publisher stops receiving
        // writes: the bridge payload stays frozen at sin(4).
        await_terminal(orch.bus(), &id("p1")).await.expect("terminal");
        let payload = orch.publication(&id("p1")).expect("publication").descriptor();
        let frozen = SharedStruct::open(orch.segment_manager(), &payload).expect("payload view");
        let last = frozen.item().expect("payload");
        assert!((last - (4.0f64).sin()).abs() < 1e-12, "payload moved past the limit: {last}");
        sleep(Duration::from_millis(30)).await;
        assert_eq!(frozen.item().expect("payload"), last);

        orch.shutdown();
    });
}

/// Buffered, lossy cross-context link under a tick flood: the subscriber
/// observes at least one committed sample, nothing crashes, and unlinking
/// removes both bridge halves.
#[test]
fn buffered_lossy_link_survives_a_flood_and_unlinks() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx_a = orch.new_context().expect("ctx_a");
        let ctx_b = orch.new_context().expect("ctx_b");

        let p1 =
            Signal::blueprint_throttled(id("p1"), |t| t, 1000.0, Duration::from_micros(200));
        let p2 = Lambda::blueprint_with_id(id("p2"), |args| 2.0 * args[0]);
        orch.add(p1, &ctx_a).await.expect("add p1");
        orch.add(p2, &ctx_b).await.expect("add p2");

        let report = SharedStruct::new(orch.segment_manager(), FieldSchema::scalar());
        let probe = Writer::blueprint(id("probe"), report.descriptor(), WriteMode::Fill);
        orch.add(probe, &ctx_b).await.expect("add probe");

        orch.connect(&id("p1"), &id("p2"), Some(100)).await.expect("buffered link");
        orch.connect(&id("p2"), &id("probe"), None).await.expect("p2->probe");

        // At least one notification's payload makes it through; every
        // sample is twice an integer tick within the flood.
        eventually("subscriber observed a committed sample", || {
            let sample = report.item().expect("probe");
            sample.is_finite() && sample >= 2.0 && sample <= 2000.0
        })
        .await;

        orch.disconnect(&id("p1"), &id("p2")).await.expect("unlink");
        assert_eq!(orch.publication_count(), 0);
        assert_eq!(orch.subscription_count(), 0);
        assert!(!orch.has_node(&id("pub:p1")));
        assert!(!orch.has_node(&NodeId::from(format!("sub:p1:{ctx_b}"))));

        orch.shutdown();
    });
}

/// Fan-out reuse: two consumers in the same destination context share one
/// subscriber; removal then collects the subscriber first and the
/// publisher second, emptying both registries.
#[test]
fn bridge_fan_out_reuse_and_gc_order() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx_a = orch.new_context().expect("ctx_a");
        let ctx_b = orch.new_context().expect("ctx_b");

        orch.add(Constant::blueprint_with_id(id("p1"), 1.0), &ctx_a)
            .await
            .expect("add p1");
        orch.add(Lambda::blueprint_with_id(id("p2"), |args| args[0]), &ctx_b)
            .await
            .expect("add p2");
        orch.add(Lambda::blueprint_with_id(id("p3"), |args| args[0]), &ctx_b)
            .await
            .expect("add p3");

        orch.connect(&id("p1"), &id("p2"), None).await.expect("p1->p2");
        orch.connect(&id("p1"), &id("p3"), None).await.expect("p1->p3");

        // One publisher, one subscriber, reused for both consumers.
        assert_eq!(orch.publication_count(), 1);
        assert_eq!(orch.subscription_count(), 1);
        let subscriber = orch.subscriber_id(&id("p1"), &ctx_b).expect("subscription").clone();
        assert_eq!(
            orch.sinks_of(&subscriber).expect("subscriber sinks"),
            vec![id("p2"), id("p3")]
        );

        // Dropping one consumer keeps the shared bridge alive.
        orch.disconnect(&id("p1"), &id("p2")).await.expect("drop p2");
        assert_eq!(orch.subscription_count(), 1);
        assert_eq!(orch.publication_count(), 1);

        // Dropping the last consumer collects subscriber then publisher.
        orch.disconnect(&id("p1"), &id("p3")).await.expect("drop p3");
        assert_eq!(orch.subscription_count(), 0);
        assert_eq!(orch.publication_count(), 0);
        assert!(!orch.has_node(&subscriber));
        assert!(!orch.has_node(&id("pub:p1")));
        // The producer and consumers themselves survive.
        assert!(orch.has_node(&id("p1")));
        assert!(orch.has_node(&id("p2")));
        assert!(orch.has_node(&id("p3")));

        orch.shutdown();
    });
}

/// Removing the consumer (rather than disconnecting the edge) triggers the
/// same bridge garbage collection.
#[test]
fn removing_a_consumer_collects_the_bridge() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx_a = orch.new_context().expect("ctx_a");
        let ctx_b = orch.new_context().expect("ctx_b");

        orch.add(Constant::blueprint_with_id(id("p1"), 1.0), &ctx_a)
            .await
            .expect("add p1");
        orch.add(Lambda::blueprint_with_id(id("p2"), |args| args[0]), &ctx_b)
            .await
            .expect("add p2");
        orch.connect(&id("p1"), &id("p2"), None).await.expect("link");
        assert_eq!(orch.publication_count(), 1);

        orch.remove(&id("p2")).await.expect("remove consumer");
        assert_eq!(orch.publication_count(), 0);
        assert_eq!(orch.subscription_count(), 0);
        assert!(!orch.has_node(&id("p2")));
        assert!(orch.has_node(&id("p1")));

        orch.shutdown();
    });
}

/// Parameterize: a merge-mode writer in the source's context retunes the
/// parametrized node's live parameter record.
#[test]
fn parameterize_writes_into_the_parameter_record() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx = orch.new_context().expect("context");

        let pl = ParametrizedLambda::blueprint_with_id(
            id("pl"),
            orch.segment_manager(),
            |args, params| args[0] + params[0],
            &[ParamSpec::new(0.0, -1.0, 1.0)],
        )
        .expect("blueprint");
        let params = pl.manifest().params.clone().expect("param record");
        orch.add(pl, &ctx).await.expect("add pl");

        // The parameterizing source emits a field named like the target
        // parameter, so the merge write lands on `p0`.
        orch.add(Constant::blueprint_named(id("p1"), "p0", 0.5), &ctx)
            .await
            .expect("add p1");
        orch.parameterize(&id("p1"), &id("pl")).await.expect("parameterize");

        let writer = id("param:pl:p1");
        assert!(orch.has_node(&writer));
        assert_eq!(orch.context_of(&writer), Some(&ctx));
        assert_eq!(orch.sinks_of(&id("p1")).expect("p1 sinks"), vec![writer]);

        let view = SharedStruct::open(orch.segment_manager(), &params).expect("param view");
        eventually("p0 becomes 0.5", || {
            (view.get("p0").expect("p0") - 0.5).abs() < 1e-12
        })
        .await;

        orch.shutdown();
    });
}

/// Misuse is rejected at the orchestrator boundary before anything ships.
#[test]
fn misuse_is_rejected_fail_fast() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx = orch.new_context().expect("context");

        orch.add(Constant::blueprint_with_id(id("p1"), 1.0), &ctx)
            .await
            .expect("add p1");
        // Duplicate id.
        let duplicate = orch
            .add(Constant::blueprint_with_id(id("p1"), 2.0), &ctx)
            .await;
        assert!(duplicate.is_err());
        // Unknown endpoint.
        assert!(orch.connect(&id("p1"), &id("ghost"), None).await.is_err());
        // Unknown context.
        let missing = flowmesh_config::fresh_context_id();
        let orphan = orch
            .add(Constant::blueprint_with_id(id("p2"), 1.0), &missing)
            .await;
        assert!(orphan.is_err());
        // Connect is idempotent: wiring the same edge twice is one edge.
        orch.add(Lambda::blueprint_with_id(id("l"), |args| args[0]), &ctx)
            .await
            .expect("add l");
        orch.connect(&id("p1"), &id("l"), None).await.expect("wire");
        orch.connect(&id("p1"), &id("l"), None).await.expect("re-wire");
        assert_eq!(orch.sinks_of(&id("p1")).expect("sinks"), vec![id("l")]);

        orch.shutdown();
    });
}

/// `destroy_context` drains the context's nodes (including bridge halves)
/// and stops its worker.
#[test]
fn destroy_context_clears_and_stops() {
    run_local(async {
        let mut orch = Orchestrator::new(Endpoints::default());
        let ctx_a = orch.new_context().expect("ctx_a");
        let ctx_b = orch.new_context().expect("ctx_b");

        orch.add(Constant::blueprint_with_id(id("p1"), 1.0), &ctx_a)
            .await
            .expect("add p1");
        orch.add(Lambda::blueprint_with_id(id("p2"), |args| args[0]), &ctx_b)
            .await
            .expect("add p2");
        orch.connect(&id("p1"), &id("p2"), None).await.expect("link");

        orch.destroy_context(&ctx_b).await.expect("destroy ctx_b");
        assert!(!orch.has_node(&id("p2")));
        assert_eq!(orch.subscription_count(), 0);
        assert_eq!(orch.publication_count(), 0);
        assert!(orch.has_node(&id("p1")));

        orch.shutdown();
    });
}
