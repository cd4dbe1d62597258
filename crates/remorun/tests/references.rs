//! Runner references: clones, nested results and runners as arguments.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use remorun::DisconnectReason;
use remorun::Error;
use remorun::RunnerValue;
use remorun::StrategyKind;

use common::Calc;
use common::STRATEGIES;
use common::calc;
use common::eventually;
use common::link;
use common::wait_closed;

fn ints(values: &[i64]) -> Vec<RunnerValue> {
    values
        .iter()
        .map(|v| RunnerValue::json(v).expect("json"))
        .collect()
}

#[tokio::test]
async fn test_clones_share_the_instance() {
    for strategy in STRATEGIES {
        let link = link(strategy).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let y = x.clone_control().await.expect("clone");

        x.disconnect().await.expect("disconnect");
        x.disconnect().await.expect("disconnect is idempotent");
        assert_eq!(x.closed_reason(), Some(DisconnectReason::RunnerDisconnected));

        let sum: i64 = y.call_json("add", (4, 4)).await.expect("clone survives");
        assert_eq!(sum, 8);
        assert_eq!(link.destroyed(), 0);

        let z = y.clone_control().await.expect("clone of clone");
        y.destroy().await.expect("destroy");
        wait_closed(&z).await;
        assert_eq!(z.closed_reason(), Some(DisconnectReason::RunnerDestroyed));
        assert_eq!(link.destroyed(), 1);
        eventually(|| link.host.hosted_count() == 0).await;
    }
}

#[tokio::test]
async fn test_last_disconnect_destroys_the_instance() {
    let link = link(StrategyKind::MessageChannel).await;
    let x = link
        .client
        .resolve(&calc(link.destroyed.clone()), vec![])
        .await
        .expect("resolve");
    let y = x.clone_control().await.expect("clone");

    x.disconnect().await.expect("disconnect");
    assert_eq!(link.destroyed(), 0);
    y.disconnect().await.expect("disconnect");
    eventually(|| link.destroyed() == 1).await;
}

#[tokio::test]
async fn test_methods_can_return_runners() {
    for strategy in STRATEGIES {
        let link = link(strategy).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");

        let child = x
            .call("child", vec![])
            .await
            .expect("child")
            .into_runner()
            .expect("a runner");
        assert_eq!(child.token().as_str(), "Calc");
        let sum: i64 = child.call_json("add", (10, 5)).await.expect("child add");
        assert_eq!(sum, 15);

        let children = x.call("children", vec![]).await.expect("children");
        let RunnerValue::Array(items) = children else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), 2);
        assert!(items[0].as_runner().is_some());
        assert_eq!(items[1].as_json(), Some(&serde_json::json!("tag")));

        let nested = items[0].as_runner().expect("runner");
        let sum: i64 = nested.call_json("add", (1, 2)).await.expect("nested add");
        assert_eq!(sum, 3);

        child.destroy().await.expect("destroy child");
        eventually(|| link.destroyed() == 1).await;
        let sum: i64 = x.call_json("add", (1, 1)).await.expect("parent unaffected");
        assert_eq!(sum, 2);
    }
}

#[tokio::test]
async fn test_proxy_as_argument_is_cloned() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let y = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");

        let mut args = vec![RunnerValue::Runner(y.clone())];
        args.extend(ints(&[2, 3]));
        let scaled = x.call("apply", args).await.expect("apply");
        assert_eq!(scaled.parse::<i64>().expect("int"), 50, "strategy {}", strategy);

        assert!(!y.is_closed());
        let sum: i64 = y.call_json("add", (1, 2)).await.expect("y still works");
        assert_eq!(sum, 3);

        // Releasing x releases its copy of y, not y itself.
        x.destroy().await.expect("destroy x");
        eventually(|| link.destroyed() == 1).await;
        let sum: i64 = y.call_json("add", (2, 2)).await.expect("y outlives x");
        assert_eq!(sum, 4);
        let sum: i64 = y.call_json("add", (3, 3)).await.expect("y still served");
        assert_eq!(sum, 6);
    }
}

#[tokio::test]
async fn test_received_proxy_can_be_returned() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let y = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");

        let z = x
            .call("echo", vec![RunnerValue::Runner(y.clone())])
            .await
            .expect("echo")
            .into_runner()
            .expect("a runner");
        assert_eq!(z.token().as_str(), "Calc");
        let sum: i64 = z.call_json("add", (2, 2)).await.expect("returned proxy works");
        assert_eq!(sum, 4, "strategy {}", strategy);
        let sum: i64 = z.call_json("add", (5, 2)).await.expect("and keeps working");
        assert_eq!(sum, 7);

        z.disconnect().await.expect("disconnect");
        assert_eq!(link.destroyed(), 0);
        x.destroy().await.expect("destroy x");
        eventually(|| link.destroyed() == 1).await;

        let sum: i64 = y.call_json("add", (3, 3)).await.expect("y survives");
        assert_eq!(sum, 6);
        y.destroy().await.expect("destroy y");
        eventually(|| link.destroyed() == 2).await;
        eventually(|| link.host.hosted_count() == 0).await;
    }
}

#[tokio::test]
async fn test_marked_proxy_moves_its_link() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let y = x.clone_control().await.expect("clone");

        let moved = y.clone().mark_for_transfer();
        let mut args = vec![RunnerValue::Runner(moved)];
        args.extend(ints(&[2, 3]));
        let scaled: i64 = x.call("apply", args).await.expect("apply").parse().expect("int");
        assert_eq!(scaled, 50, "strategy {}", strategy);

        assert_eq!(y.closed_reason(), Some(DisconnectReason::RunnerTransferred));
        let err = y.call("add", ints(&[1, 1])).await.expect_err("moved away");
        assert_eq!(err.disconnect_reason(), Some(DisconnectReason::RunnerTransferred));
        assert_eq!(link.destroyed(), 0);
    }
}

#[tokio::test]
async fn test_failed_method_releases_received_runners() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");

        let lent = Arc::new(AtomicUsize::new(0));
        let local = calc(lent.clone()).local(Calc::new(lent.clone()));
        let err = x
            .call("fail", vec![RunnerValue::Local(local)])
            .await
            .expect_err("method fails");
        assert!(matches!(err, Error::RunnerExecute(_)), "{:?}", err);

        // The host let go of the argument, which was its only holder.
        eventually(|| lent.load(Ordering::SeqCst) == 1).await;
        eventually(|| link.client.hosted_count() == 0).await;
        let sum: i64 = x.call_json("add", (1, 1)).await.expect("x unaffected");
        assert_eq!(sum, 2, "strategy {}", strategy);
    }
}

#[tokio::test]
async fn test_failed_constructor_releases_received_runners() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let lent = Arc::new(AtomicUsize::new(0));
        let local = calc(lent.clone()).local(Calc::new(lent.clone()));

        let args = vec![RunnerValue::json("explode").expect("json"), RunnerValue::Local(local)];
        let err = link
            .client
            .resolve(&calc(link.destroyed.clone()), args)
            .await
            .expect_err("constructor fails");
        assert!(matches!(err, Error::RunnerInit(_)), "{:?}", err);

        eventually(|| link.client.hosted_count() == 0).await;
        eventually(|| link.host.hosted_count() == 0).await;
        assert_eq!(link.destroyed(), 0, "strategy {}", strategy);
    }
}

#[tokio::test]
async fn test_failed_argument_batch_is_undone() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let y = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        let gone = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");
        gone.disconnect().await.expect("disconnect");
        eventually(|| link.destroyed() == 1).await;

        let lent = Arc::new(AtomicUsize::new(0));
        let local = calc(lent.clone()).local(Calc::new(lent.clone()));
        let args = vec![
            RunnerValue::Runner(y.clone()),
            RunnerValue::Local(local),
            RunnerValue::Runner(gone),
        ];
        let err = x.call("echo", args).await.expect_err("one argument cannot move");
        assert!(matches!(err, Error::DataTransfer(_)), "{:?}", err);

        // The exposed runner was withdrawn without running its destructor,
        // and the link prepared for y was released without touching y.
        eventually(|| link.client.hosted_count() == 0).await;
        assert_eq!(lent.load(Ordering::SeqCst), 0);
        let sum: i64 = y.call_json("add", (4, 1)).await.expect("y unaffected");
        assert_eq!(sum, 5, "strategy {}", strategy);
        let sum: i64 = x.call_json("add", (4, 2)).await.expect("x unaffected");
        assert_eq!(sum, 6);
        assert_eq!(link.destroyed(), 1);
    }
}

#[tokio::test]
async fn test_local_runner_as_argument() {
    for strategy in STRATEGIES {
        let link = link(strategy.clone()).await;
        let x = link
            .client
            .resolve(&calc(link.destroyed.clone()), vec![])
            .await
            .expect("resolve");

        let lent = Arc::new(AtomicUsize::new(0));
        let local = calc(lent.clone()).local(Calc::new(lent.clone()));
        let mut args = vec![RunnerValue::Local(local)];
        args.extend(ints(&[4, 5]));
        let scaled: i64 = x.call("apply", args).await.expect("apply").parse().expect("int");
        assert_eq!(scaled, 90, "strategy {}", strategy);
        assert_eq!(link.client.hosted_count(), 1);

        // The host keeps its reference until its own runner goes away.
        x.destroy().await.expect("destroy");
        eventually(|| lent.load(Ordering::SeqCst) == 1).await;
        eventually(|| link.client.hosted_count() == 0).await;
    }
}
