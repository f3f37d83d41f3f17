//! Bus behaviour over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use remote_agent::bus::{ConnectionRegistry, Role, ServiceWorker, Subscriber};
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn collecting_subscriber(
    registry: &Arc<ConnectionRegistry>,
    endpoint: &str,
    topic: &str,
) -> (Subscriber<String>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subscriber = Subscriber::connect(registry, endpoint, topic).unwrap();
    subscriber
        .subscribe(move |message: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .unwrap();
    (subscriber, rx)
}

#[tokio::test]
async fn enqueued_messages_arrive_in_order() {
    let registry = ConnectionRegistry::new();
    let mut worker = ServiceWorker::<String>::start(&registry, "tcp://127.0.0.1:0", "jobs", 8).unwrap();

    let remote = ConnectionRegistry::new();
    let (mut subscriber, mut rx) = collecting_subscriber(&remote, &worker.local_endpoint(), "jobs");
    wait_for(|| worker.peer_count() == 1).await;

    // More messages than the queue holds, so producers also block.
    const N: usize = 50;
    for i in 0..N {
        worker.enqueue(format!("job-{i}")).await.unwrap();
    }
    worker.stop().await;

    for i in 0..N {
        let received = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, format!("job-{i}"));
    }
    subscriber.stop().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn slow_handler_still_sees_every_message() {
    let registry = ConnectionRegistry::new();
    let mut worker =
        ServiceWorker::<String>::start(&registry, "tcp://127.0.0.1:0", "task_recv", 4096).unwrap();

    let remote = ConnectionRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriber = Subscriber::connect(&remote, &worker.local_endpoint(), "task_recv").unwrap();
    subscriber
        .subscribe(move |message: String| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let _ = tx.send(message);
            }
        })
        .unwrap();
    wait_for(|| worker.peer_count() == 1).await;

    // Far more than any in-flight buffer on the way.
    const N: usize = 2000;
    for i in 0..N {
        worker.enqueue(format!("job-{i}")).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(60), worker.stop())
        .await
        .unwrap();

    for i in 0..N {
        let received = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, format!("job-{i}"));
    }
    subscriber.stop().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn topics_share_one_endpoint() {
    let registry = ConnectionRegistry::new();
    let configured = "tcp://127.0.0.1:0";
    let mut builds = ServiceWorker::<String>::start(&registry, configured, "builds", 8).unwrap();
    let mut deploys = ServiceWorker::<String>::start(&registry, configured, "deploys", 8).unwrap();
    assert_eq!(registry.ref_count(configured, Role::Publisher), 2);
    let endpoint = builds.local_endpoint();
    assert_eq!(endpoint, deploys.local_endpoint());

    let remote = ConnectionRegistry::new();
    let (mut sub, mut rx) = collecting_subscriber(&remote, &endpoint, "deploys");
    wait_for(|| builds.peer_count() == 1).await;

    builds.enqueue("b1".into()).await.unwrap();
    deploys.enqueue("d1".into()).await.unwrap();
    builds.enqueue("b2".into()).await.unwrap();

    let received = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "d1");

    builds.stop().await;
    deploys.stop().await;
    sub.stop().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn wildcard_endpoint_is_dialed_on_loopback() {
    let registry = ConnectionRegistry::new();
    let mut worker = ServiceWorker::<String>::start(&registry, "tcp://0.0.0.0:0", "jobs", 8).unwrap();
    let bound = worker.local_endpoint();
    let port = bound.rsplit(':').next().unwrap();

    let remote = ConnectionRegistry::new();
    let (mut sub, mut rx) = collecting_subscriber(&remote, &format!("tcp://*:{port}"), "jobs");
    assert_eq!(sub.endpoint(), format!("tcp://127.0.0.1:{port}"));
    wait_for(|| worker.peer_count() == 1).await;

    worker.enqueue("hello".into()).await.unwrap();
    let received = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "hello");

    worker.stop().await;
    sub.stop().await;
}

#[tokio::test]
async fn stopping_everything_empties_the_registry() {
    let registry = ConnectionRegistry::new();
    let mut worker = ServiceWorker::<String>::start(&registry, "tcp://127.0.0.1:0", "jobs", 8).unwrap();
    let (mut sub, _rx) = collecting_subscriber(&registry, &worker.local_endpoint(), "jobs");
    assert_eq!(registry.len(), 2);

    sub.stop().await;
    worker.stop().await;
    drop(sub);
    drop(worker);
    assert!(registry.is_empty());
}
