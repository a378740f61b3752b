//! End-to-end tests of the mesh over the embedded broker

use std::sync::Arc;
use std::time::Duration;

use mesh_broker::{Broker, BrokerClient, InMemoryBroker, InMemoryBrokerConfig, SubscriptionMode};
use mesh_common::{ApprovalStatus, Record};
use mesh_router::{
    Destination, DisplaySink, MeshConfig, MeshRuntime, RouterError, RunMode, Selector, Shutdown, Throttle,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(10);

fn broker(nack_redelivery_delay: Duration) -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
        nack_redelivery_delay,
        ..Default::default()
    }))
}

fn config(originator_interval: Duration) -> Arc<MeshConfig> {
    Arc::new(MeshConfig {
        originator_interval,
        relay_interval: Duration::from_millis(1),
        ..Default::default()
    })
}

fn records(broker: &InMemoryBroker, topic: &str) -> Vec<Record> {
    broker
        .retained(topic)
        .iter()
        .filter_map(|m| serde_json::from_slice(&m.payload).ok())
        .collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct CollectingSink {
    rendered: Mutex<Vec<String>>,
}

impl DisplaySink for CollectingSink {
    fn display(&self, rendered: &str) {
        self.rendered.lock().push(rendered.to_string());
    }
}

#[tokio::test]
async fn test_odd_round_trip_is_rejected_and_acknowledged() {
    let broker = broker(Duration::from_secs(60));
    // One send, then a long pause
    let config = config(Duration::from_secs(3600));
    let orig_1 = config.topics.origin_1.clone();

    let runtime = MeshRuntime::start(broker.clone(), config.clone(), RunMode::Mesh, Arc::new(CollectingSink::default()));

    wait_until(|| !records(&broker, &orig_1).is_empty()).await;
    let reply = &records(&broker, &orig_1)[0];
    assert_eq!(reply.id, 1);
    assert_eq!(reply.approval_status, ApprovalStatus::Rejected);

    let subscription = config.subscription_name("originator");
    wait_until(|| broker.backlog(&orig_1, &subscription) == 0 && broker.unacked(&orig_1, &subscription) == 0).await;

    // The request travelled through the first destination only
    let dest_1 = records(&broker, &config.topics.destination_1);
    assert_eq!(dest_1.len(), 1);
    assert_eq!(dest_1[0].id, 1);
    assert_eq!(dest_1[0].approval_status, ApprovalStatus::Pending);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_parity_streams_and_alternation() {
    let broker = broker(Duration::from_secs(60));
    let config = config(Duration::from_millis(10));
    let (orig_1, orig_2) = (config.topics.origin_1.clone(), config.topics.origin_2.clone());

    let runtime = MeshRuntime::start(broker.clone(), config.clone(), RunMode::Mesh, Arc::new(CollectingSink::default()));
    wait_until(|| records(&broker, &orig_1).len() >= 4 && records(&broker, &orig_2).len() >= 4).await;
    runtime.shutdown().await;

    let odd = records(&broker, &orig_1);
    let even = records(&broker, &orig_2);
    assert!(odd.iter().all(|r| r.id % 2 == 1));
    assert!(even.iter().all(|r| r.id % 2 == 0));
    assert_eq!(odd.iter().map(|r| r.id).take(3).collect::<Vec<_>>(), vec![1, 3, 5]);
    assert_eq!(even.iter().map(|r| r.id).take(3).collect::<Vec<_>>(), vec![2, 4, 6]);

    // Each destination serves one parity class, so each stream alternates on its own
    for stream in [&odd, &even] {
        for (position, record) in stream.iter().enumerate() {
            let expected = if position % 2 == 0 {
                ApprovalStatus::Rejected
            } else {
                ApprovalStatus::Approved
            };
            assert_eq!(record.approval_status, expected, "record {}", record.id);
        }
    }

    // The two originators carry distinct labels
    assert_ne!(odd[0].label, even[0].label);
}

#[tokio::test]
async fn test_fault_before_flip_keeps_alternation() {
    let broker = broker(Duration::from_secs(3600));
    let config = config(Duration::from_secs(1));
    let topic = "persistent://public/default/fault-dest";

    let publisher = BrokerClient::open(broker.as_ref(), "publisher").await.unwrap();
    let garbage = publisher.create_producer::<String>(topic).await.unwrap();
    let requests = publisher.create_producer::<Record>(topic).await.unwrap();
    garbage.send_async("mesh-key", &"not a record".to_string(), |_| {});
    wait_until(|| broker.retained(topic).len() == 1).await;
    requests.send_async("mesh-key", &Record::new(1, "LBL", vec![]), |_| {});
    requests.send_async("mesh-key", &Record::new(3, "LBL", vec![]), |_| {});
    wait_until(|| broker.retained(topic).len() == 3).await;

    let shutdown = Shutdown::new();
    let mut destination = Destination::new(
        broker.clone(),
        config.clone(),
        Throttle::new(Duration::from_millis(1), shutdown.clone()),
    );
    let task = tokio::spawn(async move { destination.process(topic).await });

    let select_origin = config.topics.select_origin.clone();
    wait_until(|| records(&broker, &select_origin).len() == 2).await;
    shutdown.trigger();
    task.await.unwrap().unwrap();

    let replies = records(&broker, &select_origin);
    assert_eq!(replies[0].id, 1);
    assert_eq!(replies[0].approval_status, ApprovalStatus::Rejected);
    assert_eq!(replies[1].id, 3);
    assert_eq!(replies[1].approval_status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_selector_routes_redelivery_the_same_way() {
    let broker = broker(Duration::ZERO);
    let config = config(Duration::from_secs(1));
    let source = "persistent://public/default/route-src";
    let (target_1, target_2) = ("route-one", "route-two");
    let subscription = config.subscription_name("selector");

    let publisher = BrokerClient::open(broker.as_ref(), "publisher").await.unwrap();
    let requests = publisher.create_producer::<Record>(source).await.unwrap();
    requests.send_async("mesh-key", &Record::new(7, "LBL", vec![]), |_| {});
    requests.send_async("mesh-key", &Record::new(8, "LBL", vec![]), |_| {});
    wait_until(|| broker.retained(source).len() == 2).await;

    // A previous selector instance receives record 7 and fails it
    {
        let connection = broker.connect().await.unwrap();
        let consumer = connection
            .subscribe(source, &subscription, SubscriptionMode::Failover)
            .await
            .unwrap();
        let first = connection.receive(consumer).await.unwrap();
        connection.negative_acknowledge(consumer, first.message_id).unwrap();
        connection.close();
    }

    let shutdown = Shutdown::new();
    let selector = Selector::new(
        broker.clone(),
        config.clone(),
        Throttle::new(Duration::from_millis(1), shutdown.clone()),
    );
    let task = tokio::spawn(async move { selector.process(source, target_1, target_2).await });

    wait_until(|| !records(&broker, target_1).is_empty() && !records(&broker, target_2).is_empty()).await;
    shutdown.trigger();
    task.await.unwrap().unwrap();

    let one = records(&broker, target_1);
    let two = records(&broker, target_2);
    assert_eq!(one.iter().map(|r| r.id).collect::<Vec<_>>(), vec![7]);
    assert_eq!(two.iter().map(|r| r.id).collect::<Vec<_>>(), vec![8]);
    assert_eq!(one[0].approval_status, ApprovalStatus::Pending);
    assert_eq!(broker.unacked(source, &subscription), 0);
}

#[tokio::test]
async fn test_second_destination_on_same_topic_fails_setup() {
    let broker = broker(Duration::from_secs(60));
    let config = config(Duration::from_secs(1));
    let shutdown = Shutdown::new();
    let topic = config.topics.destination_1.clone();

    let mut first = Destination::new(broker.clone(), config.clone(), Throttle::new(Duration::from_millis(1), shutdown.clone()));
    let first_topic = topic.clone();
    let running = tokio::spawn(async move { first.process(&first_topic).await });

    // Once a reply comes back the first destination holds the subscription
    let publisher = BrokerClient::open(broker.as_ref(), "publisher").await.unwrap();
    let requests = publisher.create_producer::<Record>(&topic).await.unwrap();
    requests.send_async("mesh-key", &Record::new(1, "LBL", vec![]), |_| {});
    let select_origin = config.topics.select_origin.clone();
    wait_until(|| records(&broker, &select_origin).len() == 1).await;

    let mut second = Destination::new(broker.clone(), config.clone(), Throttle::new(Duration::from_millis(1), shutdown.clone()));
    let result = tokio::time::timeout(WAIT, second.process(&topic)).await.unwrap();
    assert!(matches!(result, Err(RouterError::Setup { role: "destination", .. })));

    shutdown.trigger();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_all_mode_reports_mesh_traffic() {
    let broker = broker(Duration::from_secs(60));
    let config = config(Duration::from_millis(20));
    let sink = Arc::new(CollectingSink::default());

    let runtime = MeshRuntime::start(broker.clone(), config.clone(), RunMode::All, sink.clone());
    let orig_1 = config.topics.origin_1.clone();
    wait_until(|| {
        sink.rendered
            .lock()
            .iter()
            .any(|r| r.contains(&format!("topic[{}]", orig_1)))
    })
    .await;
    runtime.shutdown().await;

    let rendered = sink.rendered.lock();
    assert!(rendered.iter().any(|r| r.contains("approvalStatus[REJECTED]")));
    assert!(rendered.iter().any(|r| r.contains("approvalStatus[PENDING]")));
}
