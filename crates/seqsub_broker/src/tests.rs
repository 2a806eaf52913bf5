use std::sync::Arc;
use std::time::{Duration, Instant};

use seqsub_bus::memory::MemoryBus;
use seqsub_bus::{Bus, BusMessage, BusSubscription};
use seqsub_store::{memory::MemoryStore, open_store, Store, StoreLimits, TYPE_FILE};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::protocol::*;
use crate::{Broker, BrokerOptions};

const CLIENT_NAME: &str = "me";

fn test_opts() -> BrokerOptions {
    BrokerOptions {
        cluster_id: "test-cluster".to_string(),
        discover_prefix: "_SEQSUB.discover".to_string(),
        // long interval so the loop stays out of the way unless a test
        // tightens it
        hb_interval: Duration::from_secs(60),
        hb_timeout: Duration::from_millis(100),
        max_failed_hbs: 10,
        dup_cid_timeout: Duration::from_millis(250),
        dup_cid_max_checks: 100,
    }
}

fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new(StoreLimits::default()))
}

fn limited_store(limits: StoreLimits) -> Arc<dyn Store> {
    Arc::new(MemoryStore::new(limits))
}

fn start_broker(opts: BrokerOptions, store: Arc<dyn Store>) -> (MemoryBus, Arc<Broker>) {
    let bus = MemoryBus::new();
    let srv = Broker::start(opts, Arc::new(bus.clone()), store).expect("broker should start");
    (bus, srv)
}

#[derive(Debug)]
struct TestSub {
    ack_inbox: String,
    rx: mpsc::UnboundedReceiver<MsgProto>,
    _inbox_sub: BusSubscription,
}

impl TestSub {
    async fn next(&mut self, ms: u64) -> Option<MsgProto> {
        timeout(Duration::from_millis(ms), self.rx.recv()).await.ok().flatten()
    }

    /// Receive until a redelivered frame shows up.
    async fn next_redelivered(&mut self, ms: u64) -> Option<MsgProto> {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match timeout(deadline - now, self.rx.recv()).await {
                Ok(Some(msg)) if msg.redelivered => return Some(msg),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }
}

#[derive(Debug)]
struct TestClient {
    bus: MemoryBus,
    id: String,
    info: ConnectResponse,
    hb_sub: Option<BusSubscription>,
}

impl TestClient {
    async fn connect(bus: &MemoryBus, id: &str) -> Result<TestClient, String> {
        let hb_inbox = bus.new_inbox();
        let responder = bus.clone();
        let hb_sub = bus
            .subscribe(
                &hb_inbox,
                Arc::new(move |msg: BusMessage| {
                    let responder = responder.clone();
                    Box::pin(async move {
                        if let Some(reply) = msg.reply {
                            responder.publish(&reply, Vec::new());
                        }
                    })
                }),
            )
            .map_err(|e| e.to_string())?;

        let req = ConnectRequest {
            client_id: id.to_string(),
            heartbeat_inbox: hb_inbox,
        };
        let resp = bus
            .request(
                "_SEQSUB.discover.test-cluster",
                encode(&req),
                Duration::from_secs(3),
            )
            .await
            .map_err(|e| e.to_string())?;
        let info: ConnectResponse = decode(&resp.payload).map_err(|e| e.to_string())?;
        if !info.error.is_empty() {
            return Err(info.error);
        }
        Ok(TestClient {
            bus: bus.clone(),
            id: id.to_string(),
            info,
            hb_sub: Some(hb_sub),
        })
    }

    /// Simulate a crashed process: stop answering heartbeats.
    fn kill_connection(&mut self) {
        self.hb_sub = None;
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), String> {
        let req = PubMsg {
            client_id: self.id.clone(),
            guid: Uuid::new_v4().simple().to_string(),
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        let subject = format!("{}.{}", self.info.pub_prefix, channel);
        let resp = self
            .bus
            .request(&subject, encode(&req), Duration::from_secs(3))
            .await
            .map_err(|e| e.to_string())?;
        let ack: PubAck = decode(&resp.payload).map_err(|e| e.to_string())?;
        if !ack.error.is_empty() {
            return Err(ack.error);
        }
        assert_eq!(ack.guid, req.guid, "pub ack must echo the guid");
        Ok(())
    }

    fn sub_req(&self, channel: &str) -> SubscriptionRequest {
        SubscriptionRequest {
            client_id: self.id.clone(),
            channel: channel.to_string(),
            max_in_flight: 1024,
            ack_wait_secs: 30,
            start_position: StartPosition::NewOnly,
            ..SubscriptionRequest::default()
        }
    }

    async fn subscribe(&self, mut req: SubscriptionRequest) -> Result<TestSub, String> {
        let inbox = self.bus.new_inbox();
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox_sub = self
            .bus
            .subscribe(
                &inbox,
                Arc::new(move |msg: BusMessage| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        if let Ok(frame) = decode::<MsgProto>(&msg.payload) {
                            let _ = tx.send(frame);
                        }
                    })
                }),
            )
            .map_err(|e| e.to_string())?;
        req.inbox = inbox;
        let resp = self
            .bus
            .request(&self.info.sub_requests, encode(&req), Duration::from_secs(3))
            .await
            .map_err(|e| e.to_string())?;
        let sr: SubscriptionResponse = decode(&resp.payload).map_err(|e| e.to_string())?;
        if !sr.error.is_empty() {
            return Err(sr.error);
        }
        Ok(TestSub {
            ack_inbox: sr.ack_inbox,
            rx,
            _inbox_sub: inbox_sub,
        })
    }

    fn ack(&self, sub: &TestSub, channel: &str, sequence: u64) {
        let ack = AckProto {
            channel: channel.to_string(),
            sequence,
        };
        self.bus.publish(&sub.ack_inbox, encode(&ack));
    }

    async fn unsubscribe(&self, channel: &str, ack_inbox: &str) -> Result<(), String> {
        let req = UnsubscribeRequest {
            client_id: self.id.clone(),
            channel: channel.to_string(),
            ack_inbox: ack_inbox.to_string(),
        };
        let resp = self
            .bus
            .request(&self.info.unsub_requests, encode(&req), Duration::from_secs(3))
            .await
            .map_err(|e| e.to_string())?;
        let sr: SubscriptionResponse = decode(&resp.payload).map_err(|e| e.to_string())?;
        if sr.error.is_empty() { Ok(()) } else { Err(sr.error) }
    }

    async fn close(&self) -> Result<(), String> {
        let req = CloseRequest {
            client_id: self.id.clone(),
        };
        let resp = self
            .bus
            .request(&self.info.close_requests, encode(&req), Duration::from_secs(3))
            .await
            .map_err(|e| e.to_string())?;
        let cr: CloseResponse = decode(&resp.payload).map_err(|e| e.to_string())?;
        if cr.error.is_empty() { Ok(()) } else { Err(cr.error) }
    }
}

async fn wait_until<F: Fn() -> bool>(ms: u64, cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

// ---- lifecycle ------------------------------------------------------

#[tokio::test]
async fn double_shutdown_is_idempotent() {
    let (_bus, srv) = start_broker(test_opts(), memory_store());
    srv.shutdown();
    srv.shutdown();
    assert!(srv.is_shutdown());
}

#[tokio::test]
async fn invalid_requests_get_typed_errors() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let info = srv.info().clone();

    async fn expect_error(bus: &MemoryBus, subject: &str, expected: &str) {
        let resp = bus
            .request(subject, b"dummy".to_vec(), Duration::from_secs(1))
            .await
            .expect("should get an in-band error reply");
        let text = String::from_utf8_lossy(&resp.payload).to_string();
        assert!(
            text.contains(expected),
            "reply on {subject} should carry {expected:?}, got {text}"
        );
    }

    expect_error(&bus, &info.discover, "invalid connect request").await;
    expect_error(&bus, &format!("{}.foo", info.publish), "invalid publish request").await;
    expect_error(&bus, &info.subscribe, "invalid subscribe request").await;
    expect_error(&bus, &info.unsubscribe, "invalid unsubscribe request").await;
    expect_error(&bus, &info.close, "invalid close request").await;
    srv.shutdown();
}

#[tokio::test]
async fn client_id_character_rule() {
    let (bus, srv) = start_broker(test_opts(), memory_store());

    for bad in [
        "id with spaces",
        "id.with.dots",
        "id,with,commas",
        "id:with:colons",
        "id!@#$%",
    ] {
        let err = TestClient::connect(&bus, bad).await.unwrap_err();
        assert_eq!(err, "invalid client id", "id {bad:?}");
    }
    for good in ["me", "client-1", "under_score"] {
        let client = TestClient::connect(&bus, good).await.expect("valid id");
        client.close().await.unwrap();
    }
    assert_eq!(srv.clients().count(), 0);
    srv.shutdown();
}

#[tokio::test]
async fn connect_hands_out_control_subjects() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    assert_eq!(client.info.pub_prefix, srv.info().publish);
    assert_eq!(client.info.sub_requests, srv.info().subscribe);
    assert_eq!(client.info.unsub_requests, srv.info().unsubscribe);
    assert_eq!(client.info.close_requests, srv.info().close);
    srv.shutdown();
}

// ---- subscribe validation ------------------------------------------

#[tokio::test]
async fn invalid_subscribe_requests() {
    let (bus, srv) = start_broker(test_opts(), memory_store());

    // a bare, unregistered requester
    let ghost = TestClient {
        bus: bus.clone(),
        id: CLIENT_NAME.to_string(),
        info: ConnectResponse {
            sub_requests: srv.info().subscribe.clone(),
            ..ConnectResponse::default()
        },
        hb_sub: None,
    };

    let mut req = ghost.sub_req("");
    assert_eq!(ghost.subscribe(req).await.unwrap_err(), "invalid channel");

    for subject in ["foo*.bar", "foo.bar*", "foo.>.*"] {
        req = ghost.sub_req(subject);
        assert_eq!(ghost.subscribe(req).await.unwrap_err(), "invalid channel");
    }

    req = ghost.sub_req("foo");
    req.ack_wait_secs = 0;
    assert_eq!(ghost.subscribe(req).await.unwrap_err(), "invalid ack wait time");

    req = ghost.sub_req("foo");
    req.max_in_flight = 0;
    assert_eq!(
        ghost.subscribe(req).await.unwrap_err(),
        "invalid max inflight value"
    );

    // well-formed, but the client never connected
    req = ghost.sub_req("foo");
    assert_eq!(ghost.subscribe(req).await.unwrap_err(), "unknown client id");

    // failed subscribes still created the channel
    assert!(srv.channels().get("foo").is_some());
    assert_eq!(srv.clients().count(), 0);

    // now with a registered client
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    req = client.sub_req("foo");
    req.start_position = StartPosition::SequenceStart;
    req.start_sequence = 100;
    assert_eq!(
        client.subscribe(req).await.unwrap_err(),
        "unknown start sequence"
    );

    req = client.sub_req("foo");
    req.start_position = StartPosition::TimeDeltaStart;
    req.start_time_delta_ms = 10_000;
    assert_eq!(client.subscribe(req).await.unwrap_err(), "unknown start time");

    // reserved separator in durable / queue names
    req = client.sub_req("foo");
    req.durable_name = "du:r".to_string();
    assert_eq!(
        client.subscribe(req).await.unwrap_err(),
        "invalid subscribe request"
    );

    req = client.sub_req("foo");
    req.queue_group = "gro:up".to_string();
    assert_eq!(
        client.subscribe(req).await.unwrap_err(),
        "invalid subscribe request"
    );

    srv.shutdown();
}

#[tokio::test]
async fn invalid_unsubscribe_requests() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let sub = client.subscribe(client.sub_req("foo")).await.unwrap();

    // missing fields
    assert_eq!(
        client.unsubscribe("", "").await.unwrap_err(),
        "invalid unsubscribe request"
    );
    // channel that has no subscriptions
    assert_eq!(
        client.unsubscribe("bar", &sub.ack_inbox).await.unwrap_err(),
        "unknown subscription"
    );
    // wrong ack inbox
    assert_eq!(
        client.unsubscribe("foo", "wrong").await.unwrap_err(),
        "unknown subscription"
    );
    // right inbox, different registered client
    let thief = TestClient::connect(&bus, "thief").await.unwrap();
    assert_eq!(
        thief.unsubscribe("foo", &sub.ack_inbox).await.unwrap_err(),
        "subscription not owned by client"
    );

    // and the real owner succeeds
    client.unsubscribe("foo", &sub.ack_inbox).await.unwrap();
    assert!(wait_until(1000, || srv.clients().get_subs(CLIENT_NAME).is_empty()).await);
    srv.shutdown();
}

// ---- duplicate client ids ------------------------------------------

#[tokio::test]
async fn duplicate_client_id_rejected_while_alive() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let _c1 = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let err = TestClient::connect(&bus, CLIENT_NAME).await.unwrap_err();
    assert_eq!(err, "client id already registered");
    assert_eq!(srv.clients().count(), 1);
    srv.shutdown();
}

#[tokio::test]
async fn dup_cid_takeover_after_connection_loss() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let mut c1 = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    // while c1 answers heartbeats, the duplicate loses
    assert_eq!(
        TestClient::connect(&bus, CLIENT_NAME).await.unwrap_err(),
        "client id already registered"
    );

    c1.kill_connection();

    let start = Instant::now();
    let _c2 = TestClient::connect(&bus, CLIENT_NAME)
        .await
        .expect("takeover should succeed once the old client is silent");
    let took = start.elapsed();
    assert!(took < Duration::from_secs(5), "takeover took {took:?}");
    assert_eq!(srv.clients().count(), 1);
    srv.shutdown();
}

#[tokio::test]
async fn dup_cid_arbitration_is_bounded() {
    let mut opts = test_opts();
    opts.dup_cid_timeout = Duration::from_millis(250);
    opts.dup_cid_max_checks = 2;
    let (bus, srv) = start_broker(opts, memory_store());

    // three clients whose connections die
    for i in 0..3 {
        let mut client = TestClient::connect(&bus, &format!("dup_{i}")).await.unwrap();
        client.kill_connection();
    }

    // reconnect all three at once: two arbitrate immediately (~timeout),
    // the third waits for a slot (~2x timeout)
    let reconnect = |i: usize| {
        let bus = bus.clone();
        async move {
            let start = Instant::now();
            TestClient::connect(&bus, &format!("dup_{i}"))
                .await
                .expect("reconnect should win against a dead client");
            start.elapsed()
        }
    };
    let (a, b, c) = tokio::join!(reconnect(0), reconnect(1), reconnect(2));

    let mut durations = [a, b, c];
    durations.sort();
    assert!(
        durations[0] >= Duration::from_millis(200),
        "arbitration must probe for the full timeout, took {durations:?}"
    );
    assert!(
        durations[2] >= Duration::from_millis(400),
        "third arbitration should have queued for a slot, took {durations:?}"
    );
    assert!(
        durations[2] < Duration::from_millis(1500),
        "queued arbitration took too long: {durations:?}"
    );

    // a concurrent duplicate of an id already under arbitration fails fast
    let mut victim = TestClient::connect(&bus, "contested").await.unwrap();
    victim.kill_connection();
    let bus2 = bus.clone();
    let slow = tokio::spawn(async move { TestClient::connect(&bus2, "contested").await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    let start = Instant::now();
    let err = TestClient::connect(&bus, "contested").await.unwrap_err();
    assert_eq!(err, "client id already registered");
    assert!(start.elapsed() < Duration::from_millis(200), "same-id dup must fail fast");
    slow.await.unwrap().expect("first arbitration should win");

    srv.shutdown();
}

// ---- delivery, acks, redelivery ------------------------------------

#[tokio::test]
async fn publish_delivers_and_ack_clears_in_flight() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut sub = client.subscribe(client.sub_req("foo")).await.unwrap();

    client.publish("foo", b"hello").await.unwrap();
    let msg = sub.next(2000).await.expect("message should arrive");
    assert_eq!(msg.sequence, 1);
    assert_eq!(msg.payload, b"hello".to_vec());
    assert!(!msg.redelivered);
    assert!(msg.timestamp > 0);

    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert_eq!(subs.len(), 1);
    assert!(wait_until(1000, || subs[0].state().acks_pending.len() == 1).await);

    client.ack(&sub, "foo", 1);
    assert!(wait_until(1000, || subs[0].state().acks_pending.is_empty()).await);
    assert!(subs[0].state().ack_timer.is_none());
    srv.shutdown();
}

#[tokio::test]
async fn redelivery_until_acked() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut req = client.sub_req("foo");
    req.ack_wait_secs = 1;
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.publish("foo", b"hello").await.unwrap();

    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert_eq!(subs.len(), 1);
    assert!(wait_until(1000, || subs[0].state().acks_pending.len() == 2).await);
    assert!(subs[0].state().ack_timer.is_some(), "timer should be armed");

    // both sequences come around again flagged as redelivered
    for _ in 0..2 {
        let msg = sub
            .next_redelivered(3000)
            .await
            .expect("expired message should be redelivered");
        assert!(msg.redelivered);
        client.ack(&sub, "foo", msg.sequence);
    }

    tokio::time::sleep(Duration::from_millis(1250)).await;
    let st = subs[0].state();
    assert!(st.acks_pending.is_empty(), "everything got acked");
    assert!(st.ack_timer.is_none(), "timer should have stopped");
    drop(st);
    srv.shutdown();
}

#[tokio::test]
async fn queue_redelivery() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut req = client.sub_req("foo");
    req.ack_wait_secs = 1;
    req.queue_group = "group".to_string();
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.publish("foo", b"hello").await.unwrap();

    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert_eq!(subs.len(), 1);
    assert!(wait_until(1000, || subs[0].state().acks_pending.len() == 2).await);
    assert!(subs[0].state().ack_timer.is_some());

    for _ in 0..2 {
        let msg = sub.next_redelivered(3000).await.expect("queue redelivery");
        client.ack(&sub, "foo", msg.sequence);
    }

    tokio::time::sleep(Duration::from_millis(1250)).await;
    let st = subs[0].state();
    assert!(st.acks_pending.is_empty());
    assert!(st.ack_timer.is_none());
    drop(st);
    srv.shutdown();
}

#[tokio::test]
async fn max_in_flight_limits_delivery() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut req = client.sub_req("foo");
    req.max_in_flight = 1;
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"one").await.unwrap();
    client.publish("foo", b"two").await.unwrap();

    let first = sub.next(2000).await.expect("first message");
    assert_eq!(first.sequence, 1);
    assert!(sub.next(300).await.is_none(), "second must wait for the ack");

    client.ack(&sub, "foo", 1);
    let second = sub.next(2000).await.expect("second message after ack");
    assert_eq!(second.sequence, 2);
    assert!(!second.redelivered);
    srv.shutdown();
}

#[tokio::test]
async fn ack_for_unknown_sequence_is_a_noop() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut sub = client.subscribe(client.sub_req("foo")).await.unwrap();

    client.publish("foo", b"hello").await.unwrap();
    let msg = sub.next(2000).await.unwrap();

    client.ack(&sub, "foo", 999);
    let subs = srv.clients().get_subs(CLIENT_NAME);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subs[0].state().acks_pending.len(), 1);

    client.ack(&sub, "foo", msg.sequence);
    assert!(wait_until(1000, || subs[0].state().acks_pending.is_empty()).await);
    srv.shutdown();
}

// ---- start positions -----------------------------------------------

#[tokio::test]
async fn start_position_new_only() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.publish("foo", b"old").await.unwrap();
    let mut sub = client.subscribe(client.sub_req("foo")).await.unwrap();
    assert!(sub.next(300).await.is_none(), "no history for new-only");

    client.publish("foo", b"new").await.unwrap();
    let msg = sub.next(2000).await.expect("fresh publish arrives");
    assert_eq!(msg.payload, b"new".to_vec());
    assert_eq!(msg.sequence, 2);
    srv.shutdown();
}

#[tokio::test]
async fn start_position_last_received() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    // empty channel: strict error
    let mut req = client.sub_req("foo");
    req.start_position = StartPosition::LastReceived;
    assert_eq!(
        client.subscribe(req).await.unwrap_err(),
        "unknown start sequence"
    );

    client.publish("bar", b"msg1").await.unwrap();
    client.publish("bar", b"msg2").await.unwrap();

    let mut req = client.sub_req("bar");
    req.start_position = StartPosition::LastReceived;
    let mut sub = client.subscribe(req).await.unwrap();

    let msg = sub.next(2000).await.expect("last message should arrive");
    assert_eq!(msg.payload, b"msg2".to_vec());
    assert_eq!(msg.sequence, 2);
    assert!(sub.next(300).await.is_none(), "only the last one");
    srv.shutdown();
}

#[tokio::test]
async fn start_position_first_sequence() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.publish("bar", b"msg1").await.unwrap();
    client.publish("bar", b"msg2").await.unwrap();

    let mut req = client.sub_req("bar");
    req.start_position = StartPosition::First;
    let mut sub = client.subscribe(req).await.unwrap();

    let first = sub.next(2000).await.expect("msg1");
    let second = sub.next(2000).await.expect("msg2");
    assert_eq!(first.payload, b"msg1".to_vec());
    assert_eq!(second.payload, b"msg2".to_vec());
    assert_eq!((first.sequence, second.sequence), (1, 2));
    srv.shutdown();
}

#[tokio::test]
async fn start_position_sequence_start() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    for payload in [b"m1", b"m2", b"m3"] {
        client.publish("foo", payload).await.unwrap();
    }

    let mut req = client.sub_req("foo");
    req.start_position = StartPosition::SequenceStart;
    req.start_sequence = 2;
    let mut sub = client.subscribe(req).await.unwrap();

    let msg = sub.next(2000).await.expect("m2 first");
    assert_eq!(msg.sequence, 2);
    let msg = sub.next(2000).await.expect("then m3");
    assert_eq!(msg.sequence, 3);
    srv.shutdown();
}

#[tokio::test]
async fn start_position_time_delta() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.publish("foo", b"msg1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    client.publish("foo", b"msg2").await.unwrap();

    // only messages younger than 300ms
    let mut req = client.sub_req("foo");
    req.start_position = StartPosition::TimeDeltaStart;
    req.start_time_delta_ms = 300;
    let mut sub = client.subscribe(req).await.unwrap();

    let msg = sub.next(2000).await.expect("msg2 in the window");
    assert_eq!(msg.payload, b"msg2".to_vec());
    assert!(sub.next(300).await.is_none(), "msg1 is older than the delta");
    srv.shutdown();
}

// ---- durables -------------------------------------------------------

#[tokio::test]
async fn durable_resume_redelivers_unacked() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.durable_name = "dur".to_string();
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"m1").await.unwrap();
    let msg = sub.next(2000).await.expect("m1 arrives");
    assert_eq!(msg.sequence, 1);
    // no ack: close with m1 in flight
    client.close().await.unwrap();

    // the durable is detached, not gone
    let channel = srv.channels().get("foo").unwrap();
    {
        let dir = channel.directory();
        assert_eq!(dir.durables.len(), 1);
        assert!(dir.psubs.is_empty(), "detached durable leaves the plain list");
    }

    // reconnect and pick the durable back up
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut req = client.sub_req("foo");
    req.durable_name = "dur".to_string();
    let mut sub = client.subscribe(req).await.unwrap();

    let msg = sub.next(2000).await.expect("m1 redelivered on rebind");
    assert_eq!(msg.sequence, 1);
    assert!(msg.redelivered, "rebind redelivery must carry the flag");

    client.publish("foo", b"m2").await.unwrap();
    let msg2 = sub.next(2000).await.expect("m2 arrives");
    assert_eq!(msg2.sequence, 2);
    assert!(!msg2.redelivered);

    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert_eq!(subs.len(), 1);
    assert!(wait_until(1000, || subs[0].state().acks_pending.len() == 2).await);
    client.ack(&sub, "foo", 1);
    client.ack(&sub, "foo", 2);
    assert!(wait_until(1000, || subs[0].state().acks_pending.is_empty()).await);
    srv.shutdown();
}

#[tokio::test]
async fn durable_acked_messages_not_redelivered() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.durable_name = "mydur".to_string();
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"msg1").await.unwrap();
    let msg = sub.next(2000).await.unwrap();
    client.ack(&sub, "foo", msg.sequence);
    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert!(wait_until(1000, || subs[0].state().acks_pending.is_empty()).await);

    client.close().await.unwrap();

    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    let mut req = client.sub_req("foo");
    req.durable_name = "mydur".to_string();
    let mut sub = client.subscribe(req).await.unwrap();

    client.publish("foo", b"msg2").await.unwrap();
    let msg = sub.next(2000).await.expect("msg2 for the resumed durable");
    assert_eq!(msg.sequence, 2);
    assert!(!msg.redelivered);
    assert!(sub.next(300).await.is_none(), "msg1 must not come back");
    srv.shutdown();
}

#[tokio::test]
async fn durable_double_bind_rejected_and_unsubscribe_destroys() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.durable_name = "dur".to_string();
    let sub = client.subscribe(req).await.unwrap();

    // binding the same durable twice while attached is an error
    let mut req = client.sub_req("foo");
    req.durable_name = "dur".to_string();
    assert_eq!(
        client.subscribe(req).await.unwrap_err(),
        "duplicate durable subscription"
    );

    // unsubscribe is the durable's destructor
    client.unsubscribe("foo", &sub.ack_inbox).await.unwrap();
    let channel = srv.channels().get("foo").unwrap();
    assert!(channel.directory().durables.is_empty());
    srv.shutdown();
}

// ---- queue groups ---------------------------------------------------

#[tokio::test]
async fn queue_group_load_balances_disjointly() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.queue_group = "group".to_string();
    let mut m1 = client.subscribe(req.clone()).await.unwrap();
    let mut m2 = client.subscribe(req).await.unwrap();

    for i in 0..10u8 {
        client.publish("foo", &[i]).await.unwrap();
    }

    let mut seen = Vec::new();
    let (mut from1, mut from2) = (0, 0);
    for _ in 0..10 {
        tokio::select! {
            Some(msg) = m1.rx.recv() => { from1 += 1; client.ack(&m1, "foo", msg.sequence); seen.push(msg.sequence); }
            Some(msg) = m2.rx.recv() => { from2 += 1; client.ack(&m2, "foo", msg.sequence); seen.push(msg.sequence); }
            _ = tokio::time::sleep(Duration::from_secs(3)) => panic!("timed out waiting for queue deliveries"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=10).collect::<Vec<u64>>(), "each message delivered exactly once");
    assert_eq!(from1, 5, "round robin splits the load evenly");
    assert_eq!(from2, 5);
    srv.shutdown();
}

#[tokio::test]
async fn queue_member_departure_requeues_in_flight() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let keeper = TestClient::connect(&bus, "keeper").await.unwrap();
    let leaver = TestClient::connect(&bus, "leaver").await.unwrap();

    let mut req = keeper.sub_req("foo");
    req.queue_group = "group".to_string();
    let mut keeper_sub = keeper.subscribe(req).await.unwrap();

    let mut req = leaver.sub_req("foo");
    req.queue_group = "group".to_string();
    let mut leaver_sub = leaver.subscribe(req).await.unwrap();

    keeper.publish("foo", b"one").await.unwrap();
    keeper.publish("foo", b"two").await.unwrap();

    // each member holds one message un-acked
    let kept = keeper_sub.next(2000).await.expect("keeper gets one");
    let left = leaver_sub.next(2000).await.expect("leaver gets one");
    assert_ne!(kept.sequence, left.sequence);

    leaver.close().await.unwrap();

    // the leaver's sequence comes back to the keeper as a redelivery
    let requeued = keeper_sub
        .next_redelivered(3000)
        .await
        .expect("departed member's message must be requeued");
    assert_eq!(requeued.sequence, left.sequence);

    // union of in-flight across members stays disjoint: only the keeper
    // holds anything now
    let subs = srv.clients().get_subs("keeper");
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].state().acks_pending.len(), 2);
    srv.shutdown();
}

#[tokio::test]
async fn queue_group_destroyed_with_last_member() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.queue_group = "group".to_string();
    let sub = client.subscribe(req).await.unwrap();

    let channel = srv.channels().get("foo").unwrap();
    assert_eq!(channel.directory().qsubs.len(), 1);

    client.unsubscribe("foo", &sub.ack_inbox).await.unwrap();
    assert!(channel.directory().qsubs.is_empty());
    srv.shutdown();
}

// ---- limits ---------------------------------------------------------

#[tokio::test]
async fn too_many_channels_on_publish() {
    let limits = StoreLimits {
        max_channels: 1,
        ..StoreLimits::default()
    };
    let store = limited_store(limits);
    let (bus, srv) = start_broker(test_opts(), Arc::clone(&store));
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.publish("foo", b"hello").await.unwrap();
    assert_eq!(
        client.publish("bar", b"hello").await.unwrap_err(),
        "maximum number of channels reached"
    );
    assert!(!store.has_channel("bar"), "failed publish must not create the channel");
    assert!(srv.channels().get("bar").is_none());
    srv.shutdown();
}

#[tokio::test]
async fn too_many_channels_on_subscribe() {
    let limits = StoreLimits {
        max_channels: 1,
        ..StoreLimits::default()
    };
    let (bus, srv) = start_broker(test_opts(), limited_store(limits));
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.subscribe(client.sub_req("foo")).await.unwrap();
    assert_eq!(
        client.subscribe(client.sub_req("bar")).await.unwrap_err(),
        "maximum number of channels reached"
    );
    srv.shutdown();
}

#[tokio::test]
async fn too_many_subs_per_channel() {
    let limits = StoreLimits {
        max_subs: 1,
        ..StoreLimits::default()
    };
    let (bus, srv) = start_broker(test_opts(), limited_store(limits));
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    client.subscribe(client.sub_req("foo")).await.unwrap();
    assert_eq!(
        client.subscribe(client.sub_req("foo")).await.unwrap_err(),
        "maximum number of subscriptions reached"
    );

    let channel = srv.channels().get("foo").unwrap();
    assert_eq!(channel.directory().psubs.len(), 1);
    srv.shutdown();
}

#[tokio::test]
async fn detached_durable_still_counts_toward_sub_limit() {
    let limits = StoreLimits {
        max_subs: 1,
        ..StoreLimits::default()
    };
    let (bus, srv) = start_broker(test_opts(), limited_store(limits));
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("foo");
    req.durable_name = "dur".to_string();
    client.subscribe(req).await.unwrap();
    client.close().await.unwrap();

    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    assert_eq!(
        client.subscribe(client.sub_req("foo")).await.unwrap_err(),
        "maximum number of subscriptions reached"
    );
    srv.shutdown();
}

#[tokio::test]
async fn publish_validation() {
    let (bus, srv) = start_broker(test_opts(), memory_store());
    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    assert_eq!(
        client.publish("foo", b"").await.unwrap_err(),
        "invalid publish request"
    );
    assert_eq!(
        client.publish("foo.>", b"x").await.unwrap_err(),
        "invalid channel"
    );
    srv.shutdown();
}

// ---- heartbeats -----------------------------------------------------

#[tokio::test]
async fn heartbeat_purges_dead_client() {
    let mut opts = test_opts();
    opts.hb_interval = Duration::from_millis(200);
    opts.hb_timeout = Duration::from_millis(10);
    opts.max_failed_hbs = 10;
    let (bus, srv) = start_broker(opts, memory_store());

    let mut client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    assert_eq!(srv.clients().count(), 1);

    client.kill_connection();
    assert!(
        wait_until(5000, || srv.clients().count() == 0).await,
        "dead client should be purged within 5s"
    );
    srv.shutdown();
}

// ---- recovery -------------------------------------------------------

#[tokio::test]
async fn file_store_recovery_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let bus = MemoryBus::new();

    let store = open_store(TYPE_FILE, &path, "test-cluster", StoreLimits::default()).unwrap();
    let srv = Broker::start(test_opts(), Arc::new(bus.clone()), store).expect("start");

    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();

    let mut req = client.sub_req("bar");
    req.queue_group = "group".to_string();
    let mut q1 = client.subscribe(req.clone()).await.unwrap();
    let mut q2 = client.subscribe(req).await.unwrap();

    let mut req = client.sub_req("baz");
    req.durable_name = "mydur".to_string();
    let mut dur = client.subscribe(req).await.unwrap();

    let mut plain = client.subscribe(client.sub_req("foo")).await.unwrap();

    client.publish("bar", b"Msg for bar").await.unwrap();
    client.publish("baz", b"Msg for baz").await.unwrap();
    client.publish("foo", b"Msg for foo").await.unwrap();

    let bar_msg = tokio::select! {
        Some(m) = q1.rx.recv() => { client.ack(&q1, "bar", m.sequence); m }
        Some(m) = q2.rx.recv() => { client.ack(&q2, "bar", m.sequence); m }
        _ = tokio::time::sleep(Duration::from_secs(3)) => panic!("no queue delivery on bar"),
    };
    assert_eq!(bar_msg.payload, b"Msg for bar".to_vec());
    let baz_msg = dur.next(2000).await.expect("baz delivery");
    client.ack(&dur, "baz", baz_msg.sequence);
    let foo_msg = plain.next(2000).await.expect("foo delivery");
    client.ack(&plain, "foo", foo_msg.sequence);

    // let the acks land before the restart
    let subs = srv.clients().get_subs(CLIENT_NAME);
    assert!(wait_until(1000, || subs.iter().all(|s| s.state().acks_pending.is_empty())).await);

    srv.shutdown();
    drop(srv);
    drop(subs);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // restart on the same bus and directory
    let store = open_store(TYPE_FILE, &path, "test-cluster", StoreLimits::default()).unwrap();
    let srv = Broker::start(test_opts(), Arc::new(bus.clone()), store).expect("restart");

    assert_eq!(srv.clients().count(), 1, "one client recovered");
    assert_eq!(srv.clients().get_subs(CLIENT_NAME).len(), 4, "four subs recovered");

    let bar = srv.channels().get("bar").expect("bar recovered");
    {
        let dir = bar.directory();
        assert!(dir.psubs.is_empty());
        assert!(dir.durables.is_empty());
        assert_eq!(dir.qsubs.len(), 1);
        assert_eq!(dir.qsubs.get("group").unwrap().member_count(), 2);
    }
    let baz = srv.channels().get("baz").expect("baz recovered");
    {
        let dir = baz.directory();
        assert_eq!(dir.durables.len(), 1);
        // an attached durable is also a plain subscriber
        assert_eq!(dir.psubs.len(), 1);
        assert!(dir.qsubs.is_empty());
    }
    let foo = srv.channels().get("foo").expect("foo recovered");
    {
        let dir = foo.directory();
        assert_eq!(dir.psubs.len(), 1);
        assert!(dir.durables.is_empty());
        assert!(dir.qsubs.is_empty());
    }

    // the surviving client keeps publishing against the same subjects
    client.publish("bar", b"New Msg for bar").await.unwrap();
    client.publish("baz", b"New Msg for baz").await.unwrap();
    client.publish("foo", b"New Msg for foo").await.unwrap();

    let new_bar = tokio::select! {
        Some(m) = q1.rx.recv() => m,
        Some(m) = q2.rx.recv() => m,
        _ = tokio::time::sleep(Duration::from_secs(3)) => panic!("no queue delivery on bar after restart"),
    };
    assert_eq!(new_bar.payload, b"New Msg for bar".to_vec());
    let new_baz = dur.next(2000).await.expect("baz delivery after restart");
    assert_eq!(new_baz.payload, b"New Msg for baz".to_vec());
    let new_foo = plain.next(2000).await.expect("foo delivery after restart");
    assert_eq!(new_foo.payload, b"New Msg for foo".to_vec());
    srv.shutdown();
}

#[tokio::test]
async fn recovered_sub_for_unknown_client_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let bus = MemoryBus::new();

    let store = open_store(TYPE_FILE, &path, "test-cluster", StoreLimits::default()).unwrap();
    let srv = Broker::start(test_opts(), Arc::new(bus.clone()), Arc::clone(&store)).unwrap();

    let client = TestClient::connect(&bus, CLIENT_NAME).await.unwrap();
    client.subscribe(client.sub_req("foo")).await.unwrap();

    // lose the client record while keeping the subscription record
    store.delete_client(CLIENT_NAME).unwrap();

    srv.shutdown();
    drop(srv);
    drop(store);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = open_store(TYPE_FILE, &path, "test-cluster", StoreLimits::default()).unwrap();
    let srv = Broker::start(test_opts(), Arc::new(bus.clone()), store).unwrap();

    assert_eq!(srv.clients().count(), 0, "client must not come back");
    let foo = srv.channels().get("foo").expect("channel still recovered");
    assert!(foo.directory().psubs.is_empty(), "orphan sub must be dropped");
    srv.shutdown();
}
