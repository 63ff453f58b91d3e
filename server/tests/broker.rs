//! End-to-end broker scenarios over real TCP and HTTP listeners

use std::net::SocketAddr;
use std::time::Duration;

use carrier::{Consumer, Producer};
use carrier_server::broker::{BrokerOptions, Registry};
use carrier_server::core::ShutdownService;
use carrier_server::transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct TestBroker {
    tcp_addr: SocketAddr,
    http_addr: SocketAddr,
    shutdown: ShutdownService,
}

async fn start_broker(options: BrokerOptions) -> TestBroker {
    let registry = Registry::start(options);
    let shutdown = ShutdownService::new(registry.clone());

    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp.local_addr().unwrap();
    let http_addr = http.local_addr().unwrap();

    tokio::spawn(transport::tcp::serve(
        tcp,
        registry.clone(),
        shutdown.subscribe(),
    ));
    tokio::spawn(transport::http::serve(http, registry, shutdown.clone()));

    TestBroker {
        tcp_addr,
        http_addr,
        shutdown,
    }
}

async fn http_put(addr: SocketAddr, topic: &str, body: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST /put?topic={topic} HTTP/1.1\r\nHost: {addr}\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_single_producer_single_consumer() {
    let broker = start_broker(BrokerOptions::default()).await;

    let mut consumer = Consumer::subscribe(broker.tcp_addr, "scores", "default")
        .await
        .unwrap();
    // let the SUB land before publishing
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = http_put(broker.http_addr, "scores", b"hello").await;
    assert!(response.contains("200 OK"), "unexpected response: {response}");

    let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("delivery expected")
        .unwrap();
    assert_eq!(delivery.body, b"hello");

    consumer.finish(&delivery.id).await.unwrap();

    // exactly one delivery: the next pull blocks
    let no_more = tokio::time::timeout(Duration::from_millis(300), consumer.next()).await;
    assert!(no_more.is_err());
}

#[tokio::test]
async fn test_fan_out_to_two_channels() {
    let broker = start_broker(BrokerOptions::default()).await;

    let mut a = Consumer::subscribe(broker.tcp_addr, "s", "a").await.unwrap();
    let mut b = Consumer::subscribe(broker.tcp_addr, "s", "b").await.unwrap();

    // park both consumers in GET so both channels exist before the publish
    let a_task = tokio::spawn(async move {
        let delivery = a.next().await.unwrap();
        a.finish(&delivery.id).await.unwrap();
        delivery
    });
    let b_task = tokio::spawn(async move {
        let delivery = b.next().await.unwrap();
        b.finish(&delivery.id).await.unwrap();
        delivery
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut producer = Producer::connect(broker.tcp_addr).await.unwrap();
    producer.publish("s", b"m1").await.unwrap();

    let got_a = tokio::time::timeout(Duration::from_secs(2), a_task)
        .await
        .expect("channel a should receive the message")
        .unwrap();
    let got_b = tokio::time::timeout(Duration::from_secs(2), b_task)
        .await
        .expect("channel b should receive the message")
        .unwrap();

    assert_eq!(got_a.body, b"m1");
    assert_eq!(got_b.body, b"m1");
    assert_eq!(got_a.id, got_b.id);
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_timeout() {
    let options = BrokerOptions {
        msg_timeout: Duration::from_secs(1),
        ..BrokerOptions::default()
    };
    let broker = start_broker(options).await;

    let mut first = Consumer::subscribe(broker.tcp_addr, "s", "c").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut producer = Producer::connect(broker.tcp_addr).await.unwrap();
    producer.publish("s", b"m2").await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .expect("first delivery expected")
        .unwrap();
    // neither FIN nor REQ; walk away
    drop(first);

    let mut second = Consumer::subscribe(broker.tcp_addr, "s", "c").await.unwrap();
    let redelivery = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("watchdog should requeue the unacked message")
        .unwrap();

    assert_eq!(redelivery.id, delivery.id);
    assert_eq!(redelivery.body, b"m2");
    second.finish(&redelivery.id).await.unwrap();
}

#[tokio::test]
async fn test_explicit_requeue_redelivers() {
    let broker = start_broker(BrokerOptions::default()).await;

    let mut consumer = Consumer::subscribe(broker.tcp_addr, "s", "d").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut producer = Producer::connect(broker.tcp_addr).await.unwrap();
    producer.publish("s", b"m3").await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("delivery expected")
        .unwrap();
    consumer.requeue(&delivery.id).await.unwrap();

    let redelivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("requeued message should come back")
        .unwrap();
    assert_eq!(redelivery.id, delivery.id);
    assert_eq!(redelivery.body, b"m3");
    consumer.finish(&redelivery.id).await.unwrap();
}

#[tokio::test]
async fn test_overflow_drops_beyond_mem_queue_size() {
    let options = BrokerOptions {
        mem_queue_size: 2,
        ..BrokerOptions::default()
    };
    let broker = start_broker(options).await;

    // no consumer attached: the topic buffers up to its bound and drops the
    // rest
    for body in [b"m1", b"m2", b"m3", b"m4"] {
        let response = http_put(broker.http_addr, "overflow", body).await;
        assert!(response.contains("200 OK"));
    }
    // let the topic loop finish dropping the overflow before anyone
    // subscribes
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut consumer = Consumer::subscribe(broker.tcp_addr, "overflow", "late")
        .await
        .unwrap();
    let mut delivered = 0;
    while let Ok(Ok(delivery)) =
        tokio::time::timeout(Duration::from_millis(500), consumer.next()).await
    {
        consumer.finish(&delivery.id).await.unwrap();
        delivered += 1;
    }

    assert_eq!(delivered, 2, "expected exactly the buffered bound");
}

#[tokio::test]
async fn test_stats_and_ping() {
    let broker = start_broker(BrokerOptions::default()).await;

    http_put(broker.http_addr, "alpha", b"x").await;
    http_put(broker.http_addr, "beta", b"x").await;

    let mut stream = TcpStream::connect(broker.http_addr).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /stats HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                broker.http_addr
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("alpha\nbeta\n"), "unexpected response: {response}");

    let mut stream = TcpStream::connect(broker.http_addr).await.unwrap();
    stream
        .write_all(
            format!(
                "GET /ping HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                broker.http_addr
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("content-length: 2"), "unexpected response: {response}");
    assert!(response.ends_with("ok"), "unexpected response: {response}");
}

#[tokio::test]
async fn test_shutdown_kicks_consumers() {
    let broker = start_broker(BrokerOptions::default()).await;

    let mut consumer = Consumer::subscribe(broker.tcp_addr, "s", "kick").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pull = tokio::spawn(async move { consumer.next().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.shutdown.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), pull)
        .await
        .expect("blocked consumer should be released on shutdown")
        .unwrap();
    assert!(result.is_err());
}
