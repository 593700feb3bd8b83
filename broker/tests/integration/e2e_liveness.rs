use super::*;
use muf_core::protocol::{self, BrokerCommand};
use muf_core::{Connector, FrameSink, FrameStream, GrpcConnector};

#[tokio::test]
async fn silent_worker_gets_probed_then_evicted() {
    let mut broker = start_test_broker(100, 3).await;
    let conn = GrpcConnector::default()
        .connect(&broker.addr.to_string())
        .await
        .unwrap();
    let (mut sink, mut stream) = (conn.sink, conn.stream);
    sink.send(protocol::ready("raw")).await.unwrap();
    broker.wait_status(|s| s.workers == 1).await;

    let probe = timeout(WAIT, stream.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        protocol::parse_broker_command(probe).unwrap(),
        BrokerCommand::Heartbeat
    );

    // never answering: evicted once interval x liveness has passed
    let status = broker.wait_status(|s| s.workers == 0).await;
    assert_eq!(status.idle_workers, 0);

    broker.ctx.shutdown();
    broker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_disconnects_every_worker() {
    let mut broker = start_test_broker(2_500, 5).await;
    let conn = GrpcConnector::default()
        .connect(&broker.addr.to_string())
        .await
        .unwrap();
    let (mut sink, mut stream) = (conn.sink, conn.stream);
    sink.send(protocol::ready("raw")).await.unwrap();
    broker.wait_status(|s| s.workers == 1).await;

    broker.ctx.shutdown();
    let last = timeout(WAIT, stream.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        protocol::parse_broker_command(last).unwrap(),
        BrokerCommand::Disconnect
    );
    drop(sink);
    timeout(WAIT, broker.handle)
        .await
        .expect("broker stops")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unregistered_heartbeat_is_answered_with_disconnect() {
    let broker = start_test_broker(2_500, 5).await;
    let conn = GrpcConnector::default()
        .connect(&broker.addr.to_string())
        .await
        .unwrap();
    let (mut sink, mut stream) = (conn.sink, conn.stream);
    sink.send(protocol::heartbeat()).await.unwrap();

    let reply = timeout(WAIT, stream.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(
        protocol::parse_broker_command(reply).unwrap(),
        BrokerCommand::Disconnect
    );
    // a protocol violation is reported but the broker keeps serving
    assert!(broker.ctx.errors().reported() >= 1);
    assert!(!broker.handle.is_finished());

    broker.ctx.shutdown();
    broker.handle.await.unwrap().unwrap();
}
