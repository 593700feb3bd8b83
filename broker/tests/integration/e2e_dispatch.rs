use super::*;
use muf_core::session::request_type;
use muf_core::{ClientCommController, WorkerSession};

async fn connected_client(
    ctx: &AppContext,
) -> (ClientCommController, mpsc::UnboundedReceiver<String>) {
    let (listener, mut delivered) = collecting_listener();
    let client = ClientCommController::builder()
        .service_name("client-e2e")
        .response_listener(listener)
        .build(ctx);
    let handshake = next_delivery(&mut delivered).await;
    assert!(handshake.contains(request_type::SESSION_INITIATED));
    (client, delivered)
}

#[tokio::test]
async fn queued_request_dispatches_when_worker_readies() {
    let mut broker = start_test_broker(2_500, 5).await;
    let ctx = worker_context(broker.addr);
    let manager = WorkerSession::new(&ctx, "session-manager", SessionManager).spawn();
    let (client, mut delivered) = connected_client(&ctx).await;

    client.send("echo", "hello").await.unwrap();
    let status = broker.wait_status(|s| s.pending_requests == 1).await;
    assert_eq!(status.workers, 1);

    let echo = WorkerSession::new(&ctx, "echo", Fixed("ok")).spawn();
    assert_eq!(next_delivery(&mut delivered).await, "ok");
    broker.wait_status(|s| s.pending_requests == 0).await;
    assert_eq!(client.received_messages(), 1);

    client.close();
    echo.stop().await;
    manager.stop().await;
    broker.ctx.shutdown();
    broker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn internal_service_queries_over_the_wire() {
    let mut broker = start_test_broker(2_500, 5).await;
    let ctx = worker_context(broker.addr);
    let manager = WorkerSession::new(&ctx, "session-manager", SessionManager).spawn();
    let echo = WorkerSession::new(&ctx, "echo", Fixed("ok")).spawn();
    broker.wait_status(|s| s.idle_workers == 2).await;
    let (client, mut delivered) = connected_client(&ctx).await;

    client.send("mmi.service", "echo").await.unwrap();
    assert_eq!(next_delivery(&mut delivered).await, "200");
    client.send("mmi.service", "missing").await.unwrap();
    assert_eq!(next_delivery(&mut delivered).await, "400");
    client.send("mmi.workers", "echo").await.unwrap();
    assert_eq!(next_delivery(&mut delivered).await, "501");

    client.close();
    echo.stop().await;
    manager.stop().await;
    broker.ctx.shutdown();
    broker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn each_service_routes_to_its_own_pool() {
    let mut broker = start_test_broker(2_500, 5).await;
    let ctx = worker_context(broker.addr);
    let manager = WorkerSession::new(&ctx, "session-manager", SessionManager).spawn();
    let alpha = WorkerSession::new(&ctx, "alpha", Fixed("from-alpha")).spawn();
    let beta = WorkerSession::new(&ctx, "beta", Fixed("from-beta")).spawn();
    broker.wait_status(|s| s.idle_workers == 3).await;
    let (client, mut delivered) = connected_client(&ctx).await;

    client.send("alpha", "x").await.unwrap();
    assert_eq!(next_delivery(&mut delivered).await, "from-alpha");
    client.send("beta", "y").await.unwrap();
    assert_eq!(next_delivery(&mut delivered).await, "from-beta");

    client.close();
    timeout(WAIT, client.closed()).await.expect("client destroyed");
    alpha.stop().await;
    beta.stop().await;
    manager.stop().await;
    broker.ctx.shutdown();
    broker.handle.await.unwrap().unwrap();
}
