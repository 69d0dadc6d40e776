//! In-process lifecycle tests driven by a manual signal source.

use std::net::SocketAddr;
use std::time::Duration;

use grace_handoff::lifecycle::ProcessGeneration;
use grace_handoff::net::{ListenError, ListenerError};
use grace_handoff::{
    GraceError, GracefulNet, GracefulServer, LifecycleState, Options, ProcessSignal, ServerSpec,
    SignalSource, WorkCounter,
};

mod common;

fn options(source: SignalSource) -> Options {
    Options::new()
        .signals(source)
        .generation(ProcessGeneration::fresh())
        .executable("/nonexistent/grace-handoff-successor")
}

#[tokio::test]
async fn serves_every_server_then_drains_on_terminate() {
    let a: SocketAddr = "127.0.0.1:28301".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:28302".parse().unwrap();

    let (signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![
            ServerSpec::new(a.to_string(), common::test_router("a")).named("a"),
            ServerSpec::new(b.to_string(), common::test_router("b")).named("b"),
        ],
        options(source),
    );
    let mut state = server.lifecycle();
    let run = tokio::spawn(server.run());

    common::wait_for_port(a).await;
    common::wait_for_port(b).await;
    let client = common::client();
    assert_eq!(client.get(format!("http://{}/", a)).send().await.unwrap().text().await.unwrap(), "a");
    assert_eq!(client.get(format!("http://{}/", b)).send().await.unwrap().text().await.unwrap(), "b");

    signals.send(ProcessSignal::Terminate).await.unwrap();
    run.await.unwrap().unwrap();

    state.wait_for(|s| *s == LifecycleState::Terminated).await.unwrap();
    assert!(common::is_refused(a).await);
    assert!(common::is_refused(b).await);
}

#[tokio::test]
async fn in_flight_request_finishes_during_drain() {
    let addr: SocketAddr = "127.0.0.1:28303".parse().unwrap();
    let (signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![ServerSpec::new(addr.to_string(), common::test_router("slow"))],
        options(source),
    );
    let run = tokio::spawn(server.run());
    common::wait_for_port(addr).await;

    let request = tokio::spawn(async move {
        common::client()
            .get(format!("http://{}/slow/400", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    signals.send(ProcessSignal::Terminate).await.unwrap();
    assert_eq!(request.await.unwrap(), "slow");
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn retained_work_delays_exit() {
    let addr: SocketAddr = "127.0.0.1:28304".parse().unwrap();
    let work = WorkCounter::new();
    let guard = work.guard();

    let (signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![ServerSpec::new(addr.to_string(), common::test_router("work"))],
        options(source).waiter(work.clone()),
    );
    let mut state = server.lifecycle();
    let mut run = tokio::spawn(server.run());
    common::wait_for_port(addr).await;

    signals.send(ProcessSignal::Terminate).await.unwrap();
    state.wait_for(|s| *s == LifecycleState::Terminated).await.unwrap();

    // Drained, but the retained unit keeps the lifecycle from returning.
    assert!(common::is_refused(addr).await);
    assert!(tokio::time::timeout(Duration::from_millis(200), &mut run).await.is_err());

    drop(guard);
    run.await.unwrap().unwrap();
    assert_eq!(work.outstanding(), 0);
}

#[tokio::test]
async fn second_terminate_does_not_deadlock() {
    let addr: SocketAddr = "127.0.0.1:28305".parse().unwrap();
    let (signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![ServerSpec::new(addr.to_string(), common::test_router("twice"))],
        options(source),
    );
    let run = tokio::spawn(server.run());
    common::wait_for_port(addr).await;

    signals.send(ProcessSignal::Terminate).await.unwrap();
    signals.send(ProcessSignal::Interrupt).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("lifecycle did not finish")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn failed_successor_keeps_serving() {
    let addr: SocketAddr = "127.0.0.1:28306".parse().unwrap();
    let (signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![ServerSpec::new(addr.to_string(), common::test_router("still here"))],
        options(source),
    );
    let recorded = server.recorded_errors();
    let run = tokio::spawn(server.run());
    common::wait_for_port(addr).await;

    signals.send(ProcessSignal::Restart).await.unwrap();
    assert!(common::eventually(Duration::from_secs(5), || recorded.len() == 1).await);
    assert!(recorded.messages()[0].contains("failed to start successor"));

    let body = common::client()
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "still here");

    signals.send(ProcessSignal::Terminate).await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn occupied_address_fails_before_serving() {
    let outsider = std::net::TcpListener::bind("127.0.0.1:28307").unwrap();
    let addr = outsider.local_addr().unwrap();

    let (_signals, source) = SignalSource::manual();
    let server = GracefulServer::new(
        vec![ServerSpec::new(addr.to_string(), common::test_router("never"))],
        options(source),
    );

    let err = server.run().await.unwrap_err();
    assert!(matches!(err, GraceError::Listen(ListenError::Bind { .. })));
}

#[tokio::test]
async fn raw_listeners_stop_accepting_and_wait_for_connections() {
    let addr: SocketAddr = "127.0.0.1:28311".parse().unwrap();
    let (signals, source) = SignalSource::manual();
    let net = GracefulNet::new(options(source).connection_poll_interval(Duration::from_millis(20))).unwrap();

    let mut listener = net.listen("tcp", &addr.to_string()).unwrap();
    let connections = net.connections().clone();
    let mut run = tokio::spawn(net.run());

    let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let _conn = listener.accept().await.unwrap();
    let guard = connections.track();

    signals.send(ProcessSignal::Terminate).await.unwrap();
    assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));

    // The accepted connection is still tracked, so the lifecycle keeps waiting.
    assert!(tokio::time::timeout(Duration::from_millis(200), &mut run).await.is_err());

    drop(guard);
    run.await.unwrap().unwrap();
}
