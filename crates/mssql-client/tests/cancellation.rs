//! Cancellation, timeouts and the one-request-at-a-time rule.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use bytes::BytesMut;
use common::{MockConnector, config, done, result_set};
use mssql_client::{
    Client, ConnectionState, ECANCEL, EINVALIDSTATE, ETIMEOUT, Error, ErrorClass, Request,
    ResultItem, SqlValue, TimeoutConfig, TypeDescriptor,
};
use tds_protocol::token::{DoneStatus, TokenType};
use tokio::sync::oneshot;

#[tokio::test]
async fn test_dropped_stream_leaves_connection_busy_until_cancel() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        assert_eq!(server.expect_batch().await, "WAITFOR DELAY '00:10:00'");
        server.acknowledge_attention().await;

        assert_eq!(server.expect_batch().await, "SELECT 1");
        let mut tokens = BytesMut::new();
        done(&mut tokens, TokenType::Done, DoneStatus::empty(), 0);
        server.reply(tokens).await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let mut slow = Request::batch("WAITFOR DELAY '00:10:00'");
    let stream = client.execute(&mut slow).await.unwrap();
    drop(stream);
    assert_eq!(client.state(), ConnectionState::Executing);

    let mut next = Request::batch("SELECT 1");
    let err = client.execute(&mut next).await.unwrap_err();
    assert!(matches!(err, Error::Busy { state: "Executing" }));
    assert_eq!(err.code(), Some(EINVALIDSTATE));
    assert_eq!(err.class(), ErrorClass::Usage);

    client.cancel().await.unwrap();
    assert_eq!(client.state(), ConnectionState::LoggedIn);
    client.run(&mut next).await.unwrap();
    let _server = task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_on_idle_connection_is_a_no_op() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let _server = task.await.unwrap();
    client.cancel().await.unwrap();
    assert_eq!(client.state(), ConnectionState::LoggedIn);
}

#[tokio::test]
async fn test_stream_cancel_discards_rest_and_reports_canceled() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server.expect_batch().await;
        let mut tokens = BytesMut::new();
        result_set(
            &mut tokens,
            &[("n", TypeDescriptor::Int)],
            &[vec![SqlValue::Int(1)]],
        );
        server.reply(tokens).await;

        server.expect(tds_protocol::PacketType::Attention).await;
        // rows already in flight precede the acknowledgement
        let mut tokens = BytesMut::new();
        result_set(
            &mut tokens,
            &[("n", TypeDescriptor::Int)],
            &[vec![SqlValue::Int(2)]],
        );
        done(&mut tokens, TokenType::Done, DoneStatus::ATTN, 0);
        server.reply(tokens).await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let mut request = Request::batch("SELECT n FROM numbers");
    let mut stream = client.execute(&mut request).await.unwrap();

    assert!(matches!(stream.next().await.unwrap(), Some(ResultItem::Columns(_))));
    assert!(matches!(stream.next().await.unwrap(), Some(ResultItem::Row(_))));
    stream.cancel().await.unwrap();

    let err = stream.next().await.unwrap_err();
    assert_eq!(err.to_string(), "Canceled.");
    assert_eq!(err.code(), Some(ECANCEL));
    assert!(stream.next().await.unwrap().is_none());
    drop(stream);

    assert_eq!(client.state(), ConnectionState::LoggedIn);
    let _server = task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_handle_from_another_task() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let (received_tx, received_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server.expect_batch().await;
        received_tx.send(()).unwrap();
        server.acknowledge_attention().await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let handle = client.cancel_handle();
    let canceller = tokio::spawn(async move {
        received_rx.await.unwrap();
        handle.send_attention().await.unwrap();
    });

    let err = client
        .simple_query("WAITFOR DELAY '00:10:00'")
        .await
        .unwrap_err();
    canceller.await.unwrap();
    let _server = task.await.unwrap();

    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(client.state(), ConnectionState::LoggedIn);
}

#[tokio::test]
async fn test_cancel_handle_on_idle_connection_does_not_touch_next_request() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        // an attention here would fail the batch type check
        assert_eq!(server.expect_batch().await, "SELECT 1");
        let mut tokens = BytesMut::new();
        result_set(
            &mut tokens,
            &[("n", TypeDescriptor::Int)],
            &[vec![SqlValue::Int(1)]],
        );
        done(&mut tokens, TokenType::Done, DoneStatus::empty(), 1);
        server.reply(tokens).await;

        assert_eq!(server.expect_batch().await, "SELECT 2");
        let mut tokens = BytesMut::new();
        done(&mut tokens, TokenType::Done, DoneStatus::empty(), 0);
        server.reply(tokens).await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let handle = client.cancel_handle();
    assert!(!handle.send_attention().await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = client.simple_query("SELECT 1").await.unwrap();
    assert_eq!(result.rows()[0].get::<i32>(0).unwrap(), 1);
    assert_eq!(client.state(), ConnectionState::LoggedIn);

    client.simple_query("SELECT 2").await.unwrap();
    let _server = task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_after_handle_sends_one_attention() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server.expect_batch().await;
        server.acknowledge_attention().await;
        // a second attention would arrive before this batch
        assert_eq!(server.expect_batch().await, "SELECT 1");
        let mut tokens = BytesMut::new();
        done(&mut tokens, TokenType::Done, DoneStatus::empty(), 0);
        server.reply(tokens).await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let handle = client.cancel_handle();
    let mut slow = Request::batch("WAITFOR DELAY '00:10:00'");
    drop(client.execute(&mut slow).await.unwrap());

    assert!(handle.send_attention().await.unwrap());
    assert!(handle.is_pending());
    client.cancel().await.unwrap();
    assert!(!handle.is_pending());
    assert_eq!(client.state(), ConnectionState::LoggedIn);

    client.simple_query("SELECT 1").await.unwrap();
    let _server = task.await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_sends_attention() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server.expect_batch().await;
        server.acknowledge_attention().await;
        server
    });

    let mut client = Client::connect_with(config(), &connector).await.unwrap();
    let mut request = Request::batch("WAITFOR DELAY '00:10:00'");
    request.set_timeout(Some(Duration::from_millis(50)));
    let err = client.run(&mut request).await.unwrap_err();
    let _server = task.await.unwrap();

    assert_eq!(err.code(), Some(ETIMEOUT));
    assert_eq!(err.to_string(), "timeout: request failed to complete in 50ms");
    assert_eq!(client.state(), ConnectionState::LoggedIn);
}

#[tokio::test]
async fn test_unacknowledged_attention_closes_connection() {
    let (connector, mut servers) = MockConnector::new(1);
    let mut server = servers.remove(0);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server.accept_login().await;
        server.expect_batch().await;
        server.expect(tds_protocol::PacketType::Attention).await;
        // never answer, but keep the pipe open
        let _ = stop_rx.await;
    });

    let timeouts = TimeoutConfig::new()
        .command_timeout(Duration::from_millis(20))
        .cancel_timeout(Duration::from_millis(20));
    let mut client = Client::connect_with(config().timeouts(timeouts), &connector)
        .await
        .unwrap();
    let err = client
        .simple_query("WAITFOR DELAY '00:10:00'")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(client.state().is_terminal());
    let err = client.simple_query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}
