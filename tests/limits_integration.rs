mod support;

use std::{io::ErrorKind, net::Ipv4Addr, time::Duration as StdDuration};

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time::{sleep, timeout},
};

use support::*;

// --- Tests ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_request_head_gets_bad_gateway() -> Result<()> {
    let origin = MockOrigin::ok("never").await?;
    let harness = ProxyHarnessBuilder::new()
        .with_settings(|settings| settings.max_header_size = 256)
        .spawn()
        .await?;

    let port = origin.port();
    let filler = "a".repeat(512);
    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nX-Filler: {filler}\r\n\r\n"
    );
    let mut stream = harness.send(&request).await?;
    let response = read_response_text(&mut stream).await?;
    assert_eq!(response_status(&response)?, 502, "unexpected response: {response}");
    assert_eq!(origin.connections(), 0);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_client_is_disconnected() -> Result<()> {
    let harness = ProxyHarnessBuilder::new()
        .with_settings(|settings| settings.client_timeout = 1)
        .spawn()
        .await?;

    let mut stream = harness.connect().await?;

    // Write nothing. Wait for timeout + buffer.
    sleep(StdDuration::from_secs(2)).await;

    let res = timeout(StdDuration::from_secs(2), stream.read(&mut [0u8; 1])).await?;
    match res {
        Ok(0) => { /* Connection closed cleanly */ }
        Ok(_) => panic!("Connection should be closed due to timeout"),
        Err(e) if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("Unexpected error: {:?}", e),
    }

    harness.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_origin_times_out_with_bad_gateway() -> Result<()> {
    // Accepts and reads the request but never answers.
    let origin_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let origin_port = origin_listener.local_addr()?.port();
    let origin_task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = origin_listener.accept().await {
            let _ = read_until_double_crlf(&mut stream).await;
            held.push(stream);
        }
    });

    let harness = ProxyHarnessBuilder::new()
        .with_settings(|settings| settings.upstream_timeout = 1)
        .spawn()
        .await?;

    let mut stream = harness.send(&get_request(origin_port, "/slow")).await?;
    let response = read_response_text(&mut stream).await?;
    assert_eq!(response_status(&response)?, 502, "unexpected response: {response}");

    harness.shutdown().await;
    origin_task.abort();
    let _ = origin_task.await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_limit_holds_back_extra_clients() -> Result<()> {
    let origin = MockOrigin::ok("served").await?;
    let harness = ProxyHarnessBuilder::new()
        .with_settings(|settings| {
            settings.max_connections = 1;
            settings.cache_enabled = false;
        })
        .spawn()
        .await?;

    // Occupies the only permit without sending a request.
    let idle = harness.connect().await?;
    sleep(StdDuration::from_millis(100)).await;

    let mut waiting = harness.send(&get_request(origin.port(), "/")).await?;
    let mut byte = [0u8; 1];
    let early = timeout(StdDuration::from_millis(300), waiting.read(&mut byte)).await;
    assert!(early.is_err(), "second client was served while the limit was reached");
    assert_eq!(origin.connections(), 0);

    drop(idle);
    let response = read_response_text(&mut waiting).await?;
    assert!(response.ends_with("served"), "unexpected response: {response}");
    assert_eq!(origin.connections(), 1);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_body_is_relayed_with_fixed_length() -> Result<()> {
    let origin_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let origin_port = origin_listener.local_addr()?.port();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin_listener.accept().await?;
        let head = read_until_double_crlf(&mut stream).await?;
        let mut body = vec![0u8; 2048];
        stream.read_exact(&mut body).await?;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await?;
        stream.shutdown().await.ok();
        anyhow::Ok((head, body))
    });

    let harness = ProxyHarnessBuilder::new().spawn().await?;
    let body = vec![b'A'; 2048];
    let request = format!(
        "PUT http://127.0.0.1:{origin_port}/upload HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut stream = harness.send(&request).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let response = read_response_text(&mut stream).await?;
    assert!(response.ends_with("ok"), "unexpected response: {response}");
    let (head, received) = origin_task.await??;
    assert!(head.starts_with("PUT /upload HTTP/1.1\r\n"), "origin saw {head:?}");
    assert!(head.contains("Content-Length: 2048\r\n"));
    assert_eq!(received, body);
    assert!(harness.store().is_empty());

    harness.shutdown().await;
    Ok(())
}
