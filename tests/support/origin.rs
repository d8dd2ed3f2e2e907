use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::http_utils::read_until_double_crlf;

#[derive(Clone)]
struct Script {
    response: Arc<Vec<u8>>,
    /// Bytes sent before waiting on the gate; everything when there is no gate.
    split: usize,
    gate: Option<Arc<Semaphore>>,
}

/// HTTP origin that answers every connection with the same raw response and counts them.
pub struct MockOrigin {
    port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Semaphore>>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn new(response: impl Into<Vec<u8>>) -> Result<Self> {
        let response = response.into();
        let split = response.len();
        Self::spawn(Script {
            response: Arc::new(response),
            split,
            gate: None,
        })
        .await
    }

    pub async fn ok(body: &str) -> Result<Self> {
        Self::new(ok_response(body)).await
    }

    /// Sends the first `split` bytes, then holds the rest back until [`MockOrigin::release`].
    pub async fn gated(response: impl Into<Vec<u8>>, split: usize) -> Result<Self> {
        let response = response.into();
        let split = split.min(response.len());
        Self::spawn(Script {
            response: Arc::new(response),
            split,
            gate: Some(Arc::new(Semaphore::new(0))),
        })
        .await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Lets every held connection finish its response.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    async fn spawn(script: Script) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let gate = script.gate.clone();
        let handle = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let script = script.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, script, requests).await;
                    });
                }
            })
        };
        Ok(Self {
            port,
            connections,
            requests,
            gate,
            handle,
        })
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    let head = read_until_double_crlf(&mut stream).await?;
    requests
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .push(head);
    stream.write_all(&script.response[..script.split]).await?;
    if let Some(gate) = &script.gate {
        stream.flush().await?;
        let _permit = gate.acquire().await?;
    }
    stream.write_all(&script.response[script.split..]).await?;
    stream.shutdown().await.ok();
    Ok(())
}

pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
