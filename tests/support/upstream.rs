use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::read_until_double_crlf;

/// What the origin sends for every request it receives.
#[derive(Clone, Default)]
pub struct UpstreamScript {
    /// Written as soon as the request head arrives.
    pub first: Vec<u8>,
    /// Written after `pause`, then the connection is closed.
    pub rest: Vec<u8>,
    pub pause: Option<StdDuration>,
}

impl UpstreamScript {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            first: bytes.into(),
            ..Self::default()
        }
    }

    pub fn response(status: &str, body: impl AsRef<[u8]>) -> Self {
        let body = body.as_ref();
        let mut bytes = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        Self::raw(bytes)
    }

    /// Send the head immediately and hold the body back for `pause`.
    pub fn slow_body(status: &str, body: impl AsRef<[u8]>, pause: StdDuration) -> Self {
        let body = body.as_ref();
        Self {
            first: format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes(),
            rest: body.to_vec(),
            pause: Some(pause),
        }
    }

    pub fn full_response(&self) -> Vec<u8> {
        let mut bytes = self.first.clone();
        bytes.extend_from_slice(&self.rest);
        bytes
    }
}

/// Origin server that counts the requests it receives.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(script: UpstreamScript) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let script = Arc::new(script);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let counter = counter.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &script, &counter).await;
                });
            }
        });
        Ok(Self {
            addr,
            requests,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, script: &UpstreamScript, counter: &AtomicUsize) -> Result<()> {
    let head = read_until_double_crlf(&mut stream).await?;
    if head.is_empty() {
        return Ok(());
    }
    counter.fetch_add(1, Ordering::SeqCst);
    stream.write_all(&script.first).await?;
    if let Some(pause) = script.pause {
        tokio::time::sleep(pause).await;
    }
    stream.write_all(&script.rest).await?;
    stream.shutdown().await.ok();
    Ok(())
}
