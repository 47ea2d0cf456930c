use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use fanout_proxy::proxy::cache::{CacheRegistry, ResourceKey};

const READ_TIMEOUT: StdDuration = StdDuration::from_secs(10);

pub async fn read_to_end_with_timeout<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(READ_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .context("timed out waiting for the proxy to close the response")??;
    Ok(buf)
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 response")
}

pub fn response_status(response: &[u8]) -> Result<u16> {
    let text = String::from_utf8_lossy(response);
    let line = text
        .lines()
        .next()
        .ok_or_else(|| anyhow!("empty response"))?;
    line.split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line '{line}'"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))
}

pub fn response_body(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| &response[pos + 4..])
        .unwrap_or(&[])
}

/// Poll the registry until `key` is present (or absent), up to two seconds.
pub async fn wait_for_key(registry: &CacheRegistry, key: &str, present: bool) -> bool {
    let key = ResourceKey::from_key_base(key);
    for _ in 0..40 {
        if registry.contains(&key) == present {
            return true;
        }
        sleep(StdDuration::from_millis(50)).await;
    }
    registry.contains(&key) == present
}
