use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{read_to_end_with_timeout, read_until_double_crlf};

pub struct ProxyClient {
    stream: TcpStream,
}

impl ProxyClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
        })
    }

    pub async fn send(&mut self, request: impl AsRef<[u8]>) -> Result<()> {
        self.stream.write_all(request.as_ref()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the sending half; the response can still be read.
    pub async fn finish_sending(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        read_to_end_with_timeout(&mut self.stream).await
    }

    pub async fn read_headers(&mut self) -> Result<String> {
        read_until_double_crlf(&mut self.stream).await
    }

    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
