//! A minimal blocking-style RESP client over a single TCP connection,
//! mirroring the role `summit-ctl`'s `cmd::http` module plays — one shared
//! transport helper every subcommand calls through, rather than each
//! subcommand owning its own socket handling.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("connecting to cachegrandd on port {port}"))?;
        Ok(Self { stream })
    }

    /// Send one command (array of bulk strings) and read back a single
    /// reply line, resolving bulk/nil replies to their payload.
    pub async fn command(&mut self, parts: &[&str]) -> Result<Reply> {
        let mut request = format!("*{}\r\n", parts.len());
        for part in parts {
            request.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }
        self.stream.write_all(request.as_bytes()).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let prefix = self.read_byte().await?;
        let line = self.read_line().await?;
        match prefix {
            b'+' => Ok(Reply::Simple(line)),
            b'-' => Ok(Reply::Error(line)),
            b':' => Ok(Reply::Integer(line.parse().context("malformed integer reply")?)),
            b'$' => {
                let len: i64 = line.parse().context("malformed bulk length")?;
                if len < 0 {
                    return Ok(Reply::Nil);
                }
                let mut payload = vec![0u8; len as usize + 2];
                self.stream.read_exact(&mut payload).await?;
                payload.truncate(len as usize);
                Ok(Reply::Bulk(String::from_utf8_lossy(&payload).into_owned()))
            }
            other => bail!("unexpected reply prefix: {}", other as char),
        }
    }

    async fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await?;
            if byte[0] == b'\r' {
                self.stream.read_exact(&mut byte).await?; // consume '\n'
                break;
            }
            line.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

#[derive(Debug)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(String),
    Nil,
}
