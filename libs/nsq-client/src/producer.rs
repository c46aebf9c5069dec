use bytes::Bytes;
use futures::SinkExt;

use crate::codec::Command;
use crate::config::{Config, validate_name};
use crate::conn::{self, NsqFramed};
use crate::error::NsqError;

/// Publisher bound to a single nsqd; every publish waits for its `OK`.
pub struct Producer {
    addr: String,
    config: Config,
    framed: NsqFramed,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").field("addr", &self.addr).finish()
    }
}

impl Producer {
    pub async fn connect(addr: impl Into<String>, config: Config) -> Result<Self, NsqError> {
        let addr = addr.into();
        let framed = conn::dial(&addr, &config).await?;
        tracing::debug!(nsqd = %addr, "producer connected");
        Ok(Self { addr, config, framed })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Publish one message and wait for nsqd to acknowledge it.
    pub async fn publish(&mut self, topic: &str, body: impl Into<Bytes>) -> Result<(), NsqError> {
        validate_name("topic", topic)?;
        let cmd = Command::Pub { topic: topic.to_string(), body: body.into() };
        conn::send(&mut self.framed, cmd, self.config.write_timeout).await?;
        conn::expect_ok(&mut self.framed, &self.config).await
    }

    /// Publish a batch atomically.
    pub async fn multi_publish(&mut self, topic: &str, bodies: Vec<Bytes>) -> Result<(), NsqError> {
        validate_name("topic", topic)?;
        if bodies.is_empty() {
            return Ok(());
        }
        let cmd = Command::Mpub { topic: topic.to_string(), bodies };
        conn::send(&mut self.framed, cmd, self.config.write_timeout).await?;
        conn::expect_ok(&mut self.framed, &self.config).await
    }

    pub async fn stop(mut self) {
        if let Err(e) = self.framed.close().await {
            tracing::debug!(nsqd = %self.addr, error = %e, "producer close");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn ok_frame() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&6u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(b"OK");
        buf
    }

    #[tokio::test]
    async fn publishes_and_waits_for_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, mut w) = socket.into_split();
            let mut r = BufReader::new(r);

            let mut magic = [0u8; 4];
            r.read_exact(&mut magic).await.unwrap();
            let mut line = String::new();
            r.read_line(&mut line).await.unwrap();
            let len = r.read_u32().await.unwrap();
            let mut identify = vec![0u8; len as usize];
            r.read_exact(&mut identify).await.unwrap();
            w.write_all(&ok_frame()).await.unwrap();

            line.clear();
            r.read_line(&mut line).await.unwrap();
            let len = r.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            r.read_exact(&mut body).await.unwrap();
            w.write_all(&ok_frame()).await.unwrap();
            (line, body)
        });

        let config = Config { write_timeout: Duration::from_secs(2), ..Config::default() };
        let mut producer = Producer::connect(addr, config).await.unwrap();
        producer.publish("faas-request", &b"Test the function."[..]).await.unwrap();
        producer.stop().await;

        let (line, body) = server.await.unwrap();
        assert_eq!(line, "PUB faas-request\n");
        assert_eq!(body, b"Test the function.");
    }

    #[tokio::test]
    async fn rejects_invalid_topic_before_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, mut w) = socket.into_split();
            let mut r = BufReader::new(r);
            let mut magic = [0u8; 4];
            r.read_exact(&mut magic).await.unwrap();
            let mut line = String::new();
            r.read_line(&mut line).await.unwrap();
            let len = r.read_u32().await.unwrap();
            let mut identify = vec![0u8; len as usize];
            r.read_exact(&mut identify).await.unwrap();
            w.write_all(&ok_frame()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut producer = Producer::connect(addr, Config::default()).await.unwrap();
        let err = producer.publish("no spaces", &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, NsqError::InvalidName { .. }));
    }
}
