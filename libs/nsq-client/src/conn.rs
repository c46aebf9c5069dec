use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::{Command, Frame, MAGIC_V2, NsqCodec, RESPONSE_HEARTBEAT, RESPONSE_OK};
use crate::config::Config;
use crate::error::NsqError;

pub(crate) type NsqFramed = Framed<TcpStream, NsqCodec>;

/// TCP connect → magic → IDENTIFY → wait for `OK`.
pub(crate) async fn dial(addr: &str, config: &Config) -> Result<NsqFramed, NsqError> {
    let stream = timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NsqError::DialTimeout { addr: addr.to_string(), timeout: config.dial_timeout })?
        .map_err(|source| NsqError::Dial { addr: addr.to_string(), source })?;
    stream.set_nodelay(true)?;

    let mut framed = Framed::new(stream, NsqCodec::new(config.max_frame_size));
    timeout(config.write_timeout, framed.get_mut().write_all(MAGIC_V2))
        .await
        .map_err(|_| NsqError::WriteTimeout(config.write_timeout))??;

    send(&mut framed, Command::Identify(config.identify_body()?), config.write_timeout).await?;
    expect_ok(&mut framed, config).await?;

    tracing::debug!(%addr, "nsqd handshake complete");
    Ok(framed)
}

pub(crate) async fn send(
    framed: &mut NsqFramed,
    cmd: Command,
    write_timeout: Duration,
) -> Result<(), NsqError> {
    timeout(write_timeout, framed.send(cmd))
        .await
        .map_err(|_| NsqError::WriteTimeout(write_timeout))?
}

/// Read frames until nsqd answers `OK`, answering heartbeats on the way.
pub(crate) async fn expect_ok(framed: &mut NsqFramed, config: &Config) -> Result<(), NsqError> {
    loop {
        let frame = timeout(config.read_timeout, framed.next())
            .await
            .map_err(|_| NsqError::ReadTimeout(config.read_timeout))?;
        match frame {
            Some(Ok(Frame::Response(data))) if data.as_ref() == RESPONSE_OK => return Ok(()),
            Some(Ok(Frame::Response(data))) if data.as_ref() == RESPONSE_HEARTBEAT => {
                send(framed, Command::Nop, config.write_timeout).await?;
            }
            Some(Ok(Frame::Response(data))) => {
                return Err(NsqError::Protocol(format!(
                    "unexpected response '{}'",
                    String::from_utf8_lossy(&data)
                )));
            }
            Some(Ok(Frame::Error(data))) => {
                return Err(NsqError::Broker(String::from_utf8_lossy(&data).into_owned()));
            }
            Some(Ok(Frame::Message(_))) => {
                return Err(NsqError::Protocol("message frame before subscription".into()));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(NsqError::ConnectionClosed),
        }
    }
}
