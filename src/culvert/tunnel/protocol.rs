use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Hard cap on one control frame. Control traffic is tiny; anything bigger
/// is a broken or hostile peer.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One frame on a control or data connection.
///
/// Wire layout: a big-endian `u32` payload length followed by that many bytes
/// of JSON encoding the variant (internally tagged via `type`). The length
/// prefix makes every frame self-delimiting regardless of TCP segmentation.
/// This layout and the challenge digest in [`super::auth`] are a compatibility
/// contract between client and server builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Server greeting, first frame on every accepted connection. Carries a
    /// hex nonce to sign iff the server has a secret configured.
    Hello { challenge: Option<String> },
    /// Client answer to `Hello`; empty when no challenge was issued.
    Authenticate { response: String },
    /// Control connection: request a public port (0 = auto-assign).
    Bind { port: u16 },
    /// Port granted; the public listener is up.
    Accept { port: u16 },
    /// Terminal refusal, connection closes after this frame.
    Reject { reason: RejectReason },
    /// A public connection is parked server-side waiting for a data stream.
    NewConnection { id: Uuid },
    /// Data connection: claim the parked public connection with this id.
    Attach { id: Uuid },
    Heartbeat,
}

impl ControlMessage {
    /// Wire tag of this variant, for logs and unexpected-frame errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Authenticate { .. } => "authenticate",
            ControlMessage::Bind { .. } => "bind",
            ControlMessage::Accept { .. } => "accept",
            ControlMessage::Reject { .. } => "reject",
            ControlMessage::NewConnection { .. } => "new_connection",
            ControlMessage::Attach { .. } => "attach",
            ControlMessage::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AuthFailed,
    PortUnavailable,
    NotAllowed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AuthFailed => write!(f, "auth_failed"),
            RejectReason::PortUnavailable => write!(f, "port_unavailable"),
            RejectReason::NotAllowed => write!(f, "not_allowed"),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ControlMessage,
) -> Result<(), ProtocolError> {
    let b = serde_json::to_vec(msg)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<ControlMessage, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_roundtrip_preserves_variants() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let id = Uuid::new_v4();
        let msgs = vec![
            ControlMessage::Hello {
                challenge: Some("a1b2".into()),
            },
            ControlMessage::Hello { challenge: None },
            ControlMessage::Authenticate {
                response: "feed".into(),
            },
            ControlMessage::Bind { port: 0 },
            ControlMessage::Accept { port: 10001 },
            ControlMessage::Reject {
                reason: RejectReason::PortUnavailable,
            },
            ControlMessage::NewConnection { id },
            ControlMessage::Attach { id },
            ControlMessage::Heartbeat,
        ];

        let sent = msgs.clone();
        let w = tokio::spawn(async move {
            for m in &sent {
                write_frame(&mut a, m).await?;
            }
            Ok::<(), ProtocolError>(())
        });

        for want in &msgs {
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(&got, want);
        }
        w.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_too_large_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);

        tokio::spawn(async move {
            a.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
            // no payload needed
        });

        let err = read_frame(&mut b).await.unwrap_err();
        match err {
            ProtocolError::FrameTooLarge(n) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_payload_is_a_json_error() {
        let (mut a, mut b) = tokio::io::duplex(128);

        tokio::spawn(async move {
            a.write_u32(4).await.unwrap();
            a.write_all(b"\xff\xff\xff\xff").await.unwrap();
        });

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn unknown_json_fields_are_ignored() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"bind","port":8080,"nonce":"x"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Bind { port: 8080 });
    }
}
