use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, watch},
    time::timeout,
};
use uuid::Uuid;

use crate::culvert::net;
use crate::culvert::tunnel::{
    DEFAULT_CONTROL_PORT, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT, STOP_GRACE,
    TunnelError, TunnelStatus, auth,
    protocol::{self, ControlMessage, ProtocolError},
    relay, shutdown_requested,
};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(10);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host or address to dial.
    pub to: String,
    /// Server control port; `0` selects the default.
    pub control_port: u16,
    /// Local service host; empty selects `localhost`.
    pub local_host: String,
    pub local_port: u16,
    /// Requested public port, `0` lets the server pick.
    pub port: u16,
    pub secret: Option<String>,
    /// Per-connection dial budget; zero selects the default.
    pub dial_timeout: Duration,
}

#[derive(Debug)]
pub struct Client {
    opts: ClientOptions,
    status: watch::Sender<TunnelStatus>,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Result<Self, TunnelError> {
        let to = opts.to.trim().to_string();
        if to.is_empty() {
            return Err(TunnelError::Config("server address is required".into()));
        }
        if opts.local_port == 0 {
            return Err(TunnelError::Config("local_port must be at least 1".into()));
        }
        let local_host = match opts.local_host.trim() {
            "" => "localhost".to_string(),
            other => other.to_string(),
        };
        let control_port = if opts.control_port == 0 {
            DEFAULT_CONTROL_PORT
        } else {
            opts.control_port
        };
        let secret = opts
            .secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let dial_timeout = if opts.dial_timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            opts.dial_timeout
        };

        let (status, _) = watch::channel(TunnelStatus::Starting);

        Ok(Self {
            opts: ClientOptions {
                to,
                control_port,
                local_host,
                local_port: opts.local_port,
                port: opts.port,
                secret,
                dial_timeout,
            },
            status,
        })
    }

    /// Current lifecycle state; `Ready { port }` carries the public port the
    /// server assigned.
    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub async fn run(&self, ctx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let res = self.run_with_retries(ctx).await;
        match &res {
            Ok(()) => {
                self.status.send_replace(TunnelStatus::Stopped);
            }
            Err(err) => {
                self.status.send_replace(TunnelStatus::Failed {
                    reason: format!("{err:#}"),
                });
            }
        }
        res
    }

    async fn run_with_retries(&self, mut ctx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let server = net::host_port(&self.opts.to, self.opts.control_port);
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut attempts: u32 = 0;
        // Remembered across reconnects so the public endpoint stays stable.
        let mut bound_port = (self.opts.port != 0).then_some(self.opts.port);

        loop {
            if *ctx.borrow() {
                return Ok(());
            }

            let err = match self.run_once(&server, ctx.clone(), &mut bound_port).await {
                Ok(()) => return Ok(()),
                Err(err) if fatal(&err) => {
                    return Err(anyhow::Error::from(err).context(format!("tunnel to {server}")));
                }
                Err(err) => err,
            };

            // A session that made it to Ready refills the retry budget.
            if matches!(&*self.status.borrow(), TunnelStatus::Ready { .. }) {
                attempts = 0;
                backoff = RECONNECT_BACKOFF_START;
            }
            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                return Err(anyhow::Error::from(err).context(format!(
                    "tunnel to {server}: giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts"
                )));
            }
            self.status
                .send_replace(TunnelStatus::Reconnecting { attempt: attempts });
            tracing::warn!(
                server = %server,
                err = %err,
                attempt = attempts,
                backoff = %humantime::format_duration(backoff),
                "tunnel client: disconnected, retrying"
            );

            tokio::select! {
                _ = shutdown_requested(&mut ctx) => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
    }

    async fn run_once(
        &self,
        server: &str,
        mut ctx: watch::Receiver<bool>,
        bound_port: &mut Option<u16>,
    ) -> Result<(), TunnelError> {
        let mut stream = match timeout(self.opts.dial_timeout, TcpStream::connect(server)).await {
            Ok(res) => res?,
            Err(_) => return Err(TunnelError::TimedOut("server dial")),
        };

        handshake(&mut stream, self.opts.secret.as_deref()).await?;

        let request = bound_port.unwrap_or(self.opts.port);
        protocol::write_frame(&mut stream, &ControlMessage::Bind { port: request }).await?;
        let assigned = match timeout(HANDSHAKE_TIMEOUT, protocol::read_frame(&mut stream)).await {
            Ok(frame) => match frame? {
                ControlMessage::Accept { port } => port,
                ControlMessage::Reject { reason } => return Err(reason.into()),
                other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            },
            Err(_) => return Err(TunnelError::TimedOut("bind acceptance")),
        };

        *bound_port = Some(assigned);
        self.status
            .send_replace(TunnelStatus::Ready { port: assigned });
        metrics::counter!("culvert_client_sessions_total").increment(1);
        tracing::info!(
            server = %server,
            port = assigned,
            local = %net::host_port(&self.opts.local_host, self.opts.local_port),
            "tunnel client: tunnel established"
        );

        let (rd, mut wr) = stream.into_split();
        let (frame_tx, mut frames) = mpsc::channel::<Result<ControlMessage, ProtocolError>>(16);
        let reader = tokio::spawn(async move {
            let mut rd = rd;
            loop {
                let res = protocol::read_frame(&mut rd).await;
                let stop = res.is_err();
                if frame_tx.send(res).await.is_err() || stop {
                    break;
                }
            }
        });

        let (sess_tx, sess_rx) = watch::channel(false);
        let result = self
            .control_loop(&mut wr, &mut frames, &sess_rx, &mut ctx)
            .await;

        // Relays drain on the session signal, the reader is safe to abort.
        let _ = sess_tx.send(true);
        reader.abort();
        let _ = reader.await;
        result
    }

    async fn control_loop<W>(
        &self,
        wr: &mut W,
        frames: &mut mpsc::Receiver<Result<ControlMessage, ProtocolError>>,
        session: &watch::Receiver<bool>,
        ctx: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let deadline = tokio::time::sleep(LIVENESS_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = shutdown_requested(ctx) => return Ok(()),
                _ = &mut deadline => {
                    return Err(TunnelError::TimedOut("server heartbeat"));
                }
                _ = heartbeat.tick() => {
                    protocol::write_frame(wr, &ControlMessage::Heartbeat).await?;
                }
                frame = frames.recv() => {
                    let frame = match frame {
                        None => return Err(TunnelError::Disconnected),
                        Some(Err(ProtocolError::Io(err)))
                            if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            return Err(TunnelError::Disconnected);
                        }
                        Some(Err(err)) => return Err(err.into()),
                        Some(Ok(frame)) => frame,
                    };
                    deadline.as_mut().reset(tokio::time::Instant::now() + LIVENESS_TIMEOUT);
                    match frame {
                        ControlMessage::Heartbeat => {}
                        ControlMessage::NewConnection { id } => {
                            let opts = self.opts.clone();
                            let session = session.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_new_connection(opts, id, session).await {
                                    tracing::debug!(id = %id, err = %err, "tunnel client: data connection ended with error");
                                }
                            });
                        }
                        other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
                    }
                }
            }
        }
    }
}

/// Errors reconnecting cannot fix.
fn fatal(err: &TunnelError) -> bool {
    matches!(
        err,
        TunnelError::Config(_)
            | TunnelError::Auth
            | TunnelError::NotAllowed
            | TunnelError::PortUnavailable
    )
}

/// Client half of the connection prelude: read the greeting and answer its
/// challenge when we hold a secret.
pub(crate) async fn handshake<S>(stream: &mut S, secret: Option<&str>) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match timeout(HANDSHAKE_TIMEOUT, protocol::read_frame(stream)).await {
        Ok(frame) => frame?,
        Err(_) => return Err(TunnelError::TimedOut("server greeting")),
    };
    let challenge = match hello {
        ControlMessage::Hello { challenge } => challenge,
        other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
    };

    // An absent challenge, or a secret we do not hold, leaves the answer
    // empty; the server decides whether that passes.
    let response = match (challenge.as_deref(), secret) {
        (Some(challenge), Some(secret)) => auth::answer(secret, challenge),
        _ => String::new(),
    };
    protocol::write_frame(stream, &ControlMessage::Authenticate { response }).await?;
    Ok(())
}

/// One announced public connection: dial the local service, dial the server
/// back, attach, and relay until either side closes.
async fn handle_new_connection(
    opts: ClientOptions,
    id: Uuid,
    session: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let local_addr = net::host_port(&opts.local_host, opts.local_port);
    let mut local = match timeout(opts.dial_timeout, TcpStream::connect(&local_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            // Only this pair is abandoned; the tunnel itself stays up.
            tracing::warn!(local = %local_addr, err = %err, "tunnel client: local service refused connection");
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(local = %local_addr, "tunnel client: local service dial timed out");
            return Ok(());
        }
    };

    let server = net::host_port(&opts.to, opts.control_port);
    let mut data = match timeout(opts.dial_timeout, TcpStream::connect(&server)).await {
        Ok(res) => res?,
        Err(_) => return Err(TunnelError::TimedOut("server dial")),
    };
    handshake(&mut data, opts.secret.as_deref()).await?;
    protocol::write_frame(&mut data, &ControlMessage::Attach { id }).await?;

    match relay::run_pair(&mut data, &mut local, session, STOP_GRACE).await {
        Ok((to_local, from_local)) => {
            tracing::debug!(id = %id, to_local, from_local, "tunnel client: relay pair closed");
        }
        Err(err) => {
            tracing::debug!(id = %id, err = %err, "tunnel client: relay pair ended with error");
        }
    }
    Ok(())
}
