use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinSet,
    time::Instant,
};
use uuid::Uuid;

use crate::culvert::net;
use crate::culvert::tunnel::{
    HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT, PENDING_CONN_TTL, STOP_GRACE,
    TunnelError, TunnelStatus, auth,
    ports::{PortGrantError, PortTable},
    protocol::{self, ControlMessage, ProtocolError, RejectReason},
    relay, shutdown_requested,
};

const PENDING_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface the control listener binds.
    pub bind_addr: String,
    /// Interface public listeners bind; defaults to `bind_addr`.
    pub bind_tunnels: Option<String>,
    pub control_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub secret: Option<String>,
}

pub struct Server {
    shared: Arc<Shared>,
    control_addr: String,
    status: watch::Sender<TunnelStatus>,
}

struct Shared {
    bind_tunnels: String,
    secret: Option<String>,
    ports: PortTable,
    pending: DashMap<Uuid, PendingConn>,
}

/// A public connection parked until the owning client attaches its data
/// stream. Dropped (and thereby closed) when the TTL or its session expires.
struct PendingConn {
    stream: TcpStream,
    parked_at: Instant,
    port: u16,
    session: watch::Receiver<bool>,
}

pub(crate) enum SessionKind {
    Control { port: u16 },
    Data { id: Uuid },
}

impl Server {
    pub fn new(opts: ServerOptions) -> Result<Self, TunnelError> {
        if opts.min_port == 0 {
            return Err(TunnelError::Config("min_port must be at least 1".into()));
        }
        if opts.min_port > opts.max_port {
            return Err(TunnelError::Config(format!(
                "invalid port range: min_port {} > max_port {}",
                opts.min_port, opts.max_port
            )));
        }

        let bind_addr = match opts.bind_addr.trim() {
            "" => "0.0.0.0".to_string(),
            other => other.to_string(),
        };
        let bind_tunnels = opts
            .bind_tunnels
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| bind_addr.clone());
        let secret = opts
            .secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let control_addr =
            net::normalize_bind_addr(&net::host_port(&bind_addr, opts.control_port)).into_owned();

        let (status, _) = watch::channel(TunnelStatus::Starting);

        Ok(Self {
            shared: Arc::new(Shared {
                bind_tunnels,
                secret,
                ports: PortTable::new(opts.min_port, opts.max_port),
                pending: DashMap::new(),
            }),
            control_addr,
            status,
        })
    }

    /// Current lifecycle state; `Ready { port }` carries the bound control
    /// port once the listener is up.
    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn reserved_ports(&self) -> usize {
        self.shared.ports.reserved_count()
    }

    pub async fn listen_and_serve(&self, ctx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let res = self.serve_inner(ctx).await;
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

    async fn serve_inner(&self, ctx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = TcpListener::bind(&self.control_addr)
            .await
            .with_context(|| format!("bind control {}", self.control_addr))?;
        let local = ln.local_addr().context("control listener local addr")?;

        let (min_port, max_port) = self.shared.ports.range();
        tracing::info!(
            addr = %local,
            min_port,
            max_port,
            auth = self.shared.secret.is_some(),
            "tunnel server: listening"
        );
        self.status.send_replace(TunnelStatus::Ready { port: local.port() });

        let mut shutdown = ctx.clone();
        let mut sweep = tokio::time::interval(PENDING_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.shared.sweep_pending();
                }
                conn = ln.accept() => {
                    let (stream, peer) = conn?;
                    let shared = self.shared.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(shared, stream, peer, ctx).await {
                            tracing::warn!(peer = %peer, err = %err, "tunnel server: session ended with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

impl Shared {
    fn sweep_pending(&self) {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| p.parked_at.elapsed() < PENDING_CONN_TTL);
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            tracing::debug!(dropped, "tunnel server: expired pending connections");
        }
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let kind = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        open_session(shared.secret.as_deref(), &mut stream, peer),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Err(TunnelError::TimedOut("handshake")),
    };

    match kind {
        SessionKind::Control { port } => serve_control(shared, stream, peer, port, ctx).await,
        SessionKind::Data { id } => serve_data(shared, stream, peer, id).await,
    }
}

/// Server half of the connection prelude: greet, check the challenge answer,
/// then read the frame that decides whether this is a control or data
/// connection.
pub(crate) async fn open_session<S>(
    secret: Option<&str>,
    stream: &mut S,
    peer: SocketAddr,
) -> Result<SessionKind, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = secret.map(|_| auth::new_challenge());
    protocol::write_frame(
        stream,
        &ControlMessage::Hello {
            challenge: challenge.clone(),
        },
    )
    .await?;

    let response = match protocol::read_frame(stream).await? {
        ControlMessage::Authenticate { response } => response,
        other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
    };

    if let (Some(secret), Some(challenge)) = (secret, &challenge) {
        if !auth::verify(secret, challenge, &response) {
            tracing::warn!(peer = %peer, "tunnel server: bad secret");
            protocol::write_frame(
                stream,
                &ControlMessage::Reject {
                    reason: RejectReason::AuthFailed,
                },
            )
            .await?;
            // Consume the peer's queued frame so the close is a clean FIN and
            // the rejection is not lost to a reset.
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                protocol::read_frame(stream),
            )
            .await;
            return Err(TunnelError::Auth);
        }
    }

    match protocol::read_frame(stream).await? {
        ControlMessage::Bind { port } => Ok(SessionKind::Control { port }),
        ControlMessage::Attach { id } => Ok(SessionKind::Data { id }),
        other => Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
    }
}

async fn serve_control(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    requested: u16,
    mut ctx: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let (rd, mut wr) = stream.into_split();

    let (port, public_ln) = match grant_and_bind(&shared, requested).await {
        Ok(granted) => granted,
        Err(reason) => {
            tracing::warn!(
                peer = %peer,
                requested_port = requested,
                reason = %reason,
                "tunnel server: bind rejected"
            );
            protocol::write_frame(&mut wr, &ControlMessage::Reject { reason }).await?;
            return Err(reason.into());
        }
    };

    // The reservation is live: every exit below must pass through teardown.
    metrics::counter!("culvert_sessions_total").increment(1);
    metrics::gauge!("culvert_active_sessions").increment(1.0);

    let (sess_tx, sess_rx) = watch::channel(false);
    let (conn_tx, mut conns) = mpsc::channel::<Uuid>(64);
    let (frame_tx, mut frames) = mpsc::channel::<Result<ControlMessage, ProtocolError>>(16);

    let mut tasks: JoinSet<()> = JoinSet::new();
    {
        let shared = shared.clone();
        let session = sess_rx.clone();
        tasks.spawn(accept_public(shared, public_ln, port, conn_tx, session));
    }
    tasks.spawn(async move {
        let mut rd = rd;
        loop {
            let res = protocol::read_frame(&mut rd).await;
            let stop = res.is_err();
            if frame_tx.send(res).await.is_err() || stop {
                break;
            }
        }
    });

    let result = async {
        protocol::write_frame(&mut wr, &ControlMessage::Accept { port }).await?;
        tracing::info!(peer = %peer, port, "tunnel server: session established");
        control_loop(&mut wr, &mut frames, &mut conns, &mut ctx).await
    }
    .await;

    // Teardown: relays drain on the session signal, the reader and acceptor
    // are plain loops that are safe to abort outright.
    let _ = sess_tx.send(true);
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    shared.pending.retain(|_, p| p.port != port);
    shared.ports.release(port);
    metrics::gauge!("culvert_active_sessions").decrement(1.0);
    tracing::info!(peer = %peer, port, "tunnel server: session closed");

    result
}

/// Reserve a port and bind its public listener, releasing the reservation
/// whenever a bind fails. Auto-assignment walks upward past unbindable ports;
/// an explicit request gets exactly one try.
async fn grant_and_bind(
    shared: &Shared,
    requested: u16,
) -> Result<(u16, TcpListener), RejectReason> {
    let auto = requested == 0;
    let mut candidate = match shared.ports.reserve(requested) {
        Ok(port) => port,
        Err(PortGrantError::NotAllowed(_)) => return Err(RejectReason::NotAllowed),
        Err(_) => return Err(RejectReason::PortUnavailable),
    };

    loop {
        let addr = net::host_port(&shared.bind_tunnels, candidate);
        match TcpListener::bind(&addr).await {
            Ok(ln) => return Ok((candidate, ln)),
            Err(err) => {
                shared.ports.release(candidate);
                if !auto {
                    tracing::warn!(addr = %addr, err = %err, "tunnel server: requested port failed to bind");
                    return Err(RejectReason::PortUnavailable);
                }
                tracing::debug!(addr = %addr, err = %err, "tunnel server: port unbindable, trying next");
                let Some(floor) = candidate.checked_add(1) else {
                    return Err(RejectReason::PortUnavailable);
                };
                candidate = match shared.ports.reserve_from(floor) {
                    Ok(port) => port,
                    Err(_) => return Err(RejectReason::PortUnavailable),
                };
            }
        }
    }
}

async fn control_loop<W>(
    wr: &mut W,
    frames: &mut mpsc::Receiver<Result<ControlMessage, ProtocolError>>,
    conns: &mut mpsc::Receiver<Uuid>,
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
                return Err(TunnelError::TimedOut("client heartbeat"));
            }
            _ = heartbeat.tick() => {
                protocol::write_frame(wr, &ControlMessage::Heartbeat).await?;
            }
            id = conns.recv() => {
                let Some(id) = id else {
                    return Err(TunnelError::Io(std::io::Error::other("public listener closed")));
                };
                protocol::write_frame(wr, &ControlMessage::NewConnection { id }).await?;
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
                deadline.as_mut().reset(Instant::now() + LIVENESS_TIMEOUT);
                match frame {
                    ControlMessage::Heartbeat => {}
                    other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
                }
            }
        }
    }
}

/// Accept visitors on the public listener, park each connection, and announce
/// its id on the control channel.
async fn accept_public(
    shared: Arc<Shared>,
    ln: TcpListener,
    port: u16,
    conn_tx: mpsc::Sender<Uuid>,
    mut session: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut session) => return,
            res = ln.accept() => {
                match res {
                    Ok((stream, visitor)) => {
                        let id = Uuid::new_v4();
                        tracing::debug!(port, visitor = %visitor, id = %id, "tunnel server: public connection parked");
                        shared.pending.insert(id, PendingConn {
                            stream,
                            parked_at: Instant::now(),
                            port,
                            session: session.clone(),
                        });
                        if conn_tx.send(id).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(port, err = %err, "tunnel server: public accept failed");
                        return;
                    }
                }
            }
        }
    }
}

/// An authenticated data connection claims its parked public connection and
/// the two are relayed until either side closes.
async fn serve_data(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
    id: Uuid,
) -> Result<(), TunnelError> {
    let Some((_, parked)) = shared.pending.remove(&id) else {
        tracing::warn!(peer = %peer, id = %id, "tunnel server: attach for unknown connection");
        return Ok(());
    };
    if parked.parked_at.elapsed() >= PENDING_CONN_TTL {
        tracing::warn!(peer = %peer, id = %id, "tunnel server: attach for expired connection");
        return Ok(());
    }

    let mut public = parked.stream;
    tracing::debug!(peer = %peer, id = %id, port = parked.port, "tunnel server: relay pair attached");

    match relay::run_pair(&mut stream, &mut public, parked.session, STOP_GRACE).await {
        Ok((egress, ingress)) => {
            metrics::counter!("culvert_bytes_ingress_total").increment(ingress);
            metrics::counter!("culvert_bytes_egress_total").increment(egress);
            tracing::debug!(id = %id, ingress, egress, "tunnel server: relay pair closed");
        }
        Err(err) => {
            tracing::debug!(id = %id, err = %err, "tunnel server: relay pair ended with error");
        }
    }
    Ok(())
}
