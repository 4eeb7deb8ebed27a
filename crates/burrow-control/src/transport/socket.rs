//! Socket transport: one persistent bidirectional channel per session
//!
//! The session task ([`SocketDriver::run`]) is the only owner of the channel.
//! Everyone else talks to it through the [`SocketTransport`] handle, which
//! queues outbound frames on an mpsc channel.

use async_trait::async_trait;
use burrow_proto::{ForwardRequest, Frame, TransportKind};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Transport, TransportError};
use crate::correlator::{CorrelationError, RequestCorrelator};

/// Silent heartbeat intervals before a socket is declared dead
const HEARTBEAT_MISSES: u32 = 3;

/// Upper bound on flushing the close of a channel that stopped draining
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a socket session task returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the channel
    ClientClosed,
    /// No frame from the client for too long
    HeartbeatTimeout,
    /// The relay closed the transport (supersede, release, shutdown)
    Closed,
    /// Writing to the channel failed
    WriteFailed,
}

/// Handle used by the registry and the public proxy
pub struct SocketTransport {
    subdomain: String,
    session_id: Uuid,
    outbound: mpsc::Sender<Frame>,
    correlator: Arc<RequestCorrelator>,
    cancel: CancellationToken,
}

/// Owns the receiving half of the outbound queue and runs the channel
pub struct SocketDriver {
    subdomain: String,
    session_id: Uuid,
    outbound_rx: mpsc::Receiver<Frame>,
    correlator: Arc<RequestCorrelator>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl SocketTransport {
    pub fn new(
        subdomain: impl Into<String>,
        session_id: Uuid,
        correlator: Arc<RequestCorrelator>,
        heartbeat_interval: Duration,
        capacity: usize,
    ) -> (Arc<Self>, SocketDriver) {
        let subdomain = subdomain.into();
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            subdomain: subdomain.clone(),
            session_id,
            outbound,
            correlator: correlator.clone(),
            cancel: cancel.clone(),
        });

        let driver = SocketDriver {
            subdomain,
            session_id,
            outbound_rx,
            correlator,
            heartbeat_interval,
            cancel,
        };

        (transport, driver)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn subdomain(&self) -> &str {
        &self.subdomain
    }

    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    async fn dispatch(&self, request: ForwardRequest) -> Result<(), TransportError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Disconnected),
            sent = self.outbound.send(Frame::ForwardRequest(request)) => {
                sent.map_err(|_| TransportError::Disconnected)
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

impl SocketDriver {
    /// Pump frames between the channel and the session until one side goes
    /// away. `reader` yields inbound text messages, `writer` accepts outbound
    /// ones.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> SessionEnd
    where
        R: Stream<Item = String> + Unpin + Send,
        W: Sink<String> + Unpin + Send,
    {
        let SocketDriver {
            subdomain,
            session_id,
            mut outbound_rx,
            correlator,
            heartbeat_interval,
            cancel,
        } = self;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let dead_after = heartbeat_interval * HEARTBEAT_MISSES;
        let mut last_seen = Instant::now();

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Closed,

                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break SessionEnd::Closed };
                    if let Err(end) = write_frame(&mut writer, &frame, &subdomain, &cancel).await {
                        break end;
                    }
                }

                text = reader.next() => {
                    let Some(text) = text else { break SessionEnd::ClientClosed };
                    last_seen = Instant::now();
                    if let Some(reply) = handle_text(&text, &subdomain, session_id, &correlator) {
                        if let Err(end) = write_frame(&mut writer, &reply, &subdomain, &cancel).await {
                            break end;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= dead_after {
                        warn!(
                            "Socket for {} silent for {:?}, closing",
                            subdomain,
                            last_seen.elapsed()
                        );
                        break SessionEnd::HeartbeatTimeout;
                    }
                    if let Err(end) = write_frame(&mut writer, &Frame::Ping, &subdomain, &cancel).await {
                        break end;
                    }
                }
            }
        };

        cancel.cancel();
        if tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await.is_err() {
            debug!("Socket for {} did not flush its close in time", subdomain);
        }
        info!("Socket session for {} ended: {:?}", subdomain, end);
        end
    }
}

/// Write one frame. A writer that stops accepting does not outlive the
/// session: closing the transport abandons the pending write.
async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    subdomain: &str,
    cancel: &CancellationToken,
) -> Result<(), SessionEnd>
where
    W: Sink<String> + Unpin + Send,
{
    let text = match frame.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode frame for {}: {}", subdomain, e);
            return Ok(());
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(SessionEnd::Closed),
        sent = writer.send(text) => sent.map_err(|_| SessionEnd::WriteFailed),
    }
}

/// Apply one inbound frame; returns the reply to send, if any
fn handle_text(
    text: &str,
    subdomain: &str,
    session_id: Uuid,
    correlator: &RequestCorrelator,
) -> Option<Frame> {
    let frame = match Frame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Discarding malformed frame from {}: {}", subdomain, e);
            return None;
        }
    };

    match frame {
        Frame::ForwardResponse(response) => {
            let request_id = response.request_id;
            match correlator.resolve_for(session_id, response) {
                Ok(()) => debug!("Response for {} from {}", request_id, subdomain),
                Err(CorrelationError::UnknownRequest(_)) => warn!(
                    "Discarding unsolicited or duplicate response {} from {}",
                    request_id, subdomain
                ),
                Err(e) => warn!("Discarding response from {}: {}", subdomain, e),
            }
            None
        }
        Frame::Ping => Some(Frame::Pong),
        Frame::Pong => None,
        Frame::ForwardRequest(request) => {
            warn!(
                "Discarding forward_request {} sent by client {}",
                request.request_id, subdomain
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::InboundRequest;
    use burrow_proto::{ForwardResponse, RequestId};
    use futures::channel::mpsc as fmpsc;
use std::pin::Pin;
use std::task::{Context, Poll};

    struct Harness {
        transport: Arc<SocketTransport>,
        correlator: Arc<RequestCorrelator>,
        to_relay: fmpsc::UnboundedSender<String>,
        from_relay: fmpsc::UnboundedReceiver<String>,
        session: tokio::task::JoinHandle<SessionEnd>,
    }

    fn start(heartbeat: Duration) -> Harness {
        let correlator = Arc::new(RequestCorrelator::new(Duration::from_secs(30)));
        let (transport, driver) =
            SocketTransport::new("abc", Uuid::new_v4(), correlator.clone(), heartbeat, 16);

        let (to_relay, reader) = fmpsc::unbounded::<String>();
        let (writer, from_relay) = fmpsc::unbounded::<String>();
        let session = tokio::spawn(driver.run(reader, writer));

        Harness {
            transport,
            correlator,
            to_relay,
            from_relay,
            session,
        }
    }

    fn inbound(session_id: Uuid) -> InboundRequest {
        InboundRequest {
            subdomain: "abc".to_string(),
            session_id,
            client_ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/hello".to_string(),
            headers: vec![],
            body: None,
        }
    }

    async fn next_frame(rx: &mut fmpsc::UnboundedReceiver<String>) -> Frame {
        let text = rx.next().await.expect("channel closed");
        Frame::from_json(&text).unwrap()
    }

    #[tokio::test]
    async fn test_deliver_round_trip() {
        let mut h = start(Duration::from_secs(15));
        let id = h.correlator.begin(inbound(h.transport.session_id()));

        let transport = h.transport.clone();
        let caller = tokio::spawn(async move { transport.deliver(id).await });

        let frame = next_frame(&mut h.from_relay).await;
        assert_eq!(frame.request_id(), Some(id));

        let reply = Frame::ForwardResponse(ForwardResponse::new(id, 200).with_body("hello"));
        h.to_relay.unbounded_send(reply.to_json().unwrap()).unwrap();

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let mut h = start(Duration::from_secs(15));
        let first = h.correlator.begin(inbound(h.transport.session_id()));
        let second = h.correlator.begin(inbound(h.transport.session_id()));

        let t1 = h.transport.clone();
        let c1 = tokio::spawn(async move { t1.deliver(first).await });
        let t2 = h.transport.clone();
        let c2 = tokio::spawn(async move { t2.deliver(second).await });

        next_frame(&mut h.from_relay).await;
        next_frame(&mut h.from_relay).await;

        for (id, status) in [(second, 202), (first, 201)] {
            let frame = Frame::ForwardResponse(ForwardResponse::new(id, status));
            h.to_relay.unbounded_send(frame.to_json().unwrap()).unwrap();
        }

        assert_eq!(c1.await.unwrap().unwrap().status, 201);
        assert_eq!(c2.await.unwrap().unwrap().status, 202);
    }

    #[tokio::test]
    async fn test_garbage_and_unsolicited_frames_keep_channel_open() {
        let mut h = start(Duration::from_secs(15));

        h.to_relay.unbounded_send("not json".to_string()).unwrap();
        let stray = Frame::ForwardResponse(ForwardResponse::new(RequestId::new(), 200));
        h.to_relay.unbounded_send(stray.to_json().unwrap()).unwrap();
        h.to_relay
            .unbounded_send(Frame::Ping.to_json().unwrap())
            .unwrap();

        assert_eq!(next_frame(&mut h.from_relay).await, Frame::Pong);
        assert!(!h.transport.is_closed());
    }

    #[tokio::test]
    async fn test_client_close_ends_session() {
        let h = start(Duration::from_secs(15));
        drop(h.to_relay);

        assert_eq!(h.session.await.unwrap(), SessionEnd::ClientClosed);
        assert!(h.transport.is_closed());

        let id = h.correlator.begin(inbound(h.transport.session_id()));
        assert!(matches!(
            h.transport.deliver(id).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_driver() {
        let h = start(Duration::from_secs(15));
        h.transport.close();
        assert_eq!(h.session.await.unwrap(), SessionEnd::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_then_declares_dead() {
        let mut h = start(Duration::from_secs(15));

        assert_eq!(next_frame(&mut h.from_relay).await, Frame::Ping);
        assert_eq!(next_frame(&mut h.from_relay).await, Frame::Ping);

        // Client never answers; after three silent intervals the session ends
        let end = h.session.await.unwrap();
        assert_eq!(end, SessionEnd::HeartbeatTimeout);
        drop(h.to_relay);

        let id = h.correlator.begin(inbound(h.transport.session_id()));
        assert!(h.transport.deliver(id).await.is_err());
        assert_eq!(h.correlator.count(), 0);
    }

    /// Writer whose peer never reads: every send stays pending
    struct StalledWriter;

    impl Sink<String> for StalledWriter {
        type Error = ();

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: String) -> Result<(), ()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), ()>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_ends_session_blocked_on_write() {
        let correlator = Arc::new(RequestCorrelator::new(Duration::from_secs(30)));
        let (transport, driver) = SocketTransport::new(
            "abc",
            Uuid::new_v4(),
            correlator.clone(),
            Duration::from_secs(15),
            1,
        );
        let (_to_relay, reader) = fmpsc::unbounded::<String>();
        let session = tokio::spawn(driver.run(reader, StalledWriter));

        // The driver takes the first frame and stalls writing it; the queue
        // then fills and the last caller is stuck handing its request off
        let mut callers = Vec::new();
        for _ in 0..3 {
            let id = correlator.begin(inbound(transport.session_id()));
            let transport = transport.clone();
            callers.push(tokio::spawn(async move { transport.deliver(id).await }));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!session.is_finished());

        let started = Instant::now();
        transport.close();
        correlator.cancel_session(transport.session_id());

        assert_eq!(session.await.unwrap(), SessionEnd::Closed);
        assert!(started.elapsed() <= CLOSE_TIMEOUT);
        for caller in callers {
            assert!(matches!(
                caller.await.unwrap(),
                Err(TransportError::Disconnected)
            ));
        }
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
