//! Fallback signaling relay.
//!
//! A [`RelayConnector`] opens sessions to the relay server; [`RelayLink`]
//! keeps one session alive for the lifetime of the node, reconnecting with
//! exponential backoff for as long as it takes and re-registering after every
//! reconnect.

use std::{future::Future, time::Duration};

use tokio::sync::mpsc;

use super::SignalingError;
use crate::{
    message::SignalEnvelope,
    util::{self, backoff::ExponentialBackoff, TaskGuard},
};

const OUTGOING_BUFFER: usize = 256;

pub trait RelayConnector: Send + Sync + 'static {
    type Session: RelaySession;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, SignalingError>> + Send;
}

/// One connected session with the relay server.
pub trait RelaySession: Send + 'static {
    fn send(
        &mut self,
        envelope: &SignalEnvelope,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// `None` once the session is closed. A malformed message yields
    /// `Some(Err(_))` and the session stays usable.
    fn recv(&mut self) -> impl Future<Output = Option<Result<SignalEnvelope, SignalingError>>> + Send;

    fn disconnect(self) -> impl Future<Output = ()> + Send;
}

/// Handle to the background task maintaining the relay session.
///
/// Dropping it stops the task.
#[derive(Debug)]
pub struct RelayLink {
    outgoing: mpsc::Sender<SignalEnvelope>,
    _task: TaskGuard,
}

impl RelayLink {
    pub const DEFAULT_BACKOFF: ExponentialBackoff =
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));

    /// Starts the link. Envelopes received from the relay are forwarded to
    /// `inbound`; `registration` is sent first on every (re)connect.
    pub fn spawn<C: RelayConnector>(
        connector: C,
        registration: SignalEnvelope,
        backoff: ExponentialBackoff,
        inbound: mpsc::Sender<SignalEnvelope>,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let task = TaskGuard::spawn(run_link(
            connector,
            registration,
            backoff,
            outgoing_rx,
            inbound,
        ));
        Self {
            outgoing,
            _task: task,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<SignalEnvelope> {
        self.outgoing.clone()
    }
}

enum SessionEnd {
    Lost,
    Shutdown,
}

async fn run_link<C: RelayConnector>(
    connector: C,
    registration: SignalEnvelope,
    backoff: ExponentialBackoff,
    mut outgoing: mpsc::Receiver<SignalEnvelope>,
    inbound: mpsc::Sender<SignalEnvelope>,
) {
    let mut failures: u32 = 0;
    loop {
        match connector.connect().await {
            Ok(mut session) => {
                let mut register = registration.clone();
                register.timestamp = util::envelope_millis();
                match session.send(&register).await {
                    Ok(()) => {
                        if failures > 0 {
                            tracing::info!(failures, "Relay session re-established");
                        } else {
                            tracing::info!("Relay session established");
                        }
                        failures = 0;
                        match serve_session(&mut session, &mut outgoing, &inbound).await {
                            SessionEnd::Shutdown => {
                                session.disconnect().await;
                                tracing::debug!("Relay link stopped");
                                return;
                            }
                            SessionEnd::Lost => {
                                tracing::warn!("Relay session lost");
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Relay registration failed");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, attempt = failures + 1, "Relay connection failed");
            }
        }
        failures = failures.saturating_add(1);
        let delay = backoff.delay_for_attempt(failures);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
        tokio::time::sleep(delay).await;
        if inbound.is_closed() {
            return;
        }
    }
}

async fn serve_session<S: RelaySession>(
    session: &mut S,
    outgoing: &mut mpsc::Receiver<SignalEnvelope>,
    inbound: &mpsc::Sender<SignalEnvelope>,
) -> SessionEnd {
    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(envelope) = msg else {
                    return SessionEnd::Shutdown;
                };
                if let Err(error) = session.send(&envelope).await {
                    tracing::warn!(%error, kind = envelope.payload.kind(), "Relay send failed");
                    return SessionEnd::Lost;
                }
            }
            received = session.recv() => match received {
                Some(Ok(envelope)) => {
                    if inbound.send(envelope).await.is_err() {
                        return SessionEnd::Shutdown;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "Discarding malformed relay message");
                }
                None => return SessionEnd::Lost,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::message::{Registration, SignalPayload};
    use crate::types::Role;

    /// Fails the first `failures` connects, then hands out sessions backed by channels.
    struct FlakyConnector {
        failures: AtomicU32,
        connects: Arc<AtomicU32>,
        sessions: Arc<Mutex<VecDeque<ChannelSession>>>,
    }

    struct ChannelSession {
        sent: mpsc::UnboundedSender<SignalEnvelope>,
        incoming: mpsc::UnboundedReceiver<SignalEnvelope>,
    }

    impl RelayConnector for FlakyConnector {
        type Session = ChannelSession;

        async fn connect(&self) -> Result<ChannelSession, SignalingError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SignalingError::RelayUnavailable("refused".into()));
            }
            self.sessions
                .lock()
                .pop_front()
                .ok_or_else(|| SignalingError::RelayUnavailable("no session".into()))
        }
    }

    impl RelaySession for ChannelSession {
        async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
            self.sent
                .send(envelope.clone())
                .map_err(|_| SignalingError::ChannelClosed)
        }

        async fn recv(&mut self) -> Option<Result<SignalEnvelope, SignalingError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn disconnect(self) {}
    }

    fn registration() -> SignalEnvelope {
        SignalEnvelope::new(
            "client-1".into(),
            "org".into(),
            SignalPayload::Register(Registration {
                name: "client-1".into(),
                role: Role::Client,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_registers_again() {
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let (first_in_tx, first_in_rx) = mpsc::unbounded_channel();
        let (_second_in_tx, second_in_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(Mutex::new(VecDeque::from([
            ChannelSession {
                sent: sent_tx.clone(),
                incoming: first_in_rx,
            },
            ChannelSession {
                sent: sent_tx,
                incoming: second_in_rx,
            },
        ])));
        let connects = Arc::new(AtomicU32::new(0));
        let connector = FlakyConnector {
            failures: AtomicU32::new(2),
            connects: connects.clone(),
            sessions,
        };
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let _link = RelayLink::spawn(
            connector,
            registration(),
            RelayLink::DEFAULT_BACKOFF,
            inbound_tx,
        );

        let first = sent_rx.recv().await.unwrap();
        assert_eq!(first.payload.kind(), "register");
        assert_eq!(connects.load(Ordering::SeqCst), 3);

        // server side goes away
        drop(first_in_tx);
        let second = sent_rx.recv().await.unwrap();
        assert_eq!(second.payload.kind(), "register");
        assert_eq!(connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_both_directions() {
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connector = FlakyConnector {
            failures: AtomicU32::new(0),
            connects: Arc::new(AtomicU32::new(0)),
            sessions: Arc::new(Mutex::new(VecDeque::from([ChannelSession {
                sent: sent_tx,
                incoming: in_rx,
            }]))),
        };
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let link = RelayLink::spawn(
            connector,
            registration(),
            RelayLink::DEFAULT_BACKOFF,
            inbound_tx,
        );
        assert_eq!(sent_rx.recv().await.unwrap().payload.kind(), "register");

        let outgoing = registration().to("admin".into());
        link.sender().send(outgoing.clone()).await.unwrap();
        assert_eq!(sent_rx.recv().await.unwrap(), outgoing);

        let incoming = registration();
        in_tx.send(incoming.clone()).unwrap();
        assert_eq!(inbound_rx.recv().await.unwrap(), incoming);
    }
}
