#![allow(dead_code)]

use async_trait::async_trait;
use p2p_cam::{
    ConnectionSignal, Descriptor, EngineError, EngineSignal, GatheringState, LifecycleState,
    LocalTrack, MediaError, MediaKind, MediaSource, Role, Session, SessionConfig, StatsReport,
    TransportEngine,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const OFFER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 1822383939217891732 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
/// Канал с постоянной скоростью видео; вызов статистики номер `slow_call`
/// (с нуля) отвечает с задержкой `delay`.
#[derive(Debug, Clone, Copy)]
pub struct SteadyLink {
    pub started: Instant,
    pub bytes_per_sec: u64,
    pub slow_call: usize,
    pub delay: Duration,
}

const HOST_CANDIDATE: &str = "a=candidate:1 1 udp 2130706431 192.168.1.5 50000 typ host\r\n";

/// Движок, сигналами и статистикой которого управляет тест.
pub struct ScriptedEngine {
    tx: mpsc::UnboundedSender<EngineSignal>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EngineSignal>>>,
    local: Mutex<Option<Descriptor>>,
    remote: Mutex<Option<Descriptor>>,
    gathered: AtomicBool,
    stats: Mutex<VecDeque<Vec<StatsReport>>>,
    last_stats: Mutex<Vec<StatsReport>>,
    steady: Mutex<Option<SteadyLink>>,
    pub tracks: Mutex<Vec<LocalTrack>>,
    pub calls: Mutex<Vec<&'static str>>,
    pub reject_remote: AtomicBool,
    pub stats_calls: AtomicUsize,
    pub closed: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            gathered: AtomicBool::new(false),
            stats: Mutex::new(VecDeque::new()),
            last_stats: Mutex::new(Vec::new()),
            steady: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            reject_remote: AtomicBool::new(false),
            stats_calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        let engine = Self::new();
        engine.reject_remote.store(true, Ordering::SeqCst);
        engine
    }

    pub fn emit(&self, signal: EngineSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn connect(&self, signal: ConnectionSignal) {
        self.emit(EngineSignal::Connection(signal));
    }

    /// Добавляет host-кандидата в локальный дескриптор и сообщает о конце сбора.
    pub fn complete_gathering(&self) {
        self.gathered.store(true, Ordering::SeqCst);
        self.emit(EngineSignal::Gathering(GatheringState::InProgress));
        self.emit(EngineSignal::Gathering(GatheringState::Complete));
    }

    /// Каждый вызов `statistics` берёт следующий набор, последний повторяется.
    pub fn script_stats(&self, sets: Vec<Vec<StatsReport>>) {
        self.stats.lock().extend(sets);
    }

    /// Заменяет заскриптованные наборы счётчиком, растущим со временем.
    pub fn steady_link(&self, link: SteadyLink) {
        *self.steady.lock() = Some(link);
    }

    pub fn remote(&self) -> Option<Descriptor> {
        self.remote.lock().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.lock().iter().any(|c| *c == name)
    }
}

#[async_trait]
impl TransportEngine for ScriptedEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        self.calls.lock().push("add_local_track");
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn create_local_descriptor(&self, role: Role) -> Result<Descriptor, EngineError> {
        self.calls.lock().push("create_local_descriptor");
        Ok(match role {
            Role::Initiator => Descriptor::offer(OFFER_SDP),
            Role::Responder => Descriptor::answer(ANSWER_SDP),
        })
    }

    async fn set_local_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError> {
        self.calls.lock().push("set_local_descriptor");
        *self.local.lock() = Some(descriptor);
        Ok(())
    }

    async fn set_remote_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError> {
        self.calls.lock().push("set_remote_descriptor");
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("fingerprint mismatch".into()));
        }
        *self.remote.lock() = Some(descriptor);
        Ok(())
    }

    async fn current_local_descriptor(&self) -> Option<Descriptor> {
        let mut local = self.local.lock().clone()?;
        if self.gathered.load(Ordering::SeqCst) {
            local.sdp.push_str(HOST_CANDIDATE);
        }
        Some(local)
    }

    async fn statistics(&self) -> Vec<StatsReport> {
        let call = self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let steady = *self.steady.lock();
        if let Some(link) = steady {
            if call == link.slow_call {
                tokio::time::sleep(link.delay).await;
            }
            let millis = link.started.elapsed().as_millis() as u64;
            return vec![StatsReport::InboundMedia {
                kind: MediaKind::Video,
                bytes_received: link.bytes_per_sec * millis / 1000,
                packets_received: millis / 10,
                packets_lost: 0,
            }];
        }
        let next = self.stats.lock().pop_front();
        match next {
            Some(set) => {
                *self.last_stats.lock() = set.clone();
                set
            }
            None => self.last_stats.lock().clone(),
        }
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<EngineSignal>> {
        self.rx.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeMedia {
    fail: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MediaError> {
        if self.fail {
            return Err(MediaError("camera permission denied".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            LocalTrack {
                kind: MediaKind::Video,
                id: "video0".into(),
                stream_id: "cam".into(),
            },
            LocalTrack {
                kind: MediaKind::Audio,
                id: "audio0".into(),
                stream_id: "cam".into(),
            },
        ])
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn config() -> SessionConfig {
    SessionConfig {
        ice_servers: Vec::new(),
        ..Default::default()
    }
}

pub fn bare_offer() -> String {
    serde_json::to_string(&Descriptor::offer(OFFER_SDP)).unwrap()
}

pub fn bare_answer() -> String {
    serde_json::to_string(&Descriptor::answer(ANSWER_SDP)).unwrap()
}

pub async fn wait_for(session: &Session, state: LifecycleState) {
    let mut rx = session.watch_lifecycle();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok());
    assert_eq!(
        reached,
        Ok(true),
        "session never reached {state:?}, stuck in {:?}",
        session.lifecycle()
    );
}

/// Сессия камеры с опубликованным offer, ждёт answer.
pub async fn published_initiator(engine: Arc<ScriptedEngine>, config: SessionConfig) -> Session {
    let session = Session::initiator(config, engine.clone(), FakeMedia::new());
    session.start().await.unwrap();
    engine.complete_gathering();
    wait_for(&session, LifecycleState::AwaitingRemoteDescriptor).await;
    session
}

pub async fn connected_initiator(engine: Arc<ScriptedEngine>, config: SessionConfig) -> Session {
    let session = published_initiator(engine.clone(), config).await;
    session.consume_remote_descriptor(&bare_answer()).await.unwrap();
    engine.connect(ConnectionSignal::Connected);
    wait_for(&session, LifecycleState::Connected).await;
    session
}

pub async fn connected_responder(engine: Arc<ScriptedEngine>, config: SessionConfig) -> Session {
    let session = Session::responder(config, engine.clone());
    session.start().await.unwrap();
    session.consume_remote_descriptor(&bare_offer()).await.unwrap();
    engine.complete_gathering();
    wait_for(&session, LifecycleState::Negotiating).await;
    engine.connect(ConnectionSignal::Connected);
    wait_for(&session, LifecycleState::Connected).await;
    session
}
