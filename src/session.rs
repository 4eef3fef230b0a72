use crate::config::SessionConfig;
use crate::error::{EngineError, SessionError};
use crate::logger::dump_selected_pair;
use crate::peer::codec;
use crate::peer::engine::{MediaSource, TransportEngine};
use crate::peer::ice::{analyze_candidates, DescriptorGatherer};
use crate::peer::state::{self, Input};
use crate::peer::stats::SamplerHandle;
use crate::peer::types::{
    ConnectionSignal, Descriptor, DescriptorPayload, EngineSignal, LifecycleState,
    LinkHealthSnapshot, Role, SessionNotice,
};
use crate::utils::{random_id, sdp_fingerprint};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NOTICE_CAPACITY: usize = 64;

/// Финальный локальный дескриптор, готовый к ручной передаче
#[derive(Debug, Clone)]
struct LocalDescriptor {
    descriptor: Descriptor,
    text: String,
    fingerprint: String,
}

#[derive(Debug)]
struct Core {
    lifecycle: LifecycleState,
    gatherer: DescriptorGatherer,
    local: Option<LocalDescriptor>,
    remote: Option<Descriptor>,
    session_id: Option<String>,
    /// Сигналы соединения, пришедшие до `Negotiating`, в порядке прихода.
    deferred: VecDeque<ConnectionSignal>,
    failure: Option<SessionError>,
}

struct Inner {
    role: Role,
    config: SessionConfig,
    engine: Arc<dyn TransportEngine>,
    sampling_enabled: bool,
    core: Mutex<Core>,
    lifecycle_tx: watch::Sender<LifecycleState>,
    health_tx: watch::Sender<Option<LinkHealthSnapshot>>,
    notices: broadcast::Sender<SessionNotice>,
    sampler: Mutex<Option<SamplerHandle>>,
}

/// Одно согласование между этой стороной и одним удалённым пиром.
///
/// Сессия владеет своим транспортным движком. Дескрипторы переносятся вручную:
/// [`Session::local_descriptor_text`] копируется, текст другой стороны
/// передаётся в [`Session::consume_remote_descriptor`].
/// Переподключения нет: после терминального состояния нужна новая сессия.
pub struct Session {
    inner: Arc<Inner>,
    media: Option<Arc<dyn MediaSource>>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<EngineSignal>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Session {
    /// Камера. Захватывает `media` в [`Session::start`] и создаёт offer.
    pub fn initiator(
        config: SessionConfig,
        engine: Arc<dyn TransportEngine>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        Self::new(Role::Initiator, config, engine, Some(media))
    }

    /// Зритель. Ждёт offer и создаёт answer.
    pub fn responder(config: SessionConfig, engine: Arc<dyn TransportEngine>) -> Self {
        Self::new(Role::Responder, config, engine, None)
    }

    pub fn new(
        role: Role,
        config: SessionConfig,
        engine: Arc<dyn TransportEngine>,
        media: Option<Arc<dyn MediaSource>>,
    ) -> Self {
        let signals = engine.take_signals();
        if signals.is_none() {
            warn!("Transport engine signal stream already taken; session will not start");
        }

        let session_id = match role {
            Role::Initiator => Some(random_id()),
            Role::Responder => None,
        };
        let sampling_enabled = config
            .sample_link_health
            .unwrap_or_else(|| role.samples_by_default());

        let (lifecycle_tx, _) = watch::channel(LifecycleState::Idle);
        let (health_tx, _) = watch::channel(None);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let inner = Inner {
            role,
            config,
            engine,
            sampling_enabled,
            core: Mutex::new(Core {
                lifecycle: LifecycleState::Idle,
                gatherer: DescriptorGatherer::new(),
                local: None,
                remote: None,
                session_id,
                deferred: VecDeque::new(),
                failure: None,
            }),
            lifecycle_tx,
            health_tx,
            notices,
            sampler: Mutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
            media,
            signals: Mutex::new(signals),
            pump: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Генерирует инициатор, ответчик берёт его из offer.
    pub fn session_id(&self) -> Option<String> {
        self.inner.core.lock().session_id.clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.core.lock().lifecycle
    }

    pub fn watch_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lifecycle_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    /// Причина провала или разрыва, если он был.
    pub fn failure(&self) -> Option<SessionError> {
        self.inner.core.lock().failure.clone()
    }

    /// Текст для другой стороны; `None`, пока сбор не завершён.
    pub fn local_descriptor_text(&self) -> Option<String> {
        self.inner.core.lock().local.as_ref().map(|l| l.text.clone())
    }

    pub fn local_descriptor(&self) -> Option<Descriptor> {
        self.inner
            .core
            .lock()
            .local
            .as_ref()
            .map(|l| l.descriptor.clone())
    }

    /// Короткий хэш локального SDP, чтобы продиктовать его другой стороне.
    pub fn local_fingerprint(&self) -> Option<String> {
        self.inner
            .core
            .lock()
            .local
            .as_ref()
            .map(|l| l.fingerprint.clone())
    }

    pub fn remote_descriptor(&self) -> Option<Descriptor> {
        self.inner.core.lock().remote.clone()
    }

    /// Последний снимок качества канала, если замер включён.
    pub fn latest_link_health(&self) -> Option<LinkHealthSnapshot> {
        self.inner.health_tx.borrow().clone()
    }

    pub fn watch_link_health(&self) -> watch::Receiver<Option<LinkHealthSnapshot>> {
        self.inner.health_tx.subscribe()
    }

    /// `Idle → Initializing`. Инициатор затем захватывает медиа и создаёт offer,
    /// ответчик ждёт [`Session::consume_remote_descriptor`].
    ///
    /// Возвращается после применения локального дескриптора, а не после сбора
    /// кандидатов; для этого есть [`Session::await_local_descriptor`].
    pub async fn start(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.advance(Input::Start).await.is_none() {
            return Err(SessionError::InvalidState(self.lifecycle()));
        }
        info!("{:?} session started", inner.role);

        let signals = self.signals.lock().take();
        let Some(mut signals) = signals else {
            return Err(inner
                .fault(SessionError::Engine("engine signal stream unavailable".into()))
                .await);
        };
        let pump_inner = Arc::clone(inner);
        let pump = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                pump_inner.on_signal(signal).await;
            }
            debug!("Engine signal stream ended");
        });
        *self.pump.lock() = Some(pump);

        if inner.role == Role::Responder {
            return Ok(());
        }

        let acquired = match &self.media {
            Some(media) => media
                .acquire()
                .await
                .map_err(|e| SessionError::MediaAcquisitionFailed(e.0)),
            None => Err(SessionError::MediaAcquisitionFailed(
                "no media source configured".into(),
            )),
        };
        let tracks = match acquired {
            Ok(tracks) => tracks,
            Err(err) => {
                error!("Local media unavailable: {err}");
                inner.transition(Input::MediaFailed, Some(err.clone())).await;
                return Err(err);
            }
        };
        info!("Acquired {} local track(s)", tracks.len());

        for track in &tracks {
            if let Err(e) = inner.engine.add_local_track(track).await {
                return Err(inner.fault(SessionError::Engine(e.to_string())).await);
            }
        }

        inner.produce_local_descriptor().await
    }

    /// Ждёт текст локального дескриптора после завершения сбора.
    /// Необязательный срок ограничивает время сбора.
    pub async fn await_local_descriptor(
        &self,
        deadline: Option<Duration>,
    ) -> Result<String, SessionError> {
        let mut rx = self.inner.lifecycle_tx.subscribe();
        let wait = async {
            loop {
                if let Some(text) = self.local_descriptor_text() {
                    return Ok(text);
                }
                let state = *rx.borrow_and_update();
                if state.is_terminal() {
                    return Err(SessionError::Closed(state));
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::Closed(self.lifecycle()));
                }
            }
        };

        match deadline {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| SessionError::GatheringTimedOut)?,
            None => wait.await,
        }
    }

    /// Принимает текст дескриптора другой стороны.
    ///
    /// Битый текст сессию не меняет, его можно вставить заново.
    /// После первого успешного вызова все следующие возвращают
    /// [`SessionError::AlreadyConsumed`].
    pub async fn consume_remote_descriptor(&self, text: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        let role = inner.role;
        {
            let core = inner.core.lock();
            if core.remote.is_some() {
                return Err(SessionError::AlreadyConsumed);
            }
            if core.lifecycle != role.accepting_state() {
                return Err(SessionError::InvalidState(core.lifecycle));
            }
        }

        let payload = codec::dec(text)?;
        if payload.sdp.kind != role.remote_kind() {
            return Err(SessionError::MalformedDescriptor(format!(
                "expected {:?}, got {:?}",
                role.remote_kind(),
                payload.sdp.kind
            )));
        }
        info!(
            "Remote {:?} decoded: id={:?} candidates={}",
            payload.sdp.kind,
            payload.id,
            payload.sdp.candidate_count()
        );

        if let Err(e) = inner.engine.set_remote_descriptor(payload.sdp.clone()).await {
            let reason = match e {
                EngineError::Rejected(r) | EngineError::Internal(r) => r,
            };
            return Err(inner.fault(SessionError::RejectedDescriptor(reason)).await);
        }

        {
            let mut core = inner.core.lock();
            core.remote = Some(payload.sdp);
            match (role, payload.id.is_empty()) {
                (Role::Responder, false) => core.session_id = Some(payload.id),
                (Role::Responder, true) => core.session_id = Some(random_id()),
                (Role::Initiator, false) if core.session_id.as_deref() != Some(payload.id.as_str()) => {
                    warn!(
                        "Answer belongs to session {}, ours is {:?}",
                        payload.id, core.session_id
                    );
                }
                (Role::Initiator, _) => {}
            }
        }

        if inner.advance(Input::RemoteAccepted).await.is_none() {
            return Err(SessionError::Closed(self.lifecycle()));
        }

        if role == Role::Responder {
            inner.produce_local_descriptor().await?;
        }
        Ok(())
    }

    /// Останавливает замеры и приём сигналов движка, закрывает движок
    /// и освобождает медиа. Выполняется один раз.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down {:?} session in {:?}", self.inner.role, self.lifecycle());

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }

        self.inner.advance(Input::Teardown).await;

        let sampler = self.inner.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop().await;
        }

        if let Err(e) = self.inner.engine.close().await {
            warn!("Failed to close transport engine: {e}");
        }
        if let Some(media) = &self.media {
            media.release();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        warn!("Session dropped without teardown");
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        if let Some(sampler) = self.inner.sampler.lock().take() {
            drop(sampler);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = Arc::clone(&self.inner.engine);
            handle.spawn(async move {
                let _ = engine.close().await;
            });
        }
        if let Some(media) = &self.media {
            media.release();
        }
    }
}

impl Inner {
    async fn advance(self: &Arc<Self>, input: Input) -> Option<LifecycleState> {
        self.transition(input, None).await
    }

    async fn fault(self: &Arc<Self>, err: SessionError) -> SessionError {
        error!("Session fault: {err}");
        self.transition(Input::Fault, Some(err.clone())).await;
        err
    }

    /// Прогоняет `input` через таблицу переходов и выполняет побочные эффекты
    /// каждого нового состояния. Автоматические шаги (выход из `ReadyToTransmit`,
    /// отложенные сигналы соединения) выполняются в этом же вызове.
    /// Возвращает последнее достигнутое состояние или `None`, если ничего не изменилось.
    async fn transition(
        self: &Arc<Self>,
        input: Input,
        cause: Option<SessionError>,
    ) -> Option<LifecycleState> {
        let mut pending = VecDeque::from([input]);
        let mut cause = cause;
        let mut reached = None;

        while let Some(input) = pending.pop_front() {
            let step = {
                let mut core = self.core.lock();
                let from = core.lifecycle;
                match state::next(self.role, from, input) {
                    Some(to) => {
                        core.lifecycle = to;
                        let failure = match (to, input) {
                            (LifecycleState::Failed, Input::Connection(_)) => {
                                Some(SessionError::TransportFailed)
                            }
                            (LifecycleState::Disconnected, _) => {
                                Some(SessionError::TransportDisconnected)
                            }
                            (LifecycleState::Failed, _) => cause.take(),
                            _ => None,
                        };

                        match to {
                            LifecycleState::ReadyToTransmit => pending.push_front(Input::Published),
                            LifecycleState::Negotiating => {
                                pending.extend(core.deferred.drain(..).map(Input::Connection))
                            }
                            _ => {}
                        }

                        self.lifecycle_tx.send_replace(to);
                        let _ = self.notices.send(SessionNotice::StateChanged(to));
                        if let Some(err) = failure {
                            if core.failure.is_none() {
                                core.failure = Some(err.clone());
                                let _ = self.notices.send(SessionNotice::Failure(err));
                            }
                        }
                        Some((from, to))
                    }
                    None => {
                        if let Input::Connection(signal) = input {
                            if state::is_deferred(from, signal) {
                                debug!("Holding {signal:?} until negotiation starts (now {from:?})");
                                core.deferred.push_back(signal);
                            }
                        }
                        None
                    }
                }
            };

            if let Some((from, to)) = step {
                info!("{:?}: {:?} -> {:?}", self.role, from, to);
                self.on_transition(from, to).await;
                reached = Some(to);
            }
        }
        reached
    }

    async fn on_transition(self: &Arc<Self>, from: LifecycleState, to: LifecycleState) {
        if from == LifecycleState::Connected {
            let sampler = self.sampler.lock().take();
            if let Some(sampler) = sampler {
                sampler.stop().await;
            }
        }

        if to == LifecycleState::Connected && self.sampling_enabled {
            self.start_sampler();
        }

        if matches!(to, LifecycleState::Failed | LifecycleState::Disconnected)
            && matches!(from, LifecycleState::Negotiating | LifecycleState::Connected)
        {
            let reports = self.engine.statistics().await;
            dump_selected_pair(&reports, "BEFORE-FAIL");
        }
    }

    fn start_sampler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = SamplerHandle::spawn(
            Arc::clone(&self.engine),
            self.config.sampling_interval(),
            move |snapshot| {
                weak.upgrade()
                    .is_some_and(|inner| inner.publish_health(snapshot))
            },
        );
        info!(
            "Link health sampler started, every {:?}",
            self.config.sampling_interval()
        );
        // Заменённый хэндл при drop прерывает свою задачу
        let _ = self.sampler.lock().replace(handle);
    }

    /// Публикует снимок только в `Connected`; `false` останавливает замер.
    fn publish_health(&self, snapshot: LinkHealthSnapshot) -> bool {
        let core = self.core.lock();
        if core.lifecycle != LifecycleState::Connected {
            return false;
        }
        self.health_tx.send_replace(Some(snapshot.clone()));
        let _ = self.notices.send(SessionNotice::LinkHealth(snapshot));
        true
    }

    async fn on_signal(self: &Arc<Self>, signal: EngineSignal) {
        match signal {
            EngineSignal::Gathering(progress) => {
                let completed = self.core.lock().gatherer.observe(progress);
                if completed {
                    info!("ICE candidate gathering completed");
                    self.try_finalize().await;
                }
            }
            EngineSignal::Connection(ConnectionSignal::Connecting) => {
                debug!("Transport connecting");
            }
            EngineSignal::Connection(signal) => {
                info!("Transport reported {signal:?}");
                self.advance(Input::Connection(signal)).await;
            }
            EngineSignal::RemoteTrack(kind) => {
                info!("Received remote {kind:?} track");
                let _ = self.notices.send(SessionNotice::RemoteTrack(kind));
            }
        }
    }

    async fn produce_local_descriptor(self: &Arc<Self>) -> Result<(), SessionError> {
        info!("Creating local {:?}...", self.role.local_kind());
        let descriptor = match self.engine.create_local_descriptor(self.role).await {
            Ok(d) => d,
            Err(e) => return Err(self.fault(SessionError::Engine(e.to_string())).await),
        };
        if let Err(e) = self.engine.set_local_descriptor(descriptor).await {
            return Err(self.fault(SessionError::Engine(e.to_string())).await);
        }

        if self.advance(Input::LocalDescriptorApplied).await.is_none() {
            let state = self.core.lock().lifecycle;
            return Err(SessionError::Closed(state));
        }
        info!("Waiting for ICE candidates...");
        // сбор мог закончиться, пока дескриптор применялся
        self.try_finalize().await;
        Ok(())
    }

    /// Забирает локальный дескриптор движка, если сбор завершён и сессия его ждёт.
    /// Срабатывает только у первого вызвавшего.
    async fn try_finalize(self: &Arc<Self>) {
        {
            let core = self.core.lock();
            if core.lifecycle != LifecycleState::GatheringLocalDescriptor
                || !core.gatherer.is_complete()
                || core.local.is_some()
            {
                return;
            }
        }

        let Some(descriptor) = self.engine.current_local_descriptor().await else {
            self.fault(SessionError::Engine(
                "engine has no local descriptor after gathering".into(),
            ))
            .await;
            return;
        };

        let encoded = {
            let mut core = self.core.lock();
            if core.lifecycle != LifecycleState::GatheringLocalDescriptor || !core.gatherer.claim()
            {
                return;
            }
            let payload = DescriptorPayload {
                sdp: descriptor.clone(),
                id: core.session_id.clone().unwrap_or_default(),
                ts: chrono::Utc::now().timestamp(),
            };
            codec::enc(&payload, self.config.descriptor_format).map(|text| {
                core.local = Some(LocalDescriptor {
                    fingerprint: sdp_fingerprint(&descriptor.sdp),
                    descriptor: descriptor.clone(),
                    text,
                });
            })
        };

        match encoded {
            Ok(()) => {
                analyze_candidates(&descriptor);
                info!(
                    "Local {:?} ready with {} candidate(s)",
                    descriptor.kind,
                    descriptor.candidate_count()
                );
                let _ = self.notices.send(SessionNotice::LocalDescriptorReady);
                self.advance(Input::GatheringComplete).await;
            }
            Err(e) => {
                self.fault(SessionError::Engine(format!(
                    "cannot encode local descriptor: {e}"
                )))
                .await;
            }
        }
    }
}
