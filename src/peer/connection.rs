use crate::config::{IceServerConfig, SessionConfig};
use crate::error::EngineError;
use crate::peer::engine::TransportEngine;
use crate::peer::types::{
    ConnectionSignal, Descriptor, DescriptorKind, EngineSignal, GatheringState, LocalTrack,
    MediaKind, PairState, Role, StatsReport,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// [`TransportEngine`] поверх `webrtc::RTCPeerConnection`.
///
/// Колбэки peer connection превращаются в [`EngineSignal`] и складываются в очередь,
/// которую забирает сессия.
pub struct WebrtcEngine {
    pc: Arc<RTCPeerConnection>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<EngineSignal>>>,
    tracks: Mutex<Vec<(MediaKind, Arc<TrackLocalStaticSample>)>>,
}

impl WebrtcEngine {
    pub async fn new(config: &SessionConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // NACK, RTCP reports и stats interceptor: без него inbound-счётчики пустые
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let servers = config
            .resolved_ice_servers(chrono::Utc::now().timestamp())
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if config.turn_secret.is_some() {
            info!("Minted temporary TURN credentials for {} server(s)", servers.len());
        }

        let pc = Arc::new(api.new_peer_connection(rtc_config(&servers)).await?);

        let (tx, rx) = mpsc::unbounded_channel();
        attach_handlers(&pc, tx);

        Ok(Self {
            pc,
            signals: Mutex::new(Some(rx)),
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// Отправляет один уже закодированный сэмпл в локальный трек типа `kind`.
    pub async fn write_sample(
        &self,
        kind: MediaKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), EngineError> {
        let track = self
            .tracks
            .lock()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, t)| Arc::clone(t));
        let Some(track) = track else {
            return Err(EngineError::Internal(format!("no local {kind:?} track")));
        };
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, tx: mpsc::UnboundedSender<EngineSignal>) {
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        Box::pin(async move {
            match cand {
                Some(c) => {
                    if let Ok(init) = c.to_json() {
                        debug!(
                            "LOCAL candidate={} sdp_mid={:?} sdp_mline_index={:?}",
                            init.candidate, init.sdp_mid, init.sdp_mline_index
                        );
                    }
                }
                // cand == None означает конец сбора
                None => debug!("ICE candidate gathering completed (null candidate received)"),
            }
        })
    }));

    let gathering_tx = tx.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        debug!("ICE gathering state changed to: {:?}", state);
        let progress = match state {
            RTCIceGathererState::Gathering => Some(GatheringState::InProgress),
            RTCIceGathererState::Complete => Some(GatheringState::Complete),
            _ => None,
        };
        if let Some(progress) = progress {
            let _ = gathering_tx.send(EngineSignal::Gathering(progress));
        }
        Box::pin(async {})
    }));

    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        let signal = match st {
            RTCPeerConnectionState::Connecting => Some(ConnectionSignal::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionSignal::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionSignal::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionSignal::Failed),
            _ => None,
        };
        if let Some(signal) = signal {
            let _ = state_tx.send(EngineSignal::Connection(signal));
        }
        Box::pin(async {})
    }));

    let track_tx = tx;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = track_tx.send(EngineSignal::RemoteTrack(kind));
        }

        // Читаем RTP, иначе interceptor не считает inbound-статистику
        Box::pin(async move {
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    trace!(
                        "remote rtp seq={} len={}",
                        packet.header.sequence_number,
                        packet.payload.len()
                    );
                }
                debug!("Remote track {} ended", track.id());
            });
        })
    }));
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Проверка доступности ICE сервера: для STUN ждём srflx-кандидата, для TURN relay.
///
/// `false`, если сбор закончился или истёк `wait` без подходящего кандидата.
pub async fn check_ice_server_availability(
    server: &IceServerConfig,
    wait: Duration,
) -> Result<bool, EngineError> {
    let expected = if server.r#type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    };
    info!(
        "Checking {} server {} for '{}' candidates",
        server.r#type,
        add_ice_url_scheme(server),
        expected
    );

    let api = APIBuilder::new().build();
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: get_user_ice_servers(std::slice::from_ref(server)),
            ..Default::default()
        })
        .await?,
    );

    // true: нашёлся нужный кандидат, false: сбор закончился без него
    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match cand {
                Some(c) => {
                    if let Ok(init) = c.to_json() {
                        debug!("Check candidate: {}", init.candidate);
                        if init.candidate.contains(expected) {
                            let _ = tx.send(true);
                        }
                    }
                }
                None => {
                    let _ = tx.send(false);
                }
            }
        })
    }));

    // Data channel нужен, чтобы в offer была секция и начался сбор
    pc.create_data_channel("check", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let found = matches!(
        tokio::time::timeout(wait, rx.recv()).await,
        Ok(Some(true))
    );
    if found {
        info!("ICE server {} is available", server.id);
    } else {
        warn!("ICE server {} gave no '{}' candidate", server.id, expected);
    }

    if let Err(e) = pc.close().await {
        warn!("Failed to close check connection: {e}");
    }
    Ok(found)
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
    }
}

fn to_rtc(descriptor: Descriptor) -> Result<RTCSessionDescription, EngineError> {
    let parsed = match descriptor.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(descriptor.sdp),
        DescriptorKind::Answer => RTCSessionDescription::answer(descriptor.sdp),
    };
    parsed.map_err(|e| EngineError::Rejected(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Option<Descriptor> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(Descriptor::offer(desc.sdp)),
        RTCSdpType::Answer => Some(Descriptor::answer(desc.sdp)),
        other => {
            warn!("Ignoring local description of type {other:?}");
            None
        }
    }
}

fn pair_state(state: CandidatePairState) -> PairState {
    match state {
        CandidatePairState::Succeeded => PairState::Succeeded,
        CandidatePairState::InProgress => PairState::InProgress,
        CandidatePairState::Failed => PairState::Failed,
        _ => PairState::Waiting,
    }
}

#[async_trait]
impl TransportEngine for WebrtcEngine {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            track.stream_id.clone(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP нужно вычитывать, иначе не работают NACK и отчёты
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        self.tracks.lock().push((track.kind, local));
        info!("Added local {:?} track {}", track.kind, track.id);
        Ok(())
    }

    async fn create_local_descriptor(&self, role: Role) -> Result<Descriptor, EngineError> {
        let desc = match role {
            Role::Initiator => self.pc.create_offer(None).await?,
            Role::Responder => self.pc.create_answer(None).await?,
        };
        from_rtc(desc).ok_or_else(|| EngineError::Internal("unexpected descriptor type".into()))
    }

    async fn set_local_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError> {
        let desc = to_rtc(descriptor)?;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_descriptor(&self, descriptor: Descriptor) -> Result<(), EngineError> {
        let desc = to_rtc(descriptor)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))
    }

    async fn current_local_descriptor(&self) -> Option<Descriptor> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn statistics(&self) -> Vec<StatsReport> {
        let stats = self.pc.get_stats().await;
        let mut reports = Vec::new();

        for (_, v) in stats.reports {
            match v {
                StatsReportType::InboundRTP(inbound) => {
                    let kind: &str = &inbound.kind;
                    let kind = match kind {
                        "video" => MediaKind::Video,
                        "audio" => MediaKind::Audio,
                        _ => continue,
                    };
                    reports.push(StatsReport::InboundMedia {
                        kind,
                        bytes_received: inbound.bytes_received,
                        packets_received: inbound.packets_received,
                        // webrtc-rs не считает потери на приёме
                        packets_lost: 0,
                    });
                }
                StatsReportType::CandidatePair(pair) => {
                    reports.push(StatsReport::CandidatePair {
                        id: pair.id,
                        state: pair_state(pair.state),
                        nominated: pair.nominated,
                        round_trip_secs: pair.current_round_trip_time,
                        bytes_sent: pair.bytes_sent,
                        bytes_received: pair.bytes_received,
                    });
                }
                _ => {}
            }
        }
        reports
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<EngineSignal>> {
        self.signals.lock().take()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            IceServerConfig {
                id: "relay".into(),
                r#type: "turn".into(),
                url: "relay.example.org:3478".into(),
                username: Some("1700000000:webuser".into()),
                credential: Some("secret".into()),
            },
            IceServerConfig {
                id: "stun".into(),
                r#type: "stun".into(),
                url: "stun.example.org:3478".into(),
                username: None,
                credential: None,
            },
        ];
        let ice = get_user_ice_servers(&servers);
        assert_eq!(ice[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(ice[0].username, "1700000000:webuser");
        assert_eq!(ice[1].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(ice[1].credential.is_empty());
    }

    #[test]
    fn config_keeps_bundle_and_mux_policies() {
        let config = rtc_config(&crate::config::default_ice_servers());
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[tokio::test]
    async fn offer_gathers_and_finalizes() {
        let engine = WebrtcEngine::new(&SessionConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        })
        .await
        .unwrap();
        let mut signals = engine.take_signals().unwrap();
        assert!(engine.take_signals().is_none());

        engine
            .add_local_track(&LocalTrack {
                kind: MediaKind::Video,
                id: "video".into(),
                stream_id: "cam".into(),
            })
            .await
            .unwrap();

        let offer = engine.create_local_descriptor(Role::Initiator).await.unwrap();
        assert_eq!(offer.kind, DescriptorKind::Offer);
        engine.set_local_descriptor(offer).await.unwrap();

        let complete = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(signal) = signals.recv().await {
                if signal == EngineSignal::Gathering(GatheringState::Complete) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(complete);

        let local = engine.current_local_descriptor().await.unwrap();
        assert!(local.sdp.contains("m=video"));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_sample_needs_a_local_track() {
        let engine = WebrtcEngine::new(&SessionConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = engine
            .write_sample(MediaKind::Audio, Bytes::from_static(&[0xf8]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn turn_server_without_credentials_uses_secret() {
        let config = SessionConfig {
            ice_servers: vec![IceServerConfig {
                id: "relay".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478?transport=udp".into(),
                username: None,
                credential: None,
            }],
            turn_secret: Some(crate::config::TurnSecret {
                secret: "SUPER_LONG_RANDOM_SECRET_KEY".into(),
                user: "webuser".into(),
                ttl_secs: 3600,
            }),
            ..Default::default()
        };
        config.validate().unwrap();

        let engine = WebrtcEngine::new(&config).await.unwrap();
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_stun_server_is_reported_unavailable() {
        let server = IceServerConfig {
            id: "dead".into(),
            r#type: "stun".into(),
            url: "127.0.0.1:9".into(),
            username: None,
            credential: None,
        };
        let available = check_ice_server_availability(&server, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!available);
    }
}
