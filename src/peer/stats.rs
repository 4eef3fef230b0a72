//! Замер качества канала: разбор отчёта движка, перевод накопительных счётчиков
//! в скорости за тик и периодическая задача опроса.

use crate::peer::engine::TransportEngine;
use crate::peer::types::{LinkHealthSnapshot, MediaKind, PairState, StatsReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Суммы из одного набора отчётов.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Counters {
    pub video_bytes: u64,
    pub audio_bytes: u64,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub round_trip_secs: Option<f64>,
}

pub fn classify(reports: &[StatsReport]) -> Counters {
    let mut counters = Counters::default();
    let mut nominated_rtt = None;
    let mut succeeded_rtt = None;

    for report in reports {
        match report {
            StatsReport::InboundMedia {
                kind,
                bytes_received,
                packets_received,
                packets_lost,
            } => {
                match kind {
                    MediaKind::Video => counters.video_bytes += bytes_received,
                    MediaKind::Audio => counters.audio_bytes += bytes_received,
                }
                counters.packets_received += packets_received;
                // при дубликатах RTCP может дать отрицательные потери
                counters.packets_lost += (*packets_lost).max(0) as u64;
            }
            StatsReport::CandidatePair {
                state: PairState::Succeeded,
                nominated,
                round_trip_secs,
                ..
            } => {
                if *nominated && nominated_rtt.is_none() {
                    nominated_rtt = Some(*round_trip_secs);
                } else if succeeded_rtt.is_none() {
                    succeeded_rtt = Some(*round_trip_secs);
                }
            }
            StatsReport::CandidatePair { .. } => {}
        }
    }

    counters.round_trip_secs = nominated_rtt.or(succeeded_rtt);
    counters
}

/// `delta_bytes`, полученные за `interval`, в килобитах в секунду.
pub fn bitrate_kbps(delta_bytes: u64, interval: Duration) -> u64 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    ((delta_bytes as f64 * 8.0) / secs / 1000.0).round() as u64
}

/// Потери по накопительным суммам: `lost / (lost + received) * 100`.
pub fn packet_loss_percent(lost: u64, received: u64) -> f64 {
    let total = lost + received;
    if total == 0 {
        return 0.0;
    }
    lost as f64 * 100.0 / total as f64
}

fn round_trip_ms(secs: Option<f64>) -> u64 {
    match secs {
        Some(s) if s.is_finite() && s > 0.0 => (s * 1000.0).round() as u64,
        _ => 0,
    }
}

/// Превращает последовательные наборы отчётов в снимки.
///
/// Счётчики байт у движка накопительные: храним прошлую сумму по каждому типу
/// медиа и момент прошлого замера. Скорость считается по разнице байт за
/// реально прошедшее время; пропущенные тики в неё тоже попадают.
#[derive(Debug)]
pub struct LinkHealthSampler {
    interval: Duration,
    prev_video_bytes: u64,
    prev_audio_bytes: u64,
    prev_sample_at: Option<Instant>,
    ticks: u64,
}

impl LinkHealthSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            prev_video_bytes: 0,
            prev_audio_bytes: 0,
            prev_sample_at: None,
            ticks: 0,
        }
    }

    /// `now` это момент, когда получен `reports`. Для первого замера берётся
    /// настроенный интервал.
    pub fn observe(&mut self, reports: &[StatsReport], now: Instant) -> LinkHealthSnapshot {
        let counters = classify(reports);
        let elapsed = match self.prev_sample_at {
            Some(prev) => now.saturating_duration_since(prev),
            None => self.interval,
        };
        self.prev_sample_at = Some(now);

        let video_delta = delta(self.prev_video_bytes, counters.video_bytes);
        let audio_delta = delta(self.prev_audio_bytes, counters.audio_bytes);
        self.prev_video_bytes = counters.video_bytes;
        self.prev_audio_bytes = counters.audio_bytes;
        self.ticks += 1;

        let snapshot = LinkHealthSnapshot {
            sequence: self.ticks,
            captured_at: chrono::Utc::now(),
            video_kbps: bitrate_kbps(video_delta, elapsed),
            audio_kbps: bitrate_kbps(audio_delta, elapsed),
            packet_loss_percent: packet_loss_percent(
                counters.packets_lost,
                counters.packets_received,
            ),
            round_trip_ms: round_trip_ms(counters.round_trip_secs),
        };
        trace!("link health tick: {:?}", snapshot);
        snapshot
    }
}

// Счётчик пошёл назад: поток перезапущен.
fn delta(prev: u64, now: u64) -> u64 {
    if now >= prev {
        now - prev
    } else {
        now
    }
}

/// Запущенная задача замера. [`SamplerHandle::stop`] возвращается только
/// после выхода задачи.
pub(crate) struct SamplerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// `publish` возвращает `false`, когда сессия больше не принимает снимки.
    pub(crate) fn spawn<F>(engine: Arc<dyn TransportEngine>, period: Duration, publish: F) -> Self
    where
        F: Fn(LinkHealthSnapshot) -> bool + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut sampler = LinkHealthSampler::new(period);
            let mut ticker = interval_at(Instant::now() + period, period);
            // Пока идёт замер, следующий тик ждёт; опоздавшие тики выбрасываются
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let reports = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    reports = engine.statistics() => reports,
                };

                if !publish(sampler.observe(&reports, Instant::now())) {
                    break;
                }
                // после долгого замера следующий тик через полный период, а не сразу
                ticker.reset();
            }
            debug!("Link health sampler stopped");
        });

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
