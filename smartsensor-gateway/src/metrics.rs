/**
 * MÉTRIQUES - Compteurs internes + rendu Prometheus text format
 *
 * RÔLE : Compteurs atomiques partagés entre tous les composants, exposés
 * sur GET /metrics. Pas de dépendance à un collecteur externe : le format
 * texte Prometheus est rendu à la main depuis les atomics.
 *
 * UTILITÉ : backpressure, pertes, et santé du sink visibles d'un coup d'œil.
 */

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const LATENCY_WINDOW: usize = 1024;

/// Compteurs globaux de la gateway. Tous les champs sont des atomics :
/// incréments lock-free depuis n'importe quelle task.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // ingestion
    pub ingest_frames_mqtt: AtomicU64,
    pub ingest_frames_http: AtomicU64,
    pub ingest_rejected_decode: AtomicU64,
    pub ingest_rejected_auth: AtomicU64,
    pub ingest_rejected_rate: AtomicU64,
    pub ingest_rejected_backpressure: AtomicU64,
    pub readings_invalid: AtomicU64,
    pub readings_suspect: AtomicU64,

    // sink durable
    pub durable_wab_depth: AtomicI64,
    pub durable_flushed_total: AtomicU64,
    pub durable_flush_errors: AtomicU64,
    /// Unix secs du dernier append acquitté par le store (readyz)
    pub durable_last_write_unix: AtomicI64,
    /// Fenêtre glissante des latences de flush, en nanosecondes
    pub flush_latency_ns: Mutex<Vec<u64>>,

    // abonnés
    pub subscribers_connected: AtomicI64,
    pub subscriber_dropped_frames: AtomicU64,
    pub ws_closed_slow: AtomicU64,
    pub ws_closed_auth: AtomicU64,
    pub ws_closed_ping_timeout: AtomicU64,
    pub ws_closed_shutdown: AtomicU64,

    // alertes
    pub alerts_open_info: AtomicI64,
    pub alerts_open_warning: AtomicI64,
    pub alerts_open_critical: AtomicI64,
    pub alerts_dead_letter: AtomicU64,

    // shutdown
    pub shutdown_lost_readings: AtomicU64,
}

fn percentile_ns(values: &[u64], pct: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut v = values.to_vec();
    v.sort_unstable();
    let idx = ((v.len() as f64 - 1.0) * pct).round() as usize;
    v[idx]
}

impl GatewayMetrics {
    pub fn record_flush_latency(&self, ns: u64) {
        let mut w = self.flush_latency_ns.lock();
        if w.len() >= LATENCY_WINDOW {
            w.remove(0);
        }
        w.push(ns);
    }

    /// Rend la section "gateway" du format texte Prometheus. Les sections
    /// par-shard et par-abonné sont ajoutées par le pipeline et le hub.
    pub fn render_into(&self, out: &mut String) {
        use std::fmt::Write;
        let c = |v: &AtomicU64| v.load(Ordering::Relaxed);
        let g = |v: &AtomicI64| v.load(Ordering::Relaxed);

        let _ = write!(
            out,
            "ingest_frames_total{{source=\"mqtt\"}} {}\n\
             ingest_frames_total{{source=\"http\"}} {}\n\
             ingest_rejected_total{{reason=\"decode\"}} {}\n\
             ingest_rejected_total{{reason=\"auth\"}} {}\n\
             ingest_rejected_total{{reason=\"rate_limit\"}} {}\n\
             ingest_rejected_total{{reason=\"backpressure\"}} {}\n\
             readings_invalid_total {}\n\
             readings_suspect_total {}\n\
             durable_wab_depth {}\n\
             durable_flushed_total {}\n\
             durable_flush_errors_total {}\n\
             subscribers_connected {}\n\
             subscriber_dropped_frames_total {}\n\
             ws_closed_total{{reason=\"slow\"}} {}\n\
             ws_closed_total{{reason=\"auth\"}} {}\n\
             ws_closed_total{{reason=\"ping_timeout\"}} {}\n\
             ws_closed_total{{reason=\"shutdown\"}} {}\n\
             alerts_open{{severity=\"info\"}} {}\n\
             alerts_open{{severity=\"warning\"}} {}\n\
             alerts_open{{severity=\"critical\"}} {}\n\
             alerts_dead_letter_total {}\n\
             shutdown_lost_readings_total {}\n",
            c(&self.ingest_frames_mqtt),
            c(&self.ingest_frames_http),
            c(&self.ingest_rejected_decode),
            c(&self.ingest_rejected_auth),
            c(&self.ingest_rejected_rate),
            c(&self.ingest_rejected_backpressure),
            c(&self.readings_invalid),
            c(&self.readings_suspect),
            g(&self.durable_wab_depth),
            c(&self.durable_flushed_total),
            c(&self.durable_flush_errors),
            g(&self.subscribers_connected),
            c(&self.subscriber_dropped_frames),
            c(&self.ws_closed_slow),
            c(&self.ws_closed_auth),
            c(&self.ws_closed_ping_timeout),
            c(&self.ws_closed_shutdown),
            g(&self.alerts_open_info),
            g(&self.alerts_open_warning),
            g(&self.alerts_open_critical),
            c(&self.alerts_dead_letter),
            c(&self.shutdown_lost_readings),
        );

        let lat = self.flush_latency_ns.lock();
        for (q, label) in [(0.5, "0.5"), (0.95, "0.95"), (0.99, "0.99")] {
            let ns = percentile_ns(&lat, q);
            let _ = write!(
                out,
                "durable_flush_latency_seconds{{quantile=\"{}\"}} {:.6}\n",
                label,
                ns as f64 / 1e9
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn renders_counter_names() {
        let m = GatewayMetrics::default();
        m.ingest_frames_mqtt.store(42, Ordering::Relaxed);
        m.durable_wab_depth.store(7, Ordering::Relaxed);
        m.record_flush_latency(2_000_000);

        let mut out = String::new();
        m.render_into(&mut out);
        assert!(out.contains("ingest_frames_total{source=\"mqtt\"} 42"));
        assert!(out.contains("durable_wab_depth 7"));
        assert!(out.contains("durable_flush_latency_seconds{quantile=\"0.99\"}"));
        assert!(out.contains("shutdown_lost_readings_total 0"));
    }

    #[test]
    fn percentile_of_empty_window_is_zero() {
        assert_eq!(percentile_ns(&[], 0.99), 0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let m = GatewayMetrics::default();
        for i in 0..(LATENCY_WINDOW + 100) {
            m.record_flush_latency(i as u64);
        }
        assert_eq!(m.flush_latency_ns.lock().len(), LATENCY_WINDOW);
    }
}
