/**
 * ADMISSION - Token buckets anti-flood par device et par IP source
 *
 * RÔLE : Borne le débit de frames accepté par device (un capteur fou ne
 * doit pas saturer le pipeline) et par IP source (identités spoofées).
 * L'excédent est jeté avec compteur + log échantillonné.
 */

use crate::config::AdmissionConf;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::warn;

/// Un log de drop sur N pour ne pas noyer le journal sous un flood
const DROP_LOG_SAMPLE: u64 = 100;

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        Self { tokens: burst, last_refill: Instant::now() }
    }

    fn try_take(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct Admission {
    conf: AdmissionConf,
    devices: Mutex<HashMap<String, TokenBucket>>,
    ips: Mutex<HashMap<IpAddr, TokenBucket>>,
    drops: AtomicU64,
}

impl Admission {
    pub fn new(conf: AdmissionConf) -> Self {
        Self {
            conf,
            devices: Mutex::new(HashMap::new()),
            ips: Mutex::new(HashMap::new()),
            drops: AtomicU64::new(0),
        }
    }

    /// true si la frame du device passe le bucket, false = à jeter
    pub fn admit_device(&self, device_id: &str) -> bool {
        let mut buckets = self.devices.lock();
        let bucket = buckets
            .entry(device_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.conf.device_burst));
        let ok = bucket.try_take(self.conf.device_rate_per_sec, self.conf.device_burst);
        if !ok {
            self.count_drop(&format!("device {}", device_id));
        }
        ok
    }

    /// true si la frame de cette IP source passe le bucket
    pub fn admit_ip(&self, ip: IpAddr) -> bool {
        let mut buckets = self.ips.lock();
        let bucket =
            buckets.entry(ip).or_insert_with(|| TokenBucket::new(self.conf.ip_burst));
        let ok = bucket.try_take(self.conf.ip_rate_per_sec, self.conf.ip_burst);
        if !ok {
            self.count_drop(&format!("ip {}", ip));
        }
        ok
    }

    fn count_drop(&self, what: &str) {
        let n = self.drops.fetch_add(1, Ordering::Relaxed);
        if n % DROP_LOG_SAMPLE == 0 {
            warn!("[admission] rate limit drop for {} ({} drops total)", what, n + 1);
        }
    }
}
