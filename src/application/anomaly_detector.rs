use crate::config::AnomalyConfig;
use crate::domain::types::{AnomalyAlert, AnomalyLevel, MarketCondition};
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::{Data, Distribution};
use std::collections::VecDeque;

const HISTORY_CAPACITY: usize = 500;
const PAUSE_LOOKBACK_MINUTES: i64 = 5;

/// Per-cycle checks on spread, API latency, price spikes and volume spikes. Each check
/// is independent; callers aggregate the alerts and decide whether to pause trading.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    history: VecDeque<MarketCondition>,
    alerts: VecDeque<AnomalyAlert>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            alerts: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    fn alert(
        &mut self,
        kind: &str,
        level: AnomalyLevel,
        value: f64,
        threshold: f64,
        message: String,
        should_pause: bool,
    ) -> AnomalyAlert {
        let alert = AnomalyAlert {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            level,
            value,
            threshold,
            message,
            should_pause_trading: should_pause,
        };
        self.alerts.push_back(alert.clone());
        if self.alerts.len() > HISTORY_CAPACITY {
            self.alerts.pop_front();
        }
        alert
    }

    pub fn check_spread_anomaly(
        &mut self,
        bid: f64,
        ask: f64,
        last: f64,
    ) -> Option<AnomalyAlert> {
        if bid <= 0.0 || ask <= 0.0 || last <= 0.0 || ask <= bid {
            return Some(self.alert(
                "invalid_price",
                AnomalyLevel::Critical,
                ask - bid,
                0.0,
                "inverted or non-positive spread".to_string(),
                true,
            ));
        }
        let spread = (ask - bid) / last;
        if spread >= self.config.spread_critical_threshold {
            return Some(self.alert(
                "spread",
                AnomalyLevel::Critical,
                spread,
                self.config.spread_critical_threshold,
                format!("spread {spread:.5} at or above critical threshold"),
                true,
            ));
        }
        if spread >= self.config.spread_warning_threshold {
            return Some(self.alert(
                "spread",
                AnomalyLevel::Warning,
                spread,
                self.config.spread_warning_threshold,
                format!("spread {spread:.5} at or above warning threshold"),
                false,
            ));
        }
        None
    }

    pub fn check_api_latency_anomaly(&mut self, latency_ms: i64) -> Option<AnomalyAlert> {
        if latency_ms < 0 {
            return Some(self.alert(
                "latency",
                AnomalyLevel::Critical,
                latency_ms as f64,
                0.0,
                "negative latency reading".to_string(),
                true,
            ));
        }
        if latency_ms >= self.config.latency_critical_ms {
            return Some(self.alert(
                "latency",
                AnomalyLevel::Critical,
                latency_ms as f64,
                self.config.latency_critical_ms as f64,
                format!("latency {latency_ms}ms at or above critical threshold"),
                true,
            ));
        }
        if latency_ms >= self.config.latency_warning_ms {
            return Some(self.alert(
                "latency",
                AnomalyLevel::Warning,
                latency_ms as f64,
                self.config.latency_warning_ms as f64,
                format!("latency {latency_ms}ms at or above warning threshold"),
                false,
            ));
        }
        None
    }

    fn check_spike(
        &mut self,
        kind: &str,
        window: &[f64],
        current: f64,
    ) -> Option<AnomalyAlert> {
        if window.len() < self.config.min_history_for_spike_check {
            return None;
        }
        let returns: Vec<f64> = window
            .windows(2)
            .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect();
        if returns.is_empty() {
            return None;
        }
        let r_now = {
            let prev = *window.last().unwrap();
            if prev != 0.0 { (current - prev) / prev } else { 0.0 }
        };
        let data = Data::new(returns);
        let mean = data.mean().unwrap_or(0.0);
        let std_dev = data.std_dev().unwrap_or(0.0);

        if std_dev == 0.0 {
            if r_now.abs() > 0.001 {
                return Some(self.alert(
                    &format!("{kind}_zero_volatility"),
                    AnomalyLevel::Warning,
                    r_now,
                    0.001,
                    format!("{kind} moved with zero historical volatility"),
                    false,
                ));
            }
            return None;
        }

        let z = (r_now - mean) / std_dev;
        if z.abs() >= self.config.spike_zscore_threshold {
            return Some(self.alert(
                kind,
                AnomalyLevel::Warning,
                z,
                self.config.spike_zscore_threshold,
                format!("{kind} z-score {z:.2} exceeds threshold"),
                false,
            ));
        }
        None
    }

    pub fn check_price_spike_anomaly(&mut self, prices: &[f64], current: f64) -> Option<AnomalyAlert> {
        self.check_spike("price_spike", prices, current)
    }

    pub fn check_volume_anomaly(&mut self, volumes: &[f64], current: f64) -> Option<AnomalyAlert> {
        self.check_spike("volume_spike", volumes, current)
    }

    /// Runs every independent check for one market sample and records it into history.
    pub fn comprehensive_anomaly_check(
        &mut self,
        sample: MarketCondition,
        price_history: &[f64],
        volume_history: &[f64],
    ) -> Vec<AnomalyAlert> {
        let bid = sample.bid.to_f64().unwrap_or(0.0);
        let ask = sample.ask.to_f64().unwrap_or(0.0);
        let last = sample.last.to_f64().unwrap_or(0.0);
        let volume = sample.volume.to_f64().unwrap_or(0.0);

        self.history.push_back(sample);
        if self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }

        let mut alerts = Vec::new();
        alerts.extend(self.check_spread_anomaly(bid, ask, last));
        alerts.extend(self.check_api_latency_anomaly(sample.api_latency_ms));
        alerts.extend(self.check_price_spike_anomaly(price_history, last));
        alerts.extend(self.check_volume_anomaly(volume_history, volume));
        alerts
    }

    /// Scans the last 5 minutes of recorded alerts for a critical, pause-worthy one.
    pub fn should_pause_trading(&self) -> (bool, Vec<String>) {
        let cutoff = Utc::now() - Duration::minutes(PAUSE_LOOKBACK_MINUTES);
        let reasons: Vec<String> = self
            .alerts
            .iter()
            .filter(|a| {
                a.timestamp >= cutoff && a.level == AnomalyLevel::Critical && a.should_pause_trading
            })
            .map(|a| a.message.clone())
            .collect();
        (!reasons.is_empty(), reasons)
    }

    pub fn statistics(&self) -> AnomalyStatistics {
        let cutoff = Utc::now() - Duration::hours(24);
        let recent: Vec<&AnomalyAlert> = self.alerts.iter().filter(|a| a.timestamp >= cutoff).collect();
        let critical = recent.iter().filter(|a| a.level == AnomalyLevel::Critical).count();
        let warning = recent.iter().filter(|a| a.level == AnomalyLevel::Warning).count();
        let (should_pause, pause_reasons) = self.should_pause_trading();
        AnomalyStatistics {
            total_alerts: self.alerts.len(),
            recent_alerts_24h: recent.len(),
            critical_alerts_24h: critical,
            warning_alerts_24h: warning,
            should_pause,
            pause_reasons,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyStatistics {
    pub total_alerts: usize,
    pub recent_alerts_24h: usize,
    pub critical_alerts_24h: usize,
    pub warning_alerts_24h: usize,
    pub should_pause: bool,
    pub pause_reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default())
    }

    #[test]
    fn inverted_spread_is_critical_and_pauses() {
        let mut d = detector();
        let alert = d.check_spread_anomaly(100.0, 99.0, 100.0).unwrap();
        assert_eq!(alert.level, AnomalyLevel::Critical);
        assert!(alert.should_pause_trading);
    }

    #[test]
    fn spread_exactly_at_critical_threshold_is_critical() {
        // boundary is inclusive (>=, not >)
        let mut d = detector();
        let last = 100.0;
        let bid = 99.0;
        let ask = bid + last * d.config.spread_critical_threshold;
        let alert = d.check_spread_anomaly(bid, ask, last).unwrap();
        assert_eq!(alert.level, AnomalyLevel::Critical);
    }

    #[test]
    fn spread_below_warning_is_none() {
        let mut d = detector();
        assert!(d.check_spread_anomaly(99.99, 100.0, 100.0).is_none());
    }

    #[test]
    fn negative_latency_is_critical() {
        let mut d = detector();
        let alert = d.check_api_latency_anomaly(-1).unwrap();
        assert_eq!(alert.level, AnomalyLevel::Critical);
    }

    #[test]
    fn latency_warning_band() {
        let mut d = detector();
        let alert = d.check_api_latency_anomaly(1500).unwrap();
        assert_eq!(alert.level, AnomalyLevel::Warning);
    }

    #[test]
    fn price_spike_needs_minimum_history() {
        let mut d = detector();
        let prices = vec![100.0; 5];
        assert!(d.check_price_spike_anomaly(&prices, 200.0).is_none());
    }

    #[test]
    fn price_spike_detected_on_large_zscore() {
        let mut d = detector();
        let prices: Vec<f64> = (0..12).map(|i| 100.0 + (i % 2) as f64 * 0.01).collect();
        let alert = d.check_price_spike_anomaly(&prices, 500.0);
        assert!(alert.is_some());
        assert_eq!(alert.unwrap().level, AnomalyLevel::Warning);
    }

    #[test]
    fn should_pause_reflects_recent_critical_alerts() {
        let mut d = detector();
        d.check_spread_anomaly(100.0, 99.0, 100.0);
        let (pause, reasons) = d.should_pause_trading();
        assert!(pause);
        assert!(!reasons.is_empty());
    }
}
