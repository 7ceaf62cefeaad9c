//! Vital-sign risk monitoring
//!
//! Readings arrive one second apart. Each is turned into a feature vector,
//! labelled by an opaque classifier, and fed to a [`DebouncedTrigger`]; when
//! the trigger fires every attending doctor gets an alert.

use crate::trigger::{DebouncedTrigger, Severity, TriggerConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Heart-rate window used for the variability feature.
const HRV_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalReading {
    pub heart_rate: f64,
    pub respiratory_rate: f64,
    pub body_temperature: f64,
    pub oxygen_saturation: f64,
    pub systolic_bp: f64,
    pub diastolic_bp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub age: u32,
    pub gender: Gender,
    pub weight_kg: f64,
    pub height_m: f64,
}

impl Default for Demographics {
    fn default() -> Self {
        Self {
            age: 30,
            gender: Gender::Male,
            weight_kg: 70.0,
            height_m: 1.7,
        }
    }
}

/// Classifier input: the raw reading, demographics, and derived features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub reading: VitalReading,
    pub demographics: Demographics,
    pub hrv: f64,
    pub pulse_pressure: f64,
    pub bmi: f64,
    pub map: f64,
}

/// Derives features, keeping the short heart-rate history HRV needs.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    demographics: Demographics,
    heart_rates: VecDeque<f64>,
}

impl FeatureBuilder {
    pub fn new(demographics: Demographics) -> Self {
        Self {
            demographics,
            heart_rates: VecDeque::with_capacity(HRV_WINDOW),
        }
    }

    pub fn push(&mut self, reading: &VitalReading) -> FeatureVector {
        self.heart_rates.push_back(reading.heart_rate);
        if self.heart_rates.len() > HRV_WINDOW {
            self.heart_rates.pop_front();
        }

        let hrv = if self.heart_rates.len() == HRV_WINDOW {
            sample_std(self.heart_rates.iter().copied())
        } else {
            0.0
        };

        let d = &self.demographics;
        FeatureVector {
            reading: *reading,
            demographics: *d,
            hrv,
            pulse_pressure: reading.systolic_bp - reading.diastolic_bp,
            bmi: d.weight_kg / (d.height_m * d.height_m),
            map: (reading.systolic_bp + 2.0 * reading.diastolic_bp) / 3.0,
        }
    }
}

fn sample_std(values: impl ExactSizeIterator<Item = f64> + Clone) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLabel {
    #[serde(rename = "Low Risk")]
    LowRisk,
    #[serde(rename = "High Risk")]
    HighRisk,
}

/// A trained risk model, treated as a black box.
pub trait RiskClassifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> RiskLabel;
}

/// Flags any vital outside its normal adult range.
#[derive(Debug, Clone)]
pub struct RangeClassifier {
    pub heart_rate: RangeInclusive<f64>,
    pub respiratory_rate: RangeInclusive<f64>,
    pub body_temperature: RangeInclusive<f64>,
    pub oxygen_saturation: RangeInclusive<f64>,
    pub systolic_bp: RangeInclusive<f64>,
    pub diastolic_bp: RangeInclusive<f64>,
}

impl Default for RangeClassifier {
    fn default() -> Self {
        Self {
            heart_rate: 60.0..=100.0,
            respiratory_rate: 12.0..=20.0,
            body_temperature: 36.5..=37.5,
            oxygen_saturation: 95.0..=100.0,
            systolic_bp: 90.0..=120.0,
            diastolic_bp: 60.0..=80.0,
        }
    }
}

impl RiskClassifier for RangeClassifier {
    fn predict(&self, features: &FeatureVector) -> RiskLabel {
        let r = &features.reading;
        let normal = self.heart_rate.contains(&r.heart_rate)
            && self.respiratory_rate.contains(&r.respiratory_rate)
            && self.body_temperature.contains(&r.body_temperature)
            && self.oxygen_saturation.contains(&r.oxygen_saturation)
            && self.systolic_bp.contains(&r.systolic_bp)
            && self.diastolic_bp.contains(&r.diastolic_bp);

        if normal {
            RiskLabel::LowRisk
        } else {
            RiskLabel::HighRisk
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub patient_id: String,
    pub doctor_id: String,
    pub issue_id: String,
    pub severity: Severity,
    pub alert_time: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub vital_signs: BTreeMap<String, f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("alert store unavailable: {0}")]
    Unavailable(String),

    #[error("alert rejected: {0}")]
    Rejected(String),
}

/// Persistence for raised alerts.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError>;
}

/// Keeps alerts in memory, in creation order.
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("no attending doctors for patient {0}")]
    NoDoctors(String),
}

/// Who is being monitored and who gets told.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: String,
    pub patient_name: String,
    pub issue_id: String,
    pub doctor_ids: Vec<String>,
    #[serde(default)]
    pub demographics: Demographics,
}

pub struct VitalsMonitor {
    context: PatientContext,
    classifier: Arc<dyn RiskClassifier>,
    store: Arc<dyn AlertStore>,
    features: FeatureBuilder,
    trigger: DebouncedTrigger,
    start_time: DateTime<Utc>,
    clock: Instant,
    index: u64,
}

impl VitalsMonitor {
    pub fn new(
        context: PatientContext,
        classifier: Arc<dyn RiskClassifier>,
        store: Arc<dyn AlertStore>,
        start_time: DateTime<Utc>,
    ) -> Result<Self, MonitorError> {
        if context.doctor_ids.is_empty() {
            return Err(MonitorError::NoDoctors(context.patient_id));
        }

        Ok(Self {
            features: FeatureBuilder::new(context.demographics),
            trigger: DebouncedTrigger::new(TriggerConfig::default()),
            context,
            classifier,
            store,
            start_time,
            clock: Instant::now(),
            index: 0,
        })
    }

    /// Process the next reading. Returns the severity if alerts were raised.
    pub async fn observe(&mut self, reading: VitalReading) -> Option<Severity> {
        let offset = Duration::from_secs(self.index);
        self.index += 1;

        let features = self.features.push(&reading);
        let label = self.classifier.predict(&features);
        let high_risk = label == RiskLabel::HighRisk;
        if high_risk {
            debug!(
                "High risk at reading {}, run length {}",
                self.index - 1,
                self.trigger.count() + 1
            );
        }

        let severity = self.trigger.observe(high_risk, self.clock + offset)?;
        let alert_time = self.start_time + chrono::Duration::seconds(offset.as_secs() as i64);

        info!(
            "Creating {} alerts for {} doctors at {}",
            severity,
            self.context.doctor_ids.len(),
            alert_time
        );

        let vital_signs = snapshot(&features);
        let message = alert_message(&vital_signs);
        for doctor_id in &self.context.doctor_ids {
            let alert = Alert {
                patient_id: self.context.patient_id.clone(),
                doctor_id: doctor_id.clone(),
                issue_id: self.context.issue_id.clone(),
                severity,
                alert_time,
                title: format!("High-Risk Vital Signs - {}", self.context.patient_name),
                message: message.clone(),
                vital_signs: vital_signs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            };
            if let Err(e) = self.store.create_alert(alert).await {
                warn!("Failed to store alert for doctor {}: {}", doctor_id, e);
            }
        }

        Some(severity)
    }

    /// Readings processed so far.
    pub fn readings(&self) -> u64 {
        self.index
    }
}

fn snapshot(features: &FeatureVector) -> [(&'static str, f64); 7] {
    let r = &features.reading;
    [
        ("Heart Rate", r.heart_rate),
        ("Respiratory Rate", r.respiratory_rate),
        ("Body Temperature", r.body_temperature),
        ("Oxygen Saturation", r.oxygen_saturation),
        ("Systolic BP", r.systolic_bp),
        ("Diastolic BP", r.diastolic_bp),
        ("MAP", features.map),
    ]
}

fn alert_message(vital_signs: &[(&'static str, f64)]) -> String {
    let lines: Vec<String> = vital_signs
        .iter()
        .map(|(name, value)| format!("{}: {:.1}", name, value))
        .collect();
    format!("High-risk vital signs detected:\n{}", lines.join("\n"))
}
