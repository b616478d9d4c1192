// src/services/location_tracking.rs
//! Continuous device-position tracking for a courier, one sensor watch per
//! delivery. Every fix is handed to the caller and pushed to the delivery
//! service in the background.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing;

use crate::{
    errors::{SparrowError as AppError, SparrowResult},
    models::delivery::{LocationSample, LocationUpdateRequest},
    services::backend::DeliveryApi,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("timed out waiting for a position fix")]
    Timeout,
    #[error("no position source on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,  // zero means never reuse a cached fix
}

impl WatchOptions {
    pub fn high_accuracy(timeout: Duration) -> Self {
        Self {
            high_accuracy: true,
            timeout,
            maximum_age: Duration::ZERO,
        }
    }
}

/// A live sensor subscription. The sensor closes `fixes` when the watch ends.
pub struct SensorWatch {
    pub id: u64,
    pub fixes: mpsc::Receiver<Result<LocationSample, SensorError>>,
}

#[async_trait]
pub trait PositionSensor: Send + Sync {
    fn is_available(&self) -> bool;
    fn watch(&self, options: WatchOptions) -> Result<SensorWatch, SensorError>;
    fn clear_watch(&self, watch_id: u64);
    async fn current_position(&self, options: WatchOptions) -> Result<LocationSample, SensorError>;
}

/// Sensor for hosts without any position source.
#[derive(Debug, Default)]
pub struct UnavailableSensor;

#[async_trait]
impl PositionSensor for UnavailableSensor {
    fn is_available(&self) -> bool {
        false
    }

    fn watch(&self, _options: WatchOptions) -> Result<SensorWatch, SensorError> {
        Err(SensorError::Unsupported)
    }

    fn clear_watch(&self, _watch_id: u64) {}

    async fn current_position(&self, _options: WatchOptions) -> Result<LocationSample, SensorError> {
        Err(SensorError::Unsupported)
    }
}

pub type SampleCallback = Arc<dyn Fn(&LocationSample) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&AppError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingHandle {
    delivery_id: i64,
    watch_id: u64,
}

impl TrackingHandle {
    pub fn delivery_id(&self) -> i64 {
        self.delivery_id
    }

    pub fn watch_id(&self) -> u64 {
        self.watch_id
    }
}

struct ActiveWatch {
    watch_id: u64,
    task: Option<JoinHandle<()>>,
}

struct TrackerInner {
    sensor: Arc<dyn PositionSensor>,
    api: Arc<dyn DeliveryApi>,
    options: WatchOptions,
    watches: Mutex<HashMap<i64, ActiveWatch>>,
    last_samples: Mutex<HashMap<i64, LocationSample>>,
}

impl TrackerInner {
    fn is_current(&self, delivery_id: i64, watch_id: u64) -> bool {
        self.watches
            .lock()
            .get(&delivery_id)
            .is_some_and(|w| w.watch_id == watch_id)
    }

    /// Drop the registry entry for `watch_id` and release it at the sensor.
    /// Returns the entry's task so the caller can decide whether to abort it.
    fn release(&self, delivery_id: i64, watch_id: u64) -> Option<Option<JoinHandle<()>>> {
        let removed = {
            let mut watches = self.watches.lock();
            match watches.get(&delivery_id) {
                Some(active) if active.watch_id == watch_id => watches.remove(&delivery_id),
                _ => None,
            }
        };
        removed.map(|active| {
            self.sensor.clear_watch(watch_id);
            active.task
        })
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        for (delivery_id, active) in self.watches.get_mut().drain() {
            if let Some(task) = active.task {
                task.abort();
            }
            self.sensor.clear_watch(active.watch_id);
            tracing::debug!("Released location watch for delivery {}", delivery_id);
        }
    }
}

enum StartOutcome {
    Started(TrackingHandle),
    Rejected(AppError),
}

pub struct LocationTrackingSession {
    inner: Arc<TrackerInner>,
}

impl LocationTrackingSession {
    pub fn new(sensor: Arc<dyn PositionSensor>, api: Arc<dyn DeliveryApi>, location_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                sensor,
                api,
                options: WatchOptions::high_accuracy(location_timeout),
                watches: Mutex::new(HashMap::new()),
                last_samples: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.inner.sensor.is_available()
    }

    /// Begin watching the device position for `delivery_id`.
    ///
    /// Returns `None` after reporting through `on_error` when the platform has
    /// no position source, when the delivery is already being tracked, or when
    /// the sensor refuses the watch. `on_sample` is never called in those cases.
    pub fn start<S, E>(&self, delivery_id: i64, on_sample: S, on_error: E) -> Option<TrackingHandle>
    where
        S: Fn(&LocationSample) + Send + Sync + 'static,
        E: Fn(&AppError) + Send + Sync + 'static,
    {
        let on_sample: SampleCallback = Arc::new(on_sample);
        let on_error: ErrorCallback = Arc::new(on_error);

        if !self.is_supported() {
            tracing::warn!("Location tracking unavailable for delivery {}", delivery_id);
            on_error(&AppError::CapabilityUnavailable);
            return None;
        }

        let outcome = {
            let mut watches = self.inner.watches.lock();
            if watches.contains_key(&delivery_id) {
                StartOutcome::Rejected(AppError::AlreadyTracking(delivery_id))
            } else {
                match self.inner.sensor.watch(self.inner.options) {
                    Ok(watch) => {
                        let handle = TrackingHandle {
                            delivery_id,
                            watch_id: watch.id,
                        };
                        let task = tokio::spawn(run_watch(
                            Arc::downgrade(&self.inner),
                            delivery_id,
                            watch,
                            on_sample,
                            on_error.clone(),
                        ));
                        watches.insert(
                            delivery_id,
                            ActiveWatch {
                                watch_id: handle.watch_id,
                                task: Some(task),
                            },
                        );
                        StartOutcome::Started(handle)
                    }
                    Err(e) => StartOutcome::Rejected(e.into()),
                }
            }
        };

        match outcome {
            StartOutcome::Started(handle) => {
                tracing::info!(
                    "Started location tracking for delivery {} (watch {})",
                    delivery_id,
                    handle.watch_id
                );
                Some(handle)
            }
            StartOutcome::Rejected(err) => {
                tracing::warn!("Could not start tracking delivery {}: {}", delivery_id, err);
                on_error(&err);
                None
            }
        }
    }

    /// Release the watch behind `handle`. Stale and absent handles are ignored.
    pub fn stop(&self, handle: Option<&TrackingHandle>) -> bool {
        let Some(handle) = handle else {
            return false;
        };
        match self.inner.release(handle.delivery_id, handle.watch_id) {
            Some(task) => {
                if let Some(task) = task {
                    task.abort();
                }
                tracing::info!("Stopped location tracking for delivery {}", handle.delivery_id);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let active: Vec<(i64, u64)> = self
            .inner
            .watches
            .lock()
            .iter()
            .map(|(delivery_id, w)| (*delivery_id, w.watch_id))
            .collect();
        for (delivery_id, watch_id) in active {
            self.stop(Some(&TrackingHandle {
                delivery_id,
                watch_id,
            }));
        }
    }

    pub fn is_tracking(&self, delivery_id: i64) -> bool {
        self.inner.watches.lock().contains_key(&delivery_id)
    }

    pub fn last_sample(&self, delivery_id: i64) -> Option<LocationSample> {
        self.inner.last_samples.lock().get(&delivery_id).copied()
    }

    /// One fresh fix, bounded by the configured timeout. Never served from cache.
    pub async fn get_current_once(&self) -> SparrowResult<LocationSample> {
        if !self.is_supported() {
            return Err(AppError::CapabilityUnavailable);
        }

        let options = self.inner.options;
        match tokio::time::timeout(options.timeout, self.inner.sensor.current_position(options)).await {
            Ok(Ok(sample)) => Ok(sample),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!("Timed out after {:?} waiting for a position fix", options.timeout);
                Err(AppError::LocationTimeout)
            }
        }
    }
}

async fn run_watch(
    inner: Weak<TrackerInner>,
    delivery_id: i64,
    mut watch: SensorWatch,
    on_sample: SampleCallback,
    on_error: ErrorCallback,
) {
    let watch_id = watch.id;

    while let Some(fix) = watch.fixes.recv().await {
        let Some(tracker) = inner.upgrade() else {
            return;
        };
        if !tracker.is_current(delivery_id, watch_id) {
            return;
        }

        match fix {
            Ok(sample) => {
                tracker.last_samples.lock().insert(delivery_id, sample);
                on_sample(&sample);

                let api = tracker.api.clone();
                let update = LocationUpdateRequest {
                    latitude: sample.latitude,
                    longitude: sample.longitude,
                };
                tokio::spawn(async move {
                    if let Err(e) = api.push_location(delivery_id, update).await {
                        tracing::warn!("Failed to push location for delivery {}: {}", delivery_id, e);
                    }
                });
            }
            Err(e) => {
                let err = AppError::from(e);
                tracing::error!("Location tracking for delivery {} halted: {}", delivery_id, err);
                // this task is the one being released, so it is not aborted
                let _ = tracker.release(delivery_id, watch_id);
                on_error(&err);
                return;
            }
        }
    }

    if let Some(tracker) = inner.upgrade() {
        if tracker.release(delivery_id, watch_id).is_some() {
            tracing::debug!("Sensor ended watch {} for delivery {}", watch_id, delivery_id);
        }
    }
}
