// src/services/delivery_poller.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing;

use crate::{
    models::delivery::{
        Coordinate, DeliveryLocation, DeliveryPhase, DistanceEstimate, EstimateSource, EtaEstimate,
        TrackingUpdate,
    },
    services::backend::DeliveryApi,
    utils::geo,
};

pub type UpdateCallback = Arc<dyn Fn(&TrackingUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub avg_speed_kmh: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            avg_speed_kmh: geo::DEFAULT_AVG_SPEED_KMH,
        }
    }
}

struct PollState {
    phase: DeliveryPhase,
    destination: Option<Coordinate>,
    latest: Option<TrackingUpdate>,
}

/// Periodically fetches the courier position for one delivery while it is in
/// an active phase. The first poll fires immediately; once the delivery
/// reaches a terminal phase the loop ends on its own.
pub struct DeliveryPositionPoller {
    delivery_id: i64,
    state: Arc<Mutex<PollState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryPositionPoller {
    pub fn start<F>(
        api: Arc<dyn DeliveryApi>,
        delivery_id: i64,
        phase: DeliveryPhase,
        destination: Option<Coordinate>,
        settings: PollSettings,
        on_update: F,
    ) -> Self
    where
        F: Fn(&TrackingUpdate) + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(PollState {
            phase,
            destination,
            latest: None,
        }));

        let task = if phase.is_terminal() {
            tracing::debug!("Delivery {} already {:?}, not polling", delivery_id, phase);
            None
        } else {
            tracing::info!(
                "Polling delivery {} every {:?}",
                delivery_id,
                settings.interval
            );
            Some(tokio::spawn(poll_loop(
                api,
                delivery_id,
                state.clone(),
                settings,
                Arc::new(on_update),
            )))
        };

        Self {
            delivery_id,
            state,
            task: Mutex::new(task),
        }
    }

    pub fn delivery_id(&self) -> i64 {
        self.delivery_id
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.state.lock().phase
    }

    /// Feed a phase change learned elsewhere (e.g. a delivery-update push).
    /// A terminal phase stops polling immediately.
    pub fn set_phase(&self, phase: DeliveryPhase) {
        self.state.lock().phase = phase;
        if phase.is_terminal() {
            self.stop();
        }
    }

    pub fn set_destination(&self, destination: Coordinate) {
        self.state.lock().destination = Some(destination);
    }

    pub fn latest(&self) -> Option<TrackingUpdate> {
        self.state.lock().latest.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Stopped polling delivery {}", self.delivery_id);
        }
    }
}

impl Drop for DeliveryPositionPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn poll_loop(
    api: Arc<dyn DeliveryApi>,
    delivery_id: i64,
    state: Arc<Mutex<PollState>>,
    settings: PollSettings,
    on_update: UpdateCallback,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let phase = state.lock().phase;
        if phase.is_terminal() {
            break;
        }
        if !phase.is_active() {
            tracing::debug!("Delivery {} is {:?}, skipping poll", delivery_id, phase);
            continue;
        }

        let location = match api.fetch_location(delivery_id).await {
            Ok(location) => location,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Poll for delivery {} failed, retrying in {:?}: {}",
                    delivery_id,
                    settings.interval,
                    e
                );
                continue;
            }
            Err(e) => {
                tracing::error!(
                    "Poll for delivery {} rejected, retrying in {:?}: {}",
                    delivery_id,
                    settings.interval,
                    e
                );
                continue;
            }
        };

        let update = {
            let mut state = state.lock();
            if let Some(status) = location.status {
                if !state.phase.is_terminal() {
                    state.phase = status;
                }
            }
            let update = build_update(
                delivery_id,
                &location,
                state.phase,
                state.destination,
                settings.avg_speed_kmh,
            );
            if let Some(update) = &update {
                state.latest = Some(update.clone());
            }
            update
        };

        match update {
            Some(update) => {
                tracing::debug!(
                    "Delivery {} at {}, {}",
                    delivery_id,
                    update
                        .distance
                        .map(|d| geo::format_distance(d.kilometers))
                        .unwrap_or_else(|| "unknown distance".to_string()),
                    update
                        .eta
                        .map(|e| geo::format_eta(e.minutes))
                        .unwrap_or_else(|| "unknown ETA".to_string())
                );
                on_update(&update);
            }
            None => tracing::debug!("No courier position yet for delivery {}", delivery_id),
        }

        if state.lock().phase.is_terminal() {
            tracing::info!("Delivery {} finished, polling stopped", delivery_id);
            break;
        }
    }
}

/// Combine a poll result with what we already know. Backend estimates win;
/// missing ones are computed from the courier and destination positions.
pub fn build_update(
    delivery_id: i64,
    location: &DeliveryLocation,
    phase: DeliveryPhase,
    known_destination: Option<Coordinate>,
    avg_speed_kmh: f64,
) -> Option<TrackingUpdate> {
    let agent = location.agent_position()?;
    let destination = location.destination().or(known_destination);

    let distance = location
        .estimated_distance_km
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|kilometers| DistanceEstimate {
            kilometers,
            source: EstimateSource::Backend,
        })
        .or_else(|| {
            destination.map(|dest| DistanceEstimate {
                kilometers: geo::distance_between(agent, dest),
                source: EstimateSource::Computed,
            })
        });

    let remaining = distance.is_some_and(|d| d.kilometers > 0.0);
    let eta = location
        .estimated_time_minutes
        .map(|minutes| EtaEstimate {
            // any distance left takes at least a minute
            minutes: if remaining { minutes.max(1) } else { minutes },
            source: EstimateSource::Backend,
        })
        .or_else(|| {
            distance.map(|d| EtaEstimate {
                minutes: geo::eta_minutes(d.kilometers, avg_speed_kmh),
                source: EstimateSource::Computed,
            })
        });

    Some(TrackingUpdate {
        delivery_id,
        agent,
        phase,
        distance,
        eta,
        fetched_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(agent: Option<(f64, f64)>) -> DeliveryLocation {
        DeliveryLocation {
            agent_latitude: agent.map(|a| a.0),
            agent_longitude: agent.map(|a| a.1),
            ..DeliveryLocation::default()
        }
    }

    #[test]
    fn test_backend_estimates_are_preferred() {
        let mut loc = location(Some((28.6139, 77.2090)));
        loc.estimated_distance_km = Some(3.5);
        loc.estimated_time_minutes = Some(12);

        let update = build_update(1, &loc, DeliveryPhase::InTransit, None, 30.0).unwrap();
        assert_eq!(update.distance.unwrap().kilometers, 3.5);
        assert_eq!(update.distance.unwrap().source, EstimateSource::Backend);
        assert_eq!(update.eta.unwrap().minutes, 12);
        assert_eq!(update.eta.unwrap().source, EstimateSource::Backend);
    }

    #[test]
    fn test_backend_zero_eta_with_distance_left_is_one_minute() {
        let mut loc = location(Some((28.6139, 77.2090)));
        loc.estimated_distance_km = Some(2.5);
        loc.estimated_time_minutes = Some(0);

        let update = build_update(1, &loc, DeliveryPhase::InTransit, None, 30.0).unwrap();
        assert_eq!(update.distance.unwrap().kilometers, 2.5);
        assert_eq!(update.eta.unwrap().minutes, 1);
        assert_eq!(update.eta.unwrap().source, EstimateSource::Backend);

        // arrived: a zero backend ETA stays zero
        loc.estimated_distance_km = Some(0.0);
        let update = build_update(1, &loc, DeliveryPhase::InTransit, None, 30.0).unwrap();
        assert_eq!(update.eta.unwrap().minutes, 0);
    }

    #[test]
    fn test_estimates_computed_from_known_destination() {
        let loc = location(Some((28.6139, 77.2090)));
        let destination = Coordinate::new(28.7041, 77.1025);

        let update = build_update(1, &loc, DeliveryPhase::PickedUp, Some(destination), 30.0).unwrap();
        let distance = update.distance.unwrap();
        assert_eq!(distance.kilometers, 14.44);
        assert_eq!(distance.source, EstimateSource::Computed);
        assert_eq!(update.eta.unwrap().minutes, 29);
    }

    #[test]
    fn test_no_position_no_update() {
        assert!(build_update(1, &location(None), DeliveryPhase::Assigned, None, 30.0).is_none());

        let update = build_update(1, &location(Some((1.0, 1.0))), DeliveryPhase::Assigned, None, 30.0).unwrap();
        assert!(update.distance.is_none());
        assert!(update.eta.is_none());
    }
}
