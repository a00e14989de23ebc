//! In-memory store implementation
//!
//! Backs development and tests. Per-EVSE serialization comes from holding
//! the `DashMap` entry guard for the EVSE-status row across the whole
//! check-and-mutate sequence; lock order is always EVSE row first, then
//! session row.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{GatewayStore, OfflineSweep, StatusTransition};
use crate::domain::{
    ChargePoint, ChargingSession, Connectivity, Device, DeviceEvent, DomainError, DomainResult,
    EvseState, EvseStatus, MeterValue, NewSession, SessionStatus,
};

pub struct InMemoryGatewayStore {
    charge_points: DashMap<String, ChargePoint>,
    evse_status: DashMap<(String, u32), EvseStatus>,
    sessions: DashMap<i64, ChargingSession>,
    /// `(charge_point_id, evse_id, transaction_id)` uniqueness index.
    session_index: DashMap<(String, u32, i64), i64>,
    meter_values: DashMap<i64, Vec<MeterValue>>,
    events: Mutex<Vec<DeviceEvent>>,
    devices: DashMap<String, Device>,
    session_counter: AtomicI64,
    transaction_counter: AtomicI64,
}

impl InMemoryGatewayStore {
    pub fn new() -> Self {
        Self {
            charge_points: DashMap::new(),
            evse_status: DashMap::new(),
            sessions: DashMap::new(),
            session_index: DashMap::new(),
            meter_values: DashMap::new(),
            events: Mutex::new(Vec::new()),
            devices: DashMap::new(),
            session_counter: AtomicI64::new(1),
            transaction_counter: AtomicI64::new(1),
        }
    }

    /// Recorded events, newest last. Test/diagnostic surface.
    pub fn events_for(&self, charge_point_id: &str) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.charge_point_id == charge_point_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryGatewayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayStore for InMemoryGatewayStore {
    async fn get_charge_point(&self, id: &str) -> DomainResult<Option<ChargePoint>> {
        Ok(self.charge_points.get(id).map(|cp| cp.clone()))
    }

    async fn find_charge_point_by_serial(
        &self,
        serial: &str,
    ) -> DomainResult<Option<ChargePoint>> {
        Ok(self
            .charge_points
            .iter()
            .find(|cp| cp.serial_number.as_deref() == Some(serial))
            .map(|cp| cp.clone()))
    }

    async fn upsert_charge_point(&self, charge_point: ChargePoint) -> DomainResult<()> {
        self.charge_points
            .insert(charge_point.id.clone(), charge_point);
        Ok(())
    }

    async fn set_connectivity(&self, id: &str, connectivity: Connectivity) -> DomainResult<()> {
        if let Some(mut cp) = self.charge_points.get_mut(id) {
            cp.connectivity = connectivity;
        }
        Ok(())
    }

    async fn ensure_evse(&self, charge_point_id: &str, evse_id: u32) -> DomainResult<()> {
        self.evse_status
            .entry((charge_point_id.to_string(), evse_id))
            .or_insert_with(|| EvseStatus::new(charge_point_id, evse_id));
        Ok(())
    }

    async fn get_evse_status(
        &self,
        charge_point_id: &str,
        evse_id: u32,
    ) -> DomainResult<Option<EvseStatus>> {
        Ok(self
            .evse_status
            .get(&(charge_point_id.to_string(), evse_id))
            .map(|s| s.clone()))
    }

    async fn list_evse_statuses(&self, charge_point_id: &str) -> DomainResult<Vec<EvseStatus>> {
        Ok(self
            .evse_status
            .iter()
            .filter(|s| s.charge_point_id == charge_point_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn apply_status(
        &self,
        charge_point_id: &str,
        evse_id: u32,
        state: EvseState,
    ) -> DomainResult<StatusTransition> {
        let now = Utc::now();
        let mut entry = self
            .evse_status
            .entry((charge_point_id.to_string(), evse_id))
            .or_insert_with(|| EvseStatus::new(charge_point_id, evse_id));

        let previous = entry.state;
        entry.state = state;
        entry.last_seen = now;

        let mut closed_session = None;
        if state == EvseState::Available {
            // Going Available with an open transaction means the device
            // lost it; close the session as an abnormal termination.
            if let Some(session_id) = entry.current_session.take() {
                if let Some(mut session) = self.sessions.get_mut(&session_id) {
                    if session.is_ongoing() {
                        session.status = SessionStatus::Cancelled;
                        session.end_time = Some(now);
                        session.stop_reason = Some("StatusReset".to_string());
                        closed_session = Some(session.clone());
                    }
                }
            }
        }

        Ok(StatusTransition {
            previous,
            closed_session,
        })
    }

    async fn touch_evses(&self, charge_point_id: &str) -> DomainResult<()> {
        let now = Utc::now();
        for mut status in self.evse_status.iter_mut() {
            if status.charge_point_id == charge_point_id {
                status.last_seen = now;
            }
        }
        Ok(())
    }

    async fn sweep_offline(&self, charge_point_id: &str) -> DomainResult<OfflineSweep> {
        let mut sweep = OfflineSweep::default();
        for mut status in self.evse_status.iter_mut() {
            if status.charge_point_id != charge_point_id {
                continue;
            }
            let session_ongoing = status
                .current_session
                .and_then(|sid| self.sessions.get(&sid).map(|s| s.is_ongoing()))
                .unwrap_or(false);
            if status.state == EvseState::Charging || session_ongoing {
                sweep.left_active.push(status.evse_id);
            } else if status.state != EvseState::Unavailable {
                status.state = EvseState::Unavailable;
                sweep.marked.push(status.evse_id);
            }
        }
        Ok(sweep)
    }

    async fn start_session(&self, new: NewSession) -> DomainResult<ChargingSession> {
        let key = (new.charge_point_id.clone(), new.evse_id);
        let mut status = self
            .evse_status
            .get_mut(&key)
            .ok_or_else(|| DomainError::EvseNotFound {
                charge_point_id: new.charge_point_id.clone(),
                evse_id: new.evse_id,
            })?;

        if let Some(existing) = status.current_session {
            let ongoing = self
                .sessions
                .get(&existing)
                .map(|s| s.is_ongoing())
                .unwrap_or(false);
            if ongoing {
                return Err(DomainError::ConnectorBusy {
                    charge_point_id: new.charge_point_id.clone(),
                    evse_id: new.evse_id,
                });
            }
        }

        let transaction_id = new
            .transaction_id
            .unwrap_or_else(|| self.transaction_counter.fetch_add(1, Ordering::SeqCst));

        let index_key = (new.charge_point_id.clone(), new.evse_id, transaction_id);
        if self.session_index.contains_key(&index_key) {
            return Err(DomainError::DuplicateSession {
                charge_point_id: new.charge_point_id.clone(),
                evse_id: new.evse_id,
                transaction_id,
            });
        }

        let session = ChargingSession {
            id: self.session_counter.fetch_add(1, Ordering::SeqCst),
            charge_point_id: new.charge_point_id,
            evse_id: new.evse_id,
            transaction_id,
            id_tag: new.id_tag,
            start_time: new.start_time,
            end_time: None,
            meter_start: new.meter_start,
            meter_stop: None,
            status: SessionStatus::Ongoing,
            stop_reason: None,
        };

        self.session_index.insert(index_key, session.id);
        self.sessions.insert(session.id, session.clone());
        status.current_session = Some(session.id);

        Ok(session)
    }

    async fn stop_session(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
        meter_stop: i64,
        reason: Option<String>,
    ) -> DomainResult<Option<ChargingSession>> {
        let found = self.sessions.iter().find_map(|s| {
            (s.charge_point_id == charge_point_id
                && s.transaction_id == transaction_id
                && s.is_ongoing())
            .then(|| (s.id, s.evse_id))
        });

        let Some((session_id, evse_id)) = found else {
            return Ok(None);
        };

        // EVSE row first, session row second (store-wide lock order).
        if let Some(mut status) = self
            .evse_status
            .get_mut(&(charge_point_id.to_string(), evse_id))
        {
            if status.current_session == Some(session_id) {
                status.current_session = None;
                status.state = EvseState::Available;
                status.last_seen = Utc::now();
            }
        }

        let updated = self.sessions.get_mut(&session_id).map(|mut session| {
            session.status = SessionStatus::Completed;
            session.end_time = Some(Utc::now());
            session.meter_stop = Some(meter_stop);
            session.stop_reason = reason;
            session.clone()
        });

        Ok(updated)
    }

    async fn find_ongoing_session(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
    ) -> DomainResult<Option<ChargingSession>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| {
                s.charge_point_id == charge_point_id
                    && s.transaction_id == transaction_id
                    && s.is_ongoing()
            })
            .map(|s| s.clone()))
    }

    async fn get_session(&self, session_id: i64) -> DomainResult<Option<ChargingSession>> {
        Ok(self.sessions.get(&session_id).map(|s| s.clone()))
    }

    async fn append_meter_value(&self, value: MeterValue) -> DomainResult<()> {
        self.meter_values
            .entry(value.session_id)
            .or_default()
            .push(value);
        Ok(())
    }

    async fn list_meter_values(&self, session_id: i64) -> DomainResult<Vec<MeterValue>> {
        Ok(self
            .meter_values
            .get(&session_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn record_event(&self, event: DeviceEvent) -> DomainResult<()> {
        self.events
            .lock()
            .map_err(|_| DomainError::Storage("event log poisoned".to_string()))?
            .push(event);
        Ok(())
    }

    async fn get_device(&self, serial_number: &str) -> DomainResult<Option<Device>> {
        Ok(self.devices.get(serial_number).map(|d| d.clone()))
    }

    async fn upsert_device(&self, device: Device) -> DomainResult<()> {
        self.devices.insert(device.serial_number.clone(), device);
        Ok(())
    }

    async fn touch_device(&self, serial_number: &str) -> DomainResult<()> {
        if let Some(mut device) = self.devices.get_mut(serial_number) {
            device.last_connected = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_device_type_codes(&self) -> DomainResult<Vec<String>> {
        let mut codes: Vec<String> = self.devices.iter().map(|d| d.type_code.clone()).collect();
        codes.sort();
        codes.dedup();
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(cp: &str, evse: u32, txid: Option<i64>, id_tag: &str) -> NewSession {
        NewSession {
            charge_point_id: cp.to_string(),
            evse_id: evse,
            transaction_id: txid,
            id_tag: id_tag.to_string(),
            meter_start: 0,
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_session_triple_is_rejected() {
        let store = InMemoryGatewayStore::new();
        store.ensure_evse("CP1", 1).await.unwrap();

        let first = store
            .start_session(new_session("CP1", 1, Some(42), "TAG1"))
            .await
            .unwrap();
        assert_eq!(first.transaction_id, 42);

        // Free the connector so only the uniqueness index can complain.
        store
            .stop_session("CP1", 42, 100, None)
            .await
            .unwrap()
            .unwrap();

        let err = store
            .start_session(new_session("CP1", 1, Some(42), "TAG2"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateSession { .. }));
    }

    #[tokio::test]
    async fn start_on_missing_evse_fails() {
        let store = InMemoryGatewayStore::new();
        let err = store
            .start_session(new_session("CP1", 9, None, "TAG1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::EvseNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_starts_on_one_evse_yield_one_session() {
        let store = std::sync::Arc::new(InMemoryGatewayStore::new());
        store.ensure_evse("CP1", 1).await.unwrap();

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.start_session(new_session("CP1", 1, None, "TAG-A")).await }),
            tokio::spawn(async move { b.start_session(new_session("CP1", 1, None, "TAG-B")).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(DomainError::ConnectorBusy { .. })))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(busy, 1);
    }

    #[tokio::test]
    async fn available_transition_closes_ongoing_session() {
        let store = InMemoryGatewayStore::new();
        store.ensure_evse("CP1", 1).await.unwrap();
        store
            .apply_status("CP1", 1, EvseState::Charging)
            .await
            .unwrap();
        let session = store
            .start_session(new_session("CP1", 1, None, "TAG1"))
            .await
            .unwrap();

        let transition = store
            .apply_status("CP1", 1, EvseState::Available)
            .await
            .unwrap();
        assert_eq!(transition.previous, EvseState::Charging);
        let closed = transition.closed_session.unwrap();
        assert_eq!(closed.id, session.id);
        assert_eq!(closed.status, SessionStatus::Cancelled);

        let status = store.get_evse_status("CP1", 1).await.unwrap().unwrap();
        assert_eq!(status.state, EvseState::Available);
        assert!(status.current_session.is_none());
    }

    #[tokio::test]
    async fn sweep_offline_leaves_charging_evse_alone() {
        let store = InMemoryGatewayStore::new();
        store.ensure_evse("CP1", 1).await.unwrap();
        store.ensure_evse("CP1", 2).await.unwrap();
        store
            .apply_status("CP1", 1, EvseState::Charging)
            .await
            .unwrap();

        let sweep = store.sweep_offline("CP1").await.unwrap();
        assert_eq!(sweep.left_active, vec![1]);
        assert_eq!(sweep.marked, vec![2]);

        let charging = store.get_evse_status("CP1", 1).await.unwrap().unwrap();
        assert_eq!(charging.state, EvseState::Charging);
        let idle = store.get_evse_status("CP1", 2).await.unwrap().unwrap();
        assert_eq!(idle.state, EvseState::Unavailable);
    }

    #[tokio::test]
    async fn stop_session_flips_evse_to_available() {
        let store = InMemoryGatewayStore::new();
        store.ensure_evse("CP1", 1).await.unwrap();
        let session = store
            .start_session(new_session("CP1", 1, None, "TAG1"))
            .await
            .unwrap();

        let stopped = store
            .stop_session("CP1", session.transaction_id, 209, Some("Local".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped.status, SessionStatus::Completed);
        assert_eq!(stopped.meter_stop, Some(209));

        let status = store.get_evse_status("CP1", 1).await.unwrap().unwrap();
        assert_eq!(status.state, EvseState::Available);
        assert!(status.current_session.is_none());
    }
}
