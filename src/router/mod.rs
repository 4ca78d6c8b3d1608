//! Typed dispatch of inbound feed events.
//!
//! The router parses raw text frames into [`ServerEvent`] envelopes and fans
//! them out to registered handlers: alert, status, and camera-status
//! registries take any number of listeners; detection handlers are keyed by
//! camera id with a separate wildcard registry; an any-event registry
//! observes every parsed envelope. Parse failures are logged and the frame
//! is dropped — a bad message never tears down the connection.
//!
//! Every registration returns a [`HandlerGuard`]. Dropping the guard (or
//! calling [`HandlerGuard::dispose`]) removes the handler, so a consumer
//! that goes away stops receiving events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

use crate::protocol::{AlertEvent, DetectionFrame, ServerEvent, StatusSnapshot};

pub type AlertHandler = Arc<dyn Fn(&AlertEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;
pub type CameraStatusHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type DetectionHandler = Arc<dyn Fn(&DetectionFrame) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Which registry a guard releases from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerSlot {
    Alert,
    Status,
    CameraStatus,
    DetectionAll,
    Detection(String),
    Any,
}

struct RouterInner {
    next_id: AtomicU64,
    alerts: RwLock<Vec<(u64, AlertHandler)>>,
    status: RwLock<Vec<(u64, StatusHandler)>>,
    camera_status: RwLock<Vec<(u64, CameraStatusHandler)>>,
    detections_all: RwLock<Vec<(u64, DetectionHandler)>>,
    detections_by_camera: RwLock<HashMap<String, Vec<(u64, DetectionHandler)>>>,
    any: RwLock<Vec<(u64, EventHandler)>>,
}

impl RouterInner {
    fn release(&self, slot: &HandlerSlot, id: u64) {
        match slot {
            HandlerSlot::Alert => self.alerts.write().retain(|(hid, _)| *hid != id),
            HandlerSlot::Status => self.status.write().retain(|(hid, _)| *hid != id),
            HandlerSlot::CameraStatus => {
                self.camera_status.write().retain(|(hid, _)| *hid != id)
            }
            HandlerSlot::DetectionAll => {
                self.detections_all.write().retain(|(hid, _)| *hid != id)
            }
            HandlerSlot::Detection(camera_id) => {
                let mut map = self.detections_by_camera.write();
                if let Some(handlers) = map.get_mut(camera_id) {
                    handlers.retain(|(hid, _)| *hid != id);
                    if handlers.is_empty() {
                        map.remove(camera_id);
                    }
                }
            }
            HandlerSlot::Any => self.any.write().retain(|(hid, _)| *hid != id),
        }
    }
}

/// Disposer handle for a registered event handler.
///
/// The registration stays live for the lifetime of the guard; dropping it
/// (or calling [`dispose`](Self::dispose)) removes the handler.
#[must_use = "dropping the guard unregisters the handler"]
pub struct HandlerGuard {
    inner: Weak<RouterInner>,
    slot: HandlerSlot,
    id: u64,
}

impl HandlerGuard {
    /// Explicitly release the registration.
    pub fn dispose(self) {
        // Drop does the work.
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.slot, self.id);
        }
    }
}

/// Shared, cheaply-clonable event router.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                next_id: AtomicU64::new(1),
                alerts: RwLock::new(Vec::new()),
                status: RwLock::new(Vec::new()),
                camera_status: RwLock::new(Vec::new()),
                detections_all: RwLock::new(Vec::new()),
                detections_by_camera: RwLock::new(HashMap::new()),
                any: RwLock::new(Vec::new()),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn guard(&self, slot: HandlerSlot, id: u64) -> HandlerGuard {
        HandlerGuard {
            inner: Arc::downgrade(&self.inner),
            slot,
            id,
        }
    }

    /// Register an alert listener.
    pub fn on_alert<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&AlertEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.alerts.write().push((id, Arc::new(handler)));
        self.guard(HandlerSlot::Alert, id)
    }

    /// Register a status-snapshot listener.
    pub fn on_status<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.status.write().push((id, Arc::new(handler)));
        self.guard(HandlerSlot::Status, id)
    }

    /// Register a camera online/offline listener (`camera_id`, `status`).
    pub fn on_camera_status<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .camera_status
            .write()
            .push((id, Arc::new(handler)));
        self.guard(HandlerSlot::CameraStatus, id)
    }

    /// Register a detection-frame listener.
    ///
    /// `camera_id = None` registers a wildcard listener that sees every
    /// camera's frames; `Some(id)` only that camera's.
    pub fn on_detections<F>(&self, camera_id: Option<&str>, handler: F) -> HandlerGuard
    where
        F: Fn(&DetectionFrame) + Send + Sync + 'static,
    {
        let id = self.next_id();
        match camera_id {
            None => {
                self.inner
                    .detections_all
                    .write()
                    .push((id, Arc::new(handler)));
                self.guard(HandlerSlot::DetectionAll, id)
            }
            Some(camera) => {
                self.inner
                    .detections_by_camera
                    .write()
                    .entry(camera.to_string())
                    .or_default()
                    .push((id, Arc::new(handler)));
                self.guard(HandlerSlot::Detection(camera.to_string()), id)
            }
        }
    }

    /// Register a listener for every parsed envelope.
    pub fn on_any_event<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.any.write().push((id, Arc::new(handler)));
        self.guard(HandlerSlot::Any, id)
    }

    /// Parse a raw frame and dispatch it. Returns `false` when the frame was
    /// dropped as unparseable.
    pub fn dispatch_raw(&self, text: &str) -> bool {
        match ServerEvent::parse(text) {
            Ok(event) => {
                self.dispatch(&event);
                true
            }
            Err(error) => {
                warn!(target: "router", %error, "dropping unparseable message");
                false
            }
        }
    }

    /// Dispatch a parsed envelope to the matching registries.
    pub fn dispatch(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Alert { data, .. } => {
                let handlers: Vec<AlertHandler> = self
                    .inner
                    .alerts
                    .read()
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in handlers {
                    handler(data);
                }
            }
            ServerEvent::Status { data, .. } => {
                let handlers: Vec<StatusHandler> = self
                    .inner
                    .status
                    .read()
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in handlers {
                    handler(data);
                }
            }
            ServerEvent::Detection { frame, .. } => {
                let mut handlers: Vec<DetectionHandler> = self
                    .inner
                    .detections_all
                    .read()
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                if let Some(per_camera) =
                    self.inner.detections_by_camera.read().get(&frame.camera_id)
                {
                    handlers.extend(per_camera.iter().map(|(_, h)| h.clone()));
                }
                for handler in handlers {
                    handler(frame);
                }
            }
            ServerEvent::CameraStatus {
                camera_id, status, ..
            } => {
                let handlers: Vec<CameraStatusHandler> = self
                    .inner
                    .camera_status
                    .read()
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in handlers {
                    handler(camera_id, status);
                }
            }
            // Connection-level frames carry no domain payload.
            _ => {}
        }

        let any: Vec<EventHandler> = self
            .inner
            .any
            .read()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in any {
            handler(event);
        }
    }

    /// Number of live registrations, for diagnostics.
    pub fn handler_count(&self) -> usize {
        self.inner.alerts.read().len()
            + self.inner.status.read().len()
            + self.inner.camera_status.read().len()
            + self.inner.detections_all.read().len()
            + self
                .inner
                .detections_by_camera
                .read()
                .values()
                .map(|v| v.len())
                .sum::<usize>()
            + self.inner.any.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WeaponType;
    use std::sync::atomic::AtomicU32;

    fn alert_json(id: &str, camera: &str) -> String {
        format!(
            r#"{{"type":"new_alert","data":{{"id":"{id}","camera_id":"{camera}","weapon_type":"knife","confidence":0.8}}}}"#
        )
    }

    #[test]
    fn test_alert_dispatch_multiple_listeners() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicU32::new(0));

        let c1 = count.clone();
        let _g1 = router.on_alert(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        });
        let c2 = count.clone();
        let _g2 = router.on_alert(move |a| {
            assert_eq!(a.weapon_type, WeaponType::Knife);
            c2.fetch_add(1, Ordering::Relaxed);
        });

        assert!(router.dispatch_raw(&alert_json("a-1", "cam-1")));
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_guard_drop_unregisters() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let guard = router.on_alert(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(router.handler_count(), 1);

        guard.dispose();
        assert_eq!(router.handler_count(), 0);

        router.dispatch_raw(&alert_json("a-2", "cam-1"));
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_detection_per_camera_and_wildcard() {
        let router = EventRouter::new();
        let cam1_hits = Arc::new(AtomicU32::new(0));
        let all_hits = Arc::new(AtomicU32::new(0));

        let c = cam1_hits.clone();
        let _g1 = router.on_detections(Some("cam-1"), move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let a = all_hits.clone();
        let _g2 = router.on_detections(None, move |_| {
            a.fetch_add(1, Ordering::Relaxed);
        });

        let frame = |camera: &str| {
            format!(r#"{{"type":"detection","camera_id":"{camera}","detections":[]}}"#)
        };
        router.dispatch_raw(&frame("cam-1"));
        router.dispatch_raw(&frame("cam-2"));

        assert_eq!(cam1_hits.load(Ordering::Relaxed), 1);
        assert_eq!(all_hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unparseable_frame_dropped() {
        let router = EventRouter::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let _g = router.on_any_event(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        assert!(!router.dispatch_raw("{broken"));
        assert!(!router.dispatch_raw(r#"{"type":"no_such_tag"}"#));
        assert_eq!(count.load(Ordering::Relaxed), 0);

        // Subsequent valid frames still flow.
        assert!(router.dispatch_raw(r#"{"type":"connected","message":"hi"}"#));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_camera_status_dispatch() {
        let router = EventRouter::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let _g = router.on_camera_status(move |camera, status| {
            s.lock().push((camera.to_string(), status.to_string()));
        });

        router.dispatch_raw(r#"{"type":"camera_status","camera_id":"cam-9","status":"offline"}"#);
        assert_eq!(
            seen.lock().as_slice(),
            &[("cam-9".to_string(), "offline".to_string())]
        );
    }

    #[test]
    fn test_any_event_sees_control_frames() {
        let router = EventRouter::new();
        let kinds = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let k = kinds.clone();
        let _g = router.on_any_event(move |ev| {
            k.lock().push(ev.kind());
        });

        router.dispatch_raw(r#"{"type":"ping"}"#);
        router.dispatch_raw(&alert_json("a-3", "cam-1"));
        assert_eq!(kinds.lock().as_slice(), &["ping", "new_alert"]);
    }
}
