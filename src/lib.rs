//! watchdesk realtime core library
//!
//! This library provides the realtime alert-delivery core for the watchdesk
//! operator console: the reconnecting alert feed client, per-camera
//! detection streams, event dispatch, alert queueing, the notification
//! presenter, and alarm sound control.

pub mod alerts;
pub mod config;
pub mod logging;
pub mod prefs;
pub mod protocol;
pub mod review;
pub mod router;
pub mod sound;
pub mod stream;
pub mod transport;
