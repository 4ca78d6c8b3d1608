//! Headless runner for the watchdesk realtime core.
//!
//! Connects to the alert feed, subscribes, and logs display-state
//! transitions so the pipeline can be exercised without the console UI.
//! Per-camera detection streams are opened for each `--camera` flag.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use watchdesk::alerts::AlertPresenter;
use watchdesk::config::{load_config, load_config_from, state_dir};
use watchdesk::logging::{init_logging, LogConfig};
use watchdesk::prefs::PrefsStore;
use watchdesk::protocol::ChannelId;
use watchdesk::review::HttpReviewClient;
use watchdesk::router::EventRouter;
use watchdesk::sound::SoundController;
use watchdesk::stream::DetectionStreamClient;
use watchdesk::transport::AlertFeedClient;

#[derive(Parser)]
#[command(name = "watchdesk", about = "Realtime alert console core", version)]
struct Cli {
    /// Config file path (defaults to the resolved watchdesk.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Camera ids to open live detection streams for (repeatable).
    #[arg(long = "camera")]
    cameras: Vec<String>,

    /// Log JSON instead of plaintext.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.json_logs {
        LogConfig::production()
    } else {
        LogConfig::default()
    };
    init_logging(log_config)?;

    let config = match cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    let prefs = Arc::new(PrefsStore::open(state_dir().join("prefs.json"))?);
    let client_id = prefs.client_id();
    info!(client_id = %client_id, "starting watchdesk core");

    let sound = Arc::new(SoundController::new(
        prefs.clone(),
        config.sound.asset_dir.clone(),
    ));
    let review = Arc::new(HttpReviewClient::new(config.server.api_base_url.clone()));
    let router = EventRouter::new();

    let presenter = AlertPresenter::new(config.alerts.to_presenter_config(), sound, review)
        .with_ack_hook(|alert, trigger| {
            info!(alert_id = %alert.id, trigger = %trigger, "alert acknowledged");
        });
    presenter.start();

    let submit = presenter.clone();
    let alert_guard = router.on_alert(move |alert| {
        submit.submit(alert.clone());
    });
    let status_guard = router.on_status(|status| {
        info!(
            cameras_online = status.cameras_online,
            alerts_today = status.alerts_today,
            "status snapshot"
        );
    });
    let camera_guard = router.on_camera_status(|camera_id, status| {
        info!(camera_id, status, "camera status changed");
    });

    let feed = AlertFeedClient::new(
        config
            .transport
            .to_transport_config(config.server.alert_feed_url()),
        client_id,
        router.clone(),
    );
    feed.connect();
    feed.subscribe(ChannelId::Alerts).await;

    let mut streams = Vec::new();
    let stream_config = config.stream.to_stream_config(config.server.detection_base_url());
    for camera_id in cli.cameras {
        let stream = DetectionStreamClient::new(camera_id.clone(), stream_config.clone(), {
            let camera_id = camera_id.clone();
            move |frame| {
                info!(
                    camera_id = %camera_id,
                    detections = frame.detections.len(),
                    "detection frame"
                );
            }
        });
        stream.start();
        streams.push(stream);
    }

    // Narrate display-state changes until interrupted.
    let mut display = presenter.watch_display();
    let narrator = tokio::spawn(async move {
        while display.changed().await.is_ok() {
            let snapshot = display.borrow().clone();
            match &snapshot.current {
                Some(alert) => info!(
                    phase = %snapshot.phase,
                    alert_id = %alert.id,
                    camera_id = %alert.camera_id,
                    pending = snapshot.pending,
                    "display state"
                ),
                None => info!(phase = %snapshot.phase, pending = snapshot.pending, "display state"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    narrator.abort();
    for stream in &streams {
        stream.stop().await;
    }
    feed.disconnect().await;
    presenter.shutdown();

    drop(alert_guard);
    drop(status_guard);
    drop(camera_guard);

    Ok(())
}
