//! Desktop client for multi-party audio/video rooms: a lobby, a mesh of
//! WebRTC calls coordinated over a websocket room server, and local
//! recording of the outgoing stream.

pub mod audio;
pub mod config;
pub mod connection;
pub mod controls;
pub mod devices;
pub mod error;
pub mod media;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod video;
pub mod view;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{Error, Result};

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conference_client=debug,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting conference client v{}", env!("CARGO_PKG_VERSION"));
}
