use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error accessing camera and microphone: {0}")]
    MediaAccessDenied(String),

    #[error("Peer connection error: {0}")]
    PeerIdentity(String),

    #[error("Call error: {0}")]
    Call(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media pipeline error: {0}")]
    Media(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The error taxonomy the session reasons about when deciding how loudly to
/// report something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MediaAccessDenied,
    PeerIdentity,
    Call,
    SignalingError,
    Recording,
    Internal,
}

/// How a failure is shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Modal alert; the failing setup path stops.
    BlockingAlert,
    /// On-screen message; the session carries on.
    Notice,
}

impl ErrorKind {
    pub fn surface(self) -> Surface {
        match self {
            ErrorKind::MediaAccessDenied | ErrorKind::PeerIdentity => Surface::BlockingAlert,
            ErrorKind::Call
            | ErrorKind::SignalingError
            | ErrorKind::Recording
            | ErrorKind::Internal => Surface::Notice,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MediaAccessDenied(_) => ErrorKind::MediaAccessDenied,
            Error::PeerIdentity(_) => ErrorKind::PeerIdentity,
            Error::Call(_) | Error::WebRTC(_) => ErrorKind::Call,
            Error::Signaling(_) | Error::WebSocket(_) => ErrorKind::SignalingError,
            Error::Recording(_) => ErrorKind::Recording,
            Error::Config(_) | Error::Media(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Text for a blocking alert. Media failures carry the original hint to
    /// grant permissions.
    pub fn alert_text(&self) -> String {
        match self {
            Error::MediaAccessDenied(_) => {
                format!("{}. Please allow permissions and try again.", self)
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
