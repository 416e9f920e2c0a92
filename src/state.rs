use crate::bridge::HeaderCapture;
use crate::session::Session;
use std::sync::Arc;

// control server's shared state
pub struct AppState {
    pub session: Arc<Session>,
    pub capture: Arc<HeaderCapture>, // fed from observed page traffic
}
