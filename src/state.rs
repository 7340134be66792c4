use crate::session_actor::SessionServices;

#[derive(Clone)]
pub struct AppState {
    pub services: SessionServices,
}
