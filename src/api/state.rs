use std::sync::Arc;

use crate::ingest::IngestBuffer;
use crate::storage::{IncidentStore, LogStore};

#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<IngestBuffer>,
    pub incidents: Arc<dyn IncidentStore>,
    pub logs: Arc<dyn LogStore>,
}
