//! Stream registry: the set of live pipelines keyed by stream id.
//!
//! Each map slot is in one of three states:
//! - `Starting`: id reserved by a create whose source is still opening.
//! - `Active`: pipeline running and visible to readers.
//! - `Stopping`: a delete is joining the workers.
//!
//! The map lock is never held while a source opens or a pipeline stops, so a
//! slow camera does not block status reads of every other stream. The slot
//! states keep a second create or delete for the same id from interleaving
//! with one in flight.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{AnalysisSettings, PipelineConfig, SettingsPatch, SharedSettings};
use crate::delivery;
use crate::detect::{default_factory, AnalysisResult, DetectorFactory};
use crate::error::StreamError;
use crate::ingest::{MediaOpener, SourceOpener, StreamSource};
use crate::pipeline::{Pipeline, PipelineStatus};

enum Slot {
    Starting,
    Active(Arc<Pipeline>),
    Stopping(Arc<Pipeline>),
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub streams: Vec<PipelineStatus>,
}

pub struct StreamRegistry {
    config: PipelineConfig,
    settings: SharedSettings,
    opener: Arc<dyn SourceOpener>,
    factory: DetectorFactory,
    slots: RwLock<HashMap<String, Slot>>,
}

impl StreamRegistry {
    /// Registry with the default media opener and detector stack.
    pub fn new(config: PipelineConfig, settings: AnalysisSettings) -> Self {
        let opener = Arc::new(MediaOpener::new(&config));
        Self::with_parts(
            config,
            Arc::new(RwLock::new(settings)),
            opener,
            default_factory(),
        )
    }

    pub fn with_parts(
        config: PipelineConfig,
        settings: SharedSettings,
        opener: Arc<dyn SourceOpener>,
        factory: DetectorFactory,
    ) -> Self {
        Self {
            config,
            settings,
            opener,
            factory,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Create and start a pipeline for `origin`. Returns the stream id.
    ///
    /// Without an explicit id one is generated from the current time in
    /// milliseconds, bumped until unique. If the source cannot be opened
    /// nothing is registered.
    pub fn create(&self, id: Option<&str>, origin: &str) -> Result<String, StreamError> {
        let origin = origin.trim();
        if origin.is_empty() {
            return Err(StreamError::InvalidRequest("url is required".to_string()));
        }

        let id = {
            let mut slots = self.write_slots();
            let id = match id.map(str::trim) {
                Some("") => {
                    return Err(StreamError::InvalidRequest(
                        "id must not be empty".to_string(),
                    ))
                }
                Some(id) if slots.contains_key(id) => {
                    return Err(StreamError::AlreadyExists(id.to_string()))
                }
                Some(id) => id.to_string(),
                None => generate_id(&slots),
            };
            slots.insert(id.clone(), Slot::Starting);
            id
        };

        let pipeline = Arc::new(Pipeline::new(
            StreamSource::new(id.clone(), origin),
            self.config.clone(),
            Arc::clone(&self.opener),
            Arc::clone(&self.factory),
            Arc::clone(&self.settings),
        ));

        match pipeline.start() {
            Ok(()) => {
                self.write_slots().insert(id.clone(), Slot::Active(pipeline));
                Ok(id)
            }
            Err(err) => {
                self.write_slots().remove(&id);
                Err(err)
            }
        }
    }

    /// Stop-and-join the pipeline, release its source, then remove the entry.
    pub fn delete(&self, id: &str) -> Result<(), StreamError> {
        let pipeline = {
            let mut slots = self.write_slots();
            let pipeline = match slots.get(id) {
                Some(Slot::Active(pipeline)) => Arc::clone(pipeline),
                _ => return Err(StreamError::NotFound(id.to_string())),
            };
            slots.insert(id.to_string(), Slot::Stopping(Arc::clone(&pipeline)));
            pipeline
        };

        pipeline.stop();
        self.write_slots().remove(id);
        log::info!("stream {} deleted", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<PipelineStatus, StreamError> {
        self.pipeline(id).map(|pipeline| pipeline.status())
    }

    /// Status of every registered stream, ordered by id.
    pub fn list(&self) -> Vec<PipelineStatus> {
        let mut statuses: Vec<_> = self
            .registered()
            .iter()
            .map(|pipeline| pipeline.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn stats(&self) -> RegistryStats {
        let streams = self.list();
        RegistryStats {
            total_streams: streams.len(),
            active_streams: streams.iter().filter(|s| s.running).count(),
            streams,
        }
    }

    /// Read access to an active pipeline for delivery code.
    pub fn pipeline(&self, id: &str) -> Result<Arc<Pipeline>, StreamError> {
        match self.read_slots().get(id) {
            Some(Slot::Active(pipeline)) => Ok(Arc::clone(pipeline)),
            _ => Err(StreamError::NotFound(id.to_string())),
        }
    }

    pub fn latest_result(&self, id: &str) -> Result<Option<Arc<AnalysisResult>>, StreamError> {
        self.pipeline(id).map(|pipeline| pipeline.latest_result())
    }

    /// JPEG of the latest annotated frame, falling back to the latest raw
    /// frame. A missing stream surfaces as a `StreamError` inside the error.
    pub fn snapshot_jpeg(&self, id: &str) -> anyhow::Result<Vec<u8>> {
        let pipeline = self.pipeline(id)?;
        delivery::snapshot_jpeg(&pipeline)
    }

    pub fn settings(&self) -> AnalysisSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `patch` into the shared settings. Running pipelines pick the
    /// change up on their next frame.
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<AnalysisSettings, StreamError> {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings
            .apply(patch)
            .map_err(|err| StreamError::InvalidRequest(format!("{err:#}")))?;
        log::info!(
            "analysis settings updated (detection: {}, motion: {})",
            settings.detection.enabled,
            settings.motion.enabled
        );
        Ok(settings.clone())
    }

    pub fn len(&self) -> usize {
        self.registered().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and remove every pipeline.
    pub fn shutdown(&self) {
        let pipelines: Vec<Arc<Pipeline>> = {
            let mut slots = self.write_slots();
            let mut taken = Vec::new();
            for slot in slots.values_mut() {
                if let Slot::Active(pipeline) = slot {
                    let pipeline = Arc::clone(pipeline);
                    *slot = Slot::Stopping(Arc::clone(&pipeline));
                    taken.push(pipeline);
                }
            }
            taken
        };

        for pipeline in &pipelines {
            pipeline.stop();
        }

        let mut slots = self.write_slots();
        for pipeline in &pipelines {
            slots.remove(pipeline.id());
        }
        log::info!("registry shut down ({} streams stopped)", pipelines.len());
    }

    fn registered(&self) -> Vec<Arc<Pipeline>> {
        self.read_slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(pipeline) => Some(Arc::clone(pipeline)),
                Slot::Starting | Slot::Stopping(_) => None,
            })
            .collect()
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_id(slots: &HashMap<String, Slot>) -> String {
    let mut candidate = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    while slots.contains_key(&candidate.to_string()) {
        candidate += 1;
    }
    candidate.to_string()
}
