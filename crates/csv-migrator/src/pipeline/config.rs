use std::time::Duration;

use crate::config::Config;

/// Settings for the chunked batch processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub wave_timeout: Option<Duration>,
    pub collection: String,
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            wave_timeout: config.wave_timeout_secs.map(Duration::from_secs),
            collection: config.destination.collection.clone(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_concurrency: num_cpus::get().max(1),
            wave_timeout: None,
            collection: "records".to_string(),
        }
    }
}
