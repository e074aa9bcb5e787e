// src/config/mod.rs
pub mod sources;

pub use sources::{
    PipelineConfig, SourceConfig, SourceConfigPatch, AI_EXTRACTOR, CATALOG_API, CRAWL_SERVICE,
    HEADLESS_BROWSER,
};
