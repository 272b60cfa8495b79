//! Resolution of pipeline URIs to definitions.
//!
//! Supports in-process resources (`res://`), local files (`file://`,
//! transparently gunzipped) and remote descriptors (`http(s)://`, optionally
//! base64+gzip transport-compressed). Built definitions are cached by URI.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};

use base64::Engine;
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::config::DefinitionConfig;
use crate::definition::Definition;
use crate::error::{PipelineError, PipelineResult};
use crate::mapper::MapperFactory;
use crate::registry::ActivityRegistry;
use crate::resolve::Resolver;

const URI_SCHEME_RES: &str = "res://";
const URI_SCHEME_FILE: &str = "file://";
const URI_SCHEME_HTTP: &str = "http://";
const URI_SCHEME_HTTPS: &str = "https://";

/// Response header marking a base64+gzip compressed descriptor body.
const HEADER_COMPRESSED: &str = "stream-compressed";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Resolves and caches pipeline definitions by URI.
pub struct Manager {
    registry: Arc<ActivityRegistry>,
    mapper_factory: MapperFactory,
    resolver: Arc<Resolver>,

    resources: RwLock<HashMap<String, DefinitionConfig>>,
    // protects the definition cache
    cache: Mutex<HashMap<String, Arc<Definition>>>,

    client: reqwest::blocking::Client,
}

impl Manager {
    pub fn new(registry: Arc<ActivityRegistry>, resolver: Arc<Resolver>) -> Manager {
        Manager {
            registry,
            mapper_factory: MapperFactory::new(resolver.clone()),
            resolver,
            resources: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            client: reqwest::blocking::Client::new(),
        }
    }

    /// Registers an inline descriptor addressable as `res://id`.
    pub fn register_resource(&self, id: &str, config: DefinitionConfig) {
        self.resources
            .write()
            .unwrap()
            .insert(id.to_string(), config);
    }

    /// Resolves `uri` to a built definition, fetching and building on first
    /// use.
    pub fn get_pipeline(&self, uri: &str) -> PipelineResult<Arc<Definition>> {
        let mut cache = self.cache.lock().unwrap();

        if let Some(def) = cache.get(uri) {
            return Ok(def.clone());
        }

        let config = self.fetch(uri)?;
        let def = Arc::new(Definition::new(
            &config,
            &self.registry,
            &self.mapper_factory,
            &self.resolver,
        )?);

        cache.insert(uri.to_string(), def.clone());
        Ok(def)
    }

    fn fetch(&self, uri: &str) -> PipelineResult<DefinitionConfig> {
        if let Some(id) = uri.strip_prefix(URI_SCHEME_RES) {
            return self
                .resources
                .read()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| PipelineError::InvalidConfig {
                    message: format!("pipeline resource '{}' not registered", id),
                });
        }

        let bytes = if let Some(path) = uri.strip_prefix(URI_SCHEME_FILE) {
            self.read_file(path)?
        } else if uri.starts_with(URI_SCHEME_HTTP) || uri.starts_with(URI_SCHEME_HTTPS) {
            self.read_remote(uri)?
        } else {
            return Err(PipelineError::UnsupportedScheme {
                uri: uri.to_string(),
            });
        };

        let config: DefinitionConfig = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    fn read_file(&self, path: &str) -> PipelineResult<Vec<u8>> {
        info!("loading local pipeline: {}", path);
        let bytes = std::fs::read(path)?;

        if bytes.starts_with(&GZIP_MAGIC) {
            debug!("pipeline file '{}' is gzip compressed", path);
            return gunzip(&bytes);
        }

        Ok(bytes)
    }

    fn read_remote(&self, uri: &str) -> PipelineResult<Vec<u8>> {
        info!("loading remote pipeline: {}", uri);
        let response = self.client.get(uri).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::InvalidConfig {
                message: format!(
                    "error getting pipeline with uri '{}', status code {}",
                    uri, status
                ),
            });
        }

        let compressed = response
            .headers()
            .get(HEADER_COMPRESSED)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let body = response.bytes()?.to_vec();

        if compressed {
            return decode_and_gunzip(&body);
        }

        Ok(body)
    }
}

fn decode_and_gunzip(encoded: &[u8]) -> PipelineResult<Vec<u8>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| PipelineError::InvalidConfig {
            message: format!("error decoding compressed pipeline: {}", e),
        })?;
    gunzip(&decoded)
}

fn gunzip(compressed: &[u8]) -> PipelineResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const DESCRIPTOR: &str = r#"
    {
        "name": "noop",
        "metadata": { "input": [{"name": "value", "type": "any"}] },
        "stages": []
    }
    "#;

    fn manager() -> Manager {
        Manager::new(Arc::new(ActivityRegistry::new()), Arc::new(Resolver::new()))
    }

    #[test]
    fn test_resource_scheme() {
        let m = manager();
        let config: DefinitionConfig = serde_json::from_str(DESCRIPTOR).unwrap();
        m.register_resource("noop", config);

        let def = m.get_pipeline("res://noop").unwrap();
        assert_eq!(def.name(), "noop");
        assert!(m.get_pipeline("res://missing").is_err());
    }

    #[test]
    fn test_definitions_are_cached_by_uri() {
        let m = manager();
        let config: DefinitionConfig = serde_json::from_str(DESCRIPTOR).unwrap();
        m.register_resource("noop", config);

        let a = m.get_pipeline("res://noop").unwrap();
        let b = m.get_pipeline("res://noop").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_file_scheme() {
        let path = std::env::temp_dir().join(format!("pipeline-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, DESCRIPTOR).unwrap();

        let def = manager()
            .get_pipeline(&format!("file://{}", path.display()))
            .unwrap();
        assert_eq!(def.name(), "noop");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_file_scheme_gzip() {
        let path = std::env::temp_dir().join(format!("pipeline-{}.json.gz", uuid::Uuid::new_v4()));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DESCRIPTOR.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let def = manager()
            .get_pipeline(&format!("file://{}", path.display()))
            .unwrap();
        assert_eq!(def.name(), "noop");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = manager().get_pipeline("ftp://somewhere/pipeline.json").unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedScheme { .. }));
    }
}
