//! Shared fixtures: an in-memory artifact repository fake and zip helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;
use zip::write::SimpleFileOptions;

use wincore::SourceError;
use wincore::jfrog::{ArtifactPayload, ArtifactSource};

/// In-memory artifact repository keyed by full URL. Probes are counted so
/// tests can assert discovery stays within its probe budget.
#[derive(Default)]
pub struct FakeRepo {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    /// URL prefixes for which every request is a 401.
    unauthorized_prefixes: Mutex<Vec<String>>,
    probes: AtomicUsize,
    /// Serve the checksum header when true.
    pub serve_checksums: bool,
}

impl FakeRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake that serves the `X-Checksum-Sha256` header for every build.
    pub fn with_checksums() -> Self {
        Self {
            serve_checksums: true,
            ..Self::default()
        }
    }

    pub fn publish(&self, url: &Url, body: Vec<u8>) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.as_str().to_string(), body);
    }

    pub fn deny_prefix(&self, prefix: &str) {
        self.unauthorized_prefixes
            .lock()
            .unwrap()
            .push(prefix.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn reset_probe_count(&self) {
        self.probes.store(0, Ordering::SeqCst);
    }

    fn denied(&self, url: &Url) -> bool {
        self.unauthorized_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| url.as_str().starts_with(p.as_str()))
    }
}

#[async_trait]
impl ArtifactSource for FakeRepo {
    async fn exists(&self, url: &Url) -> Result<bool, SourceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.denied(url) {
            return Err(SourceError::Unauthorized("401".to_string()));
        }
        Ok(self.bodies.lock().unwrap().contains_key(url.as_str()))
    }

    async fn fetch(&self, url: &Url) -> Result<ArtifactPayload, SourceError> {
        if self.denied(url) {
            return Err(SourceError::Unauthorized("401".to_string()));
        }
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or(SourceError::NotFound)?;
        let checksum_sha256 = self.serve_checksums.then(|| sha256_hex(&body));
        let chunks: Vec<Result<Bytes, SourceError>> = body
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(ArtifactPayload {
            content_length: Some(body.len() as u64),
            checksum_sha256,
            stream: Box::pin(stream::iter(chunks)),
        })
    }
}

/// Build a zip archive in memory from `(entry name, body)` pairs.
pub fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
