//! Catalog operations over the local store: duplicate, export/import and
//! usage accounting.

use loom_core::{DocumentMeta, DocumentPayload};
use serde::{Deserialize, Serialize};

use super::store::{LocalStore, StoreError};

/// Current export envelope version.
pub const EXPORT_VERSION: u32 = 1;

const IMPORTED_TITLE: &str = "Imported Graph";

/// Versioned export envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub version: u32,
    pub exported_at: u64,
    pub document: ExportedDocument,
}

/// Payload plus the metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(flatten)]
    pub payload: DocumentPayload,
}

/// Approximate space used against the advertised quota.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent: f64,
}

impl LocalStore {
    /// Copy a document under a new id, giving every node a new id.
    ///
    /// Edges are remapped through the old → new node id map, so the copy
    /// keeps its connections regardless of node order.
    pub fn duplicate(&self, id: &str) -> Result<DocumentMeta, StoreError> {
        let source = self
            .read_payload(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let title = self
            .meta(id)
            .map(|m| m.title)
            .unwrap_or_else(|| super::store::DEFAULT_TITLE.to_string());

        let new_id = loom_core::new_id();
        let copy = source.with_fresh_ids();
        let meta = self.write_payload(
            &new_id,
            &copy,
            Some(DocumentMeta::new(&new_id, format!("{title} (Copy)"))),
        )?;
        log::info!("Duplicated {id} into {new_id}");
        Ok(meta)
    }

    /// Serialize a document into the versioned export envelope.
    pub fn export(&self, id: &str) -> Result<String, StoreError> {
        let payload = self
            .read_payload(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let meta = self
            .meta(id)
            .unwrap_or_else(|| DocumentMeta::new(id, super::store::DEFAULT_TITLE));

        let envelope = ExportEnvelope {
            version: EXPORT_VERSION,
            exported_at: loom_core::now_millis(),
            document: ExportedDocument {
                id: meta.id,
                title: meta.title,
                created_at: meta.created_at,
                updated_at: meta.updated_at,
                payload: payload.without_ui_state(),
            },
        };
        Ok(serde_json::to_string_pretty(&envelope)?)
    }

    /// Create a new document from an export envelope.
    ///
    /// Input without a `document` field is rejected and nothing is written.
    pub fn import(&self, json: &str) -> Result<DocumentMeta, StoreError> {
        let mut value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidImport(e.to_string()))?;
        let document = value
            .get_mut("document")
            .map(serde_json::Value::take)
            .filter(|d| !d.is_null())
            .ok_or_else(|| StoreError::InvalidImport("missing `document` field".into()))?;

        let version = value.get("version").and_then(serde_json::Value::as_u64);
        if version.is_some_and(|v| v > u64::from(EXPORT_VERSION)) {
            log::warn!("Importing export version {version:?}, newer than {EXPORT_VERSION}");
        }

        let mut imported: ExportedDocument = serde_json::from_value(document)
            .map_err(|e| StoreError::InvalidImport(e.to_string()))?;
        let dropped = imported.payload.prune_dangling_edges();
        if dropped > 0 {
            log::warn!("Import dropped {dropped} edges with missing endpoints");
        }

        let title = match imported.title.trim() {
            "" => IMPORTED_TITLE.to_string(),
            t => t.to_string(),
        };
        let new_id = loom_core::new_id();
        let meta = self.write_payload(
            &new_id,
            &imported.payload,
            Some(DocumentMeta::new(&new_id, title)),
        )?;
        log::info!(
            "Imported document {new_id} ({} nodes, {} edges)",
            meta.node_count,
            meta.edge_count
        );
        Ok(meta)
    }

    /// Bytes held by the store relative to the configured quota.
    pub fn usage(&self) -> StorageUsage {
        let used_bytes = self.stored_bytes();
        let quota_bytes = self.config().quota_bytes;
        let percent = if quota_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / quota_bytes as f64 * 100.0
        };
        StorageUsage {
            used_bytes,
            quota_bytes,
            percent,
        }
    }
}
