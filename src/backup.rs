use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::db;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/music_school.sqlite3";
pub const BUNDLE_FORMAT: &str = "dmsh-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

/// Packs the workspace database and every generated document into a zip
/// bundle. The manifest carries a sha256 digest per payload entry so a
/// restore can verify the archive before touching the live workspace.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = db::db_path(workspace_path);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    entries.push((DB_ENTRY.to_string(), db_bytes));

    let documents = db::documents_dir(workspace_path);
    if documents.is_dir() {
        collect_files(&documents, &documents, &mut entries)?;
    }

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let checksums: Vec<serde_json::Value> = entries
        .iter()
        .map(|(name, bytes)| {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            json!({ "entry": name, "sha256": format!("{:x}", hasher.finalize()) })
        })
        .collect();
    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "checksums": checksums,
    });

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for (name, bytes) in &entries {
        zip.start_file(name, opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write entry {}", name))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: entries.len() + 1,
    })
}

fn collect_files(
    root: &Path,
    dir: &Path,
    entries: &mut Vec<(String, Vec<u8>)>,
) -> anyhow::Result<()> {
    for ent in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.to_string_lossy()))?
    {
        let path = ent?.path();
        if path.is_dir() {
            collect_files(root, &path, entries)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| anyhow!("path escapes documents root"))?;
            // Zip entry names always use forward slashes.
            let name = format!(
                "documents/{}",
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            );
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
            entries.push((name, bytes));
        }
    }
    Ok(())
}
