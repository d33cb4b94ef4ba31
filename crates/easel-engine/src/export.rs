use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use easel_contracts::items::{ItemStatus, PromptItem};

/// Packages every successfully generated item into one zip archive, each
/// image stored under its derived name. Returns how many entries were
/// written; errors when nothing has completed.
pub fn write_archive(items: &[PromptItem], path: &Path) -> Result<usize> {
    let completed: Vec<&PromptItem> = items
        .iter()
        .filter(|item| item.status == ItemStatus::Ok && item.image_data.is_some())
        .collect();
    if completed.is_empty() {
        bail!("no completed items to export");
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for item in &completed {
        let Some(bytes) = item.image_data.as_deref() else {
            continue;
        };
        writer
            .start_file(item.name.as_str(), options)
            .with_context(|| format!("failed to add {} to archive", item.name))?;
        writer.write_all(bytes)?;
    }
    writer.finish().context("failed to finalize archive")?;
    Ok(completed.len())
}

/// Re-archives the image files saved in a previous run directory, for the
/// CLI `export` command.
pub fn archive_directory(dir: &Path, path: &Path) -> Result<usize> {
    let mut entries: Vec<std::path::PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|entry| {
            entry.is_file()
                && entry
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("png"))
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    if entries.is_empty() {
        bail!("no images found in {}", dir.display());
    }

    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for entry in &entries {
        let name = entry
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image.png");
        let bytes =
            std::fs::read(entry).with_context(|| format!("failed reading {}", entry.display()))?;
        writer.start_file(name, options)?;
        writer.write_all(&bytes)?;
    }
    writer.finish().context("failed to finalize archive")?;
    Ok(entries.len())
}
