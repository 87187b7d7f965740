use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Extract a zip archive into `dest_dir`.
///
/// Entries whose path would land outside `dest_dir` are rejected. Returns the
/// relative paths of every extracted file.
pub fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    log::debug!("Extracting {:?} to: {:?}", archive, dest_dir);

    fs::create_dir_all(dest_dir).with_context(|| format!("Create staging dir {:?}", dest_dir))?;

    let file = File::open(archive).with_context(|| format!("Open archive {:?}", archive))?;
    let mut zip = zip::ZipArchive::new(file).context("Invalid zip archive")?;
    let mut files = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("Read archive entry {}", i))?;
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => anyhow::bail!("Archive entry {:?} escapes the staging directory", entry.name()),
        };
        let outpath = dest_dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath).with_context(|| format!("Create dir {:?}", outpath))?;
        } else {
            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p).with_context(|| format!("Create dir {:?}", p))?;
            }
            let mut outfile =
                File::create(&outpath).with_context(|| format!("Create file {:?}", outpath))?;
            std::io::copy(&mut entry, &mut outfile)
                .with_context(|| format!("Extract {:?}", relative))?;
            files.push(relative);
        }

        // Set permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Set permissions on {:?}", outpath))?;
            }
        }
    }

    log::debug!("Zip extraction complete: {} files", files.len());
    Ok(files)
}

/// Check that staging holds every file the archive listed
pub fn verify_staging(staging: &Path, files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        anyhow::bail!("Archive contained no files");
    }

    let missing: Vec<&PathBuf> = files
        .iter()
        .filter(|relative| !staging.join(relative).is_file())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("Staging is missing {} files, first {:?}", missing.len(), missing[0]);
    }
    Ok(())
}
