//! Artifact transfer between containers and HTTP endpoints.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::{CellError, CellResult};

/// Largest file a `fetch_result` action may return.
pub const MAX_RESULT_BYTES: u64 = 10 * 1024;

/// Resolve `relative` inside `sandbox`, refusing absolute paths and `..`.
pub fn sandbox_path(sandbox: &Path, relative: &str) -> CellResult<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(CellError::Sandbox(relative.to_string()));
    }
    Ok(sandbox.join(rel))
}

/// HTTP client for download and upload actions.
#[derive(Clone, Default)]
pub struct Transfer {
    client: reqwest::Client,
}

impl Transfer {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch `url` to `dest`, unpacking a gzipped tarball into `dest` as a
    /// directory when `extract` is set. Fails if the body exceeds
    /// `max_bytes`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        extract: bool,
        max_bytes: u64,
    ) -> CellResult<u64> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        if let Some(len) = response.content_length()
            && len > max_bytes
        {
            return Err(CellError::Transfer(format!(
                "{url}: {len} bytes exceeds disk limit of {max_bytes}"
            )));
        }
        let body = response.bytes().await?;
        let size = body.len() as u64;
        if size > max_bytes {
            return Err(CellError::Transfer(format!(
                "{url}: {size} bytes exceeds disk limit of {max_bytes}"
            )));
        }

        if extract {
            std::fs::create_dir_all(dest)?;
            let mut archive = tar::Archive::new(GzDecoder::new(body.as_ref()));
            archive.unpack(dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, &body)?;
        }
        debug!(%url, dest = ?dest, size, extract, "downloaded");
        Ok(size)
    }

    /// POST a gzipped tarball of `src` (a file or directory) to `url`.
    pub async fn upload(&self, src: &Path, url: &str) -> CellResult<u64> {
        let archive = pack(src)?;
        let size = archive.len() as u64;
        self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(archive)
            .send()
            .await?
            .error_for_status()?;
        debug!(src = ?src, %url, size, "uploaded");
        Ok(size)
    }
}

fn pack(src: &Path) -> CellResult<Vec<u8>> {
    let name = src
        .file_name()
        .ok_or_else(|| CellError::Sandbox(src.display().to_string()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    if src.is_dir() {
        builder.append_dir_all(name, src)?;
    } else {
        builder.append_path_with_name(src, name)?;
    }
    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

/// Read a task result file verbatim.
pub fn fetch_result(path: &Path) -> CellResult<String> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_RESULT_BYTES {
        return Err(CellError::Transfer(format!(
            "result file is {size} bytes, limit is {MAX_RESULT_BYTES}"
        )));
    }
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes)
        .map_err(|_| CellError::Transfer("result is not valid UTF-8".to_string()))
}
