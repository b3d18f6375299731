use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use reqwest::Client;
use tokio::io::AsyncWriteExt as _;

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(40);
pub const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// True when the file at `path` starts with the `%PDF` header.
pub fn has_pdf_magic(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut head = [0u8; 4];
    file.read_exact(&mut head).is_ok() && &head == PDF_MAGIC
}

/// Streams `url` to `dest`. Returns true only when a file with a PDF header
/// now sits at `dest`; on any failure nothing is left behind.
pub async fn download_pdf(client: &Client, url: &str, dest: &Path) -> bool {
    match try_download(client, url, dest).await {
        Ok(saved) => saved,
        Err(err) => {
            tracing::warn!(%url, err = format!("{err:#}"), "pdf download failed");
            false
        }
    }
}

async fn try_download(client: &Client, url: &str, dest: &Path) -> anyhow::Result<bool> {
    let mut response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;

    let status = response.status();
    if status.as_u16() >= 400 {
        tracing::warn!(%url, status = status.as_u16(), "pdf download rejected");
        return Ok(false);
    }

    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("download path must have parent: {}", dest.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create download dir: {}", parent.display()))?;

    let partial = partial_path(dest);
    if let Err(err) = write_body(&mut response, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }

    if !has_pdf_magic(&partial) {
        tracing::warn!(%url, "response is not a pdf (magic header)");
        let _ = tokio::fs::remove_file(&partial).await;
        return Ok(false);
    }

    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("move download into place: {}", dest.display()))?;
    Ok(true)
}

async fn write_body(response: &mut reqwest::Response, path: &Path) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create download file: {}", path.display()))?;
    while let Some(chunk) = response.chunk().await.context("read response body")? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write download file: {}", path.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("flush download file: {}", path.display()))?;
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
