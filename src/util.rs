use std::path::Path;

use tracing::debug;

/// Moves a file, falling back to copy and delete across filesystems
pub async fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    debug!(from = ?src, to = ?dest, "Moving file");

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(src, dest).await.is_err() {
        tokio::fs::copy(src, dest).await?;
        tokio::fs::remove_file(src).await?;
    }

    debug!(from = ?src, to = ?dest, "File moved successfully");
    Ok(())
}

/// Strips path separators and control characters from a filename
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string()
}
