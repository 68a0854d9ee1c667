//! Download, track, and clean up user-uploaded media.
//!
//! Files land in a dedicated directory under the system temp dir. The
//! store remembers what it downloaded so `/clear` and session resets can
//! delete exactly those files; a best-effort purge at startup sweeps
//! leftovers from a previous crash.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{Document, PhotoSize};

use tc_domain::{Error, Result};

pub struct MediaStore {
    upload_dir: PathBuf,
    files: Mutex<Vec<PathBuf>>,
}

impl MediaStore {
    pub fn new() -> Self {
        Self::with_dir(std::env::temp_dir().join("teleclaude-uploads"))
    }

    pub fn with_dir(upload_dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&upload_dir) {
            tracing::warn!(error = %e, dir = %upload_dir.display(), "cannot create upload dir");
        }
        Self {
            upload_dir,
            files: Mutex::new(Vec::new()),
        }
    }

    /// Download a photo variant and return its local path.
    pub async fn save_photo(&self, bot: &Bot, photo: &PhotoSize) -> Result<PathBuf> {
        let file = bot
            .get_file(photo.file.id.clone())
            .await
            .map_err(|e| Error::Telegram(e.to_string()))?;
        let ext = Path::new(&file.path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".jpg".to_string());
        let local = self
            .upload_dir
            .join(format!("photo_{}{ext}", photo.file.unique_id));
        self.download(bot, &file.path, &local).await?;
        tracing::info!(path = %local.display(), "saved photo");
        Ok(local)
    }

    /// Download a document and return its local path.
    pub async fn save_document(&self, bot: &Bot, doc: &Document) -> Result<PathBuf> {
        let file = bot
            .get_file(doc.file.id.clone())
            .await
            .map_err(|e| Error::Telegram(e.to_string()))?;
        let name = doc
            .file_name
            .clone()
            .unwrap_or_else(|| format!("file_{}", doc.file.unique_id));
        let local = self.upload_dir.join(name);
        self.download(bot, &file.path, &local).await?;
        tracing::info!(path = %local.display(), "saved document");
        Ok(local)
    }

    async fn download(&self, bot: &Bot, remote: &str, local: &Path) -> Result<()> {
        let mut dst = tokio::fs::File::create(local).await?;
        bot.download_file(remote, &mut dst)
            .await
            .map_err(|e| Error::Telegram(e.to_string()))?;
        self.files.lock().push(local.to_path_buf());
        Ok(())
    }

    /// One prompt text with a preamble line per attachment.
    pub fn build_prompt(text: &str, photos: &[PathBuf], docs: &[PathBuf]) -> String {
        let mut parts: Vec<String> = Vec::new();
        for path in photos {
            parts.push(format!("[User sent a photo: {}]", path.display()));
        }
        for path in docs {
            parts.push(format!("[User sent a file: {}]", path.display()));
        }
        if !text.is_empty() {
            parts.push(text.to_string());
        }
        parts.join("\n")
    }

    /// Delete every tracked file.
    pub fn cleanup(&self) {
        let files = std::mem::take(&mut *self.files.lock());
        for path in files {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(error = %e, path = %path.display(), "cleanup skipped");
            }
        }
    }

    /// Startup recovery: delete everything in the upload dir, tracked or
    /// not.
    pub fn purge_all(&self) {
        self.cleanup();
        let Ok(entries) = std::fs::read_dir(&self.upload_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

impl Default for MediaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_with_text_only() {
        assert_eq!(MediaStore::build_prompt("hello", &[], &[]), "hello");
    }

    #[test]
    fn prompt_with_attachments() {
        let photos = vec![PathBuf::from("/tmp/photo_1.jpg")];
        let docs = vec![PathBuf::from("/tmp/report.pdf")];
        assert_eq!(
            MediaStore::build_prompt("look at this", &photos, &docs),
            "[User sent a photo: /tmp/photo_1.jpg]\n[User sent a file: /tmp/report.pdf]\nlook at this"
        );
    }

    #[test]
    fn prompt_with_attachments_and_no_text() {
        let photos = vec![PathBuf::from("/tmp/photo_1.jpg")];
        assert_eq!(
            MediaStore::build_prompt("", &photos, &[]),
            "[User sent a photo: /tmp/photo_1.jpg]"
        );
    }

    #[test]
    fn empty_everything_is_empty() {
        assert_eq!(MediaStore::build_prompt("", &[], &[]), "");
    }

    #[test]
    fn cleanup_removes_tracked_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::with_dir(dir.path().to_path_buf());

        let tracked = dir.path().join("tracked.txt");
        let untracked = dir.path().join("untracked.txt");
        std::fs::write(&tracked, "a").unwrap();
        std::fs::write(&untracked, "b").unwrap();
        store.files.lock().push(tracked.clone());

        store.cleanup();
        assert!(!tracked.exists());
        assert!(untracked.exists());
    }

    #[test]
    fn purge_all_sweeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::with_dir(dir.path().to_path_buf());
        std::fs::write(dir.path().join("leftover.bin"), "x").unwrap();

        store.purge_all();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
