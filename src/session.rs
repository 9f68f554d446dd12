use std::fs;
use std::path::{Path, PathBuf};

use image::GenericImageView;

use crate::error::EngineError;

/// Root directory for all search session data.
pub fn data_root() -> PathBuf {
    crate::config::non_empty_env("BEAMGEN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("media")
                .join("beamgen")
        })
}

/// Path to the SQLite session index.
pub fn db_path(root: &Path) -> PathBuf {
    root.join("index.sqlite")
}

/// New human-readable session id: ses-HHMMSS.
pub fn new_session_id() -> String {
    chrono::Local::now().format("ses-%H%M%S").to_string()
}

/// Length cap for prompt slugs in the index and export filenames.
const SLUG_MAX_LEN: usize = 48;

/// Short filesystem-safe tag for a prompt. Accumulates slugified words until
/// the cap; a word that would not fit whole is dropped rather than cut, so a
/// slug never ends mid-word.
pub fn slugify_prompt(prompt: &str) -> String {
    let mut out = String::new();
    for word in prompt.split_whitespace() {
        let piece = slug::slugify(word);
        if piece.is_empty() {
            continue;
        }
        if out.is_empty() {
            if piece.len() > SLUG_MAX_LEN {
                out.push_str(&piece[..SLUG_MAX_LEN]);
                break;
            }
            out.push_str(&piece);
        } else {
            if out.len() + 1 + piece.len() > SLUG_MAX_LEN {
                break;
            }
            out.push('-');
            out.push_str(&piece);
        }
    }

    if out.is_empty() {
        "untitled-search".to_string()
    } else {
        out
    }
}

/// Resolved location of one session under {root}/{YYYY-MM-DD}/{sessionId}/.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
    pub date: String,
    pub session_id: String,
}

impl SessionPaths {
    /// Place a session under today's date partition.
    pub fn new(root: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
            session_id: session_id.into(),
        }
    }

    /// Address an existing session under a known date partition.
    pub fn existing(
        root: impl Into<PathBuf>,
        date: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            date: date.into(),
            session_id: session_id.into(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.date).join(&self.session_id)
    }

    /// Create the session directory. An unwritable session root is fatal.
    pub fn ensure_dir(&self) -> Result<(), EngineError> {
        fs::create_dir_all(self.dir())
            .map_err(|e| EngineError::fatal(format!("cannot create session directory: {e}")))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir().join("metadata.json")
    }

    pub fn rankings_path(&self) -> PathBuf {
        self.dir().join("rankings.json")
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.dir().join("tokens.json")
    }

    /// Canonical image path: iter{n}-cand{m}.png. The candidate id is the
    /// file stem.
    pub fn image_path(&self, candidate_id: &str) -> PathBuf {
        self.dir().join(format!("{candidate_id}.png"))
    }

    /// Pre-face-fix base variant: iter{n}-cand{m}-base.png.
    pub fn base_image_path(&self, candidate_id: &str) -> PathBuf {
        self.dir().join(format!("{candidate_id}-base.png"))
    }

    pub fn evaluation_path(&self, evaluation_id: &str) -> PathBuf {
        self.dir().join(format!("evaluation-{evaluation_id}.json"))
    }
}

/// Dimensions and size of a saved image.
#[derive(Debug, Clone, Copy)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
}

/// Write image bytes to the canonical path and probe the decoded dimensions.
pub fn save_image(data: &[u8], dest: &Path) -> Result<ImageProbe, EngineError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, data)?;

    let img = image::load_from_memory(data)
        .map_err(|e| EngineError::parse(format!("cannot decode generated image: {e}")))?;
    let (width, height) = img.dimensions();

    Ok(ImageProbe {
        width,
        height,
        file_size: data.len() as u64,
    })
}

/// Copy a provider's temporary output into the session directory. Used when
/// an off-process service writes somewhere ephemeral and only hands back a
/// path.
pub fn adopt_image(temp_path: &Path, dest: &Path) -> Result<(), EngineError> {
    if temp_path == dest {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(temp_path, dest)?;
    Ok(())
}

/// Copy an image to a destination path (winner export).
pub fn copy_to(source: &Path, dest: &Path) -> Result<(), EngineError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::new(width, height);
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn slug_keeps_whole_words_up_to_the_cap() {
        assert_eq!(
            slugify_prompt("A Mountain Lake at Sunset"),
            "a-mountain-lake-at-sunset"
        );
        // The word that would overflow the cap is dropped, not cut.
        assert_eq!(
            slugify_prompt(
                "an extraordinarily detailed panoramic photograph of weathered fishing boats"
            ),
            "an-extraordinarily-detailed-panoramic-photograph"
        );
        assert_eq!(slugify_prompt("   "), "untitled-search");
        assert_eq!(slugify_prompt("!!! ???"), "untitled-search");
    }

    #[test]
    fn session_paths_are_date_partitioned() {
        let paths = SessionPaths::existing("/data", "2026-08-01", "ses-120000");
        assert_eq!(
            paths.metadata_path(),
            PathBuf::from("/data/2026-08-01/ses-120000/metadata.json")
        );
        assert_eq!(
            paths.image_path("iter0-cand2"),
            PathBuf::from("/data/2026-08-01/ses-120000/iter0-cand2.png")
        );
        assert_eq!(
            paths.base_image_path("iter0-cand2"),
            PathBuf::from("/data/2026-08-01/ses-120000/iter0-cand2-base.png")
        );
    }

    #[test]
    fn save_image_probes_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("iter0-cand0.png");
        let probe = save_image(&png_bytes(8, 4), &dest).unwrap();
        assert_eq!(probe.width, 8);
        assert_eq!(probe.height, 4);
        assert!(dest.exists());
    }

    #[test]
    fn adopt_image_copies_temp_output() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("scratch.png");
        fs::write(&temp, png_bytes(2, 2)).unwrap();

        let dest = dir.path().join("session").join("iter0-cand0.png");
        adopt_image(&temp, &dest).unwrap();
        assert!(dest.exists());
        assert!(temp.exists());
    }

    #[test]
    fn session_id_shape() {
        let id = new_session_id();
        assert!(id.starts_with("ses-"));
        assert_eq!(id.len(), "ses-".len() + 6);
    }
}
