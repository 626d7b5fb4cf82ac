use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::RendererConfig;
use crate::error::{RagError, Result};

/// Renders a source document into one image per page.
pub trait PageRasterizer: Send + Sync {
    /// Image paths ordered by zero-based page index.
    fn render_pages(&self, source: &Path, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Shells out to poppler's `pdftoppm` and leaves `{page_index}.jpg` files behind.
#[derive(Debug, Clone)]
pub struct CommandRasterizer {
    program: String,
    dpi: u32,
}

impl CommandRasterizer {
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            program: config.command.clone(),
            dpi: config.dpi,
        }
    }
}

impl Default for CommandRasterizer {
    fn default() -> Self {
        Self::new(&RendererConfig::default())
    }
}

impl PageRasterizer for CommandRasterizer {
    fn render_pages(&self, source: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(out_dir)?;
        let prefix = out_dir.join("page");
        let output = Command::new(&self.program)
            .arg("-jpeg")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(source)
            .arg(&prefix)
            .output()
            .map_err(|err| RagError::Rasterize {
                path: source.to_path_buf(),
                reason: format!("failed to run {}: {err}", self.program),
            })?;
        if !output.status.success() {
            return Err(RagError::Rasterize {
                path: source.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut pages: Vec<(usize, PathBuf)> = Vec::new();
        for entry in fs::read_dir(out_dir)? {
            let path = entry?.path();
            if let Some(number) = rendered_page_number(&path) {
                pages.push((number, path));
            }
        }
        pages.sort_by_key(|(number, _)| *number);

        let mut images = Vec::with_capacity(pages.len());
        for (number, path) in pages {
            let target = out_dir.join(format!("{}.jpg", number.saturating_sub(1)));
            fs::rename(&path, &target)?;
            images.push(target);
        }
        info!(source = %source.display(), pages = images.len(), "pages rendered");
        Ok(images)
    }
}

/// `page-7.jpg` / `page-07.jpg` → 7.
fn rendered_page_number(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix("page-")?.strip_suffix(".jpg")?;
    stem.parse().ok()
}

/// Page images rendered ahead of time as `{page_index}.jpg` in one directory.
#[derive(Debug, Clone)]
pub struct PrerenderedPages {
    dir: PathBuf,
}

impl PrerenderedPages {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PageRasterizer for PrerenderedPages {
    fn render_pages(&self, source: &Path, _out_dir: &Path) -> Result<Vec<PathBuf>> {
        let images: Vec<PathBuf> = (0usize..)
            .map(|idx| self.dir.join(format!("{idx}.jpg")))
            .take_while(|path| path.is_file())
            .collect();
        if images.is_empty() {
            return Err(RagError::Rasterize {
                path: source.to_path_buf(),
                reason: format!("no page images in {}", self.dir.display()),
            });
        }
        debug!(dir = %self.dir.display(), pages = images.len(), "using pre-rendered pages");
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_pdftoppm_names() {
        assert_eq!(rendered_page_number(Path::new("/tmp/page-07.jpg")), Some(7));
        assert_eq!(rendered_page_number(Path::new("page-1.jpg")), Some(1));
        assert_eq!(rendered_page_number(Path::new("3_highlighted.jpg")), None);
    }

    #[test]
    fn prerendered_pages_stop_at_first_gap() {
        let dir = tempdir().unwrap();
        for name in ["0.jpg", "1.jpg", "3.jpg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pages = PrerenderedPages::new(dir.path())
            .render_pages(Path::new("doc.pdf"), dir.path())
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[1].ends_with("1.jpg"));
    }

    #[test]
    fn missing_program_is_a_rasterize_error() {
        let dir = tempdir().unwrap();
        let rasterizer = CommandRasterizer::new(&RendererConfig {
            command: "definitely-not-a-renderer".to_string(),
            dpi: 72,
        });
        let err = rasterizer
            .render_pages(Path::new("doc.pdf"), dir.path())
            .unwrap_err();
        assert!(matches!(err, RagError::Rasterize { .. }));
    }
}
