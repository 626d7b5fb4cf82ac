//! Maps a generated answer back onto the page region it quotes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use policy_rag_core::{parse_tags, strip_tags, PageGeometry, PdfGeometry, PositionTag};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HighlightConfig;
use crate::error::{RagError, Result};
use crate::raster::{CommandRasterizer, PageRasterizer};
use crate::retriever::SearchResult;
use crate::similarity::similarity_ratio;

const HIGHLIGHT: Rgb<u8> = Rgb([255, 255, 0]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMatch {
    pub document_name: String,
    /// The answer line that matched.
    pub quoted_text: String,
    /// The span it matched, tags included.
    pub matched_source_text: String,
    pub similarity_score: f64,
    pub position_tags: Vec<PositionTag>,
}

/// Pixel rectangle on one page image; corners may fall outside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x0: i64,
    pub y0: i64,
    pub x1: i64,
    pub y1: i64,
}

/// The single most similar (answer line, span) pair across all lines and
/// all results. Later pairs only win with a strictly higher score, and a
/// score of zero never matches.
pub fn find_best_match<S: AsRef<str>>(answer_lines: &[S], results: &[SearchResult]) -> Option<EvidenceMatch> {
    let mut best: Option<EvidenceMatch> = None;
    let mut best_score = 0.0;
    for line in answer_lines {
        let line = line.as_ref();
        for result in results {
            for span in &result.relevant_spans {
                let score = similarity_ratio(line, &strip_tags(&span.text));
                if score > best_score {
                    best_score = score;
                    best = Some(EvidenceMatch {
                        document_name: result.document_name.clone(),
                        quoted_text: line.to_string(),
                        matched_source_text: span.text.clone(),
                        similarity_score: score,
                        position_tags: parse_tags(&span.text),
                    });
                }
            }
        }
    }
    best
}

/// Tag box in stacked document points → pixels on its own page image.
pub fn map_box(tag: &PositionTag, page_size_pts: (f64, f64), image_size: (u32, u32)) -> PixelBox {
    let (page_w, page_h) = page_size_pts;
    let scale_x = image_size.0 as f64 / page_w;
    let scale_y = image_size.1 as f64 / page_h;
    let offset = (tag.page - 1) as f64 * page_h;
    PixelBox {
        x0: (tag.x0 * scale_x).round() as i64,
        y0: ((tag.y0 - offset) * scale_y).round() as i64,
        x1: (tag.x1 * scale_x).round() as i64,
        y1: ((tag.y1 - offset) * scale_y).round() as i64,
    }
}

/// Fills every box, clipped to the image, with `color` blended at `alpha`.
/// Overlapping boxes are blended once.
pub fn highlight_boxes(image: &mut RgbImage, boxes: &[PixelBox], color: Rgb<u8>, alpha: f32) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let mut mask = vec![false; width as usize * height as usize];
    for b in boxes {
        let (left, right) = (b.x0.min(b.x1), b.x0.max(b.x1));
        let (top, bottom) = (b.y0.min(b.y1), b.y0.max(b.y1));
        if right < 0 || bottom < 0 || left >= width as i64 || top >= height as i64 {
            continue;
        }
        let x0 = left.max(0) as u32;
        let x1 = right.min(width as i64 - 1) as u32;
        let y0 = top.max(0) as u32;
        let y1 = bottom.min(height as i64 - 1) as u32;
        for y in y0..=y1 {
            for x in x0..=x1 {
                mask[(y * width + x) as usize] = true;
            }
        }
    }
    let alpha = alpha.clamp(0.0, 1.0);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if !mask[(y * width + x) as usize] {
            continue;
        }
        for (channel, target) in pixel.0.iter_mut().zip(color.0) {
            let blended = alpha * target as f32 + (1.0 - alpha) * *channel as f32;
            *channel = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Finds the evidence for an answer and paints it onto rendered pages.
pub struct EvidenceLocalizer {
    policy_dir: PathBuf,
    geometry: Box<dyn PageGeometry>,
    rasterizer: Box<dyn PageRasterizer>,
    config: HighlightConfig,
}

impl EvidenceLocalizer {
    pub fn new(policy_dir: impl Into<PathBuf>, config: HighlightConfig) -> Self {
        let rasterizer = CommandRasterizer::new(&config.renderer);
        Self {
            policy_dir: policy_dir.into(),
            geometry: Box::new(PdfGeometry),
            rasterizer: Box::new(rasterizer),
            config,
        }
    }

    pub fn with_geometry<G: PageGeometry + 'static>(mut self, geometry: G) -> Self {
        self.geometry = Box::new(geometry);
        self
    }

    pub fn with_rasterizer<R: PageRasterizer + 'static>(mut self, rasterizer: R) -> Self {
        self.rasterizer = Box::new(rasterizer);
        self
    }

    /// Highlighted page images, or nothing when there is no usable match or
    /// any step fails.
    pub fn localize<S: AsRef<str>>(
        &self,
        answer_lines: &[S],
        results: &[SearchResult],
        output_dir: &Path,
    ) -> Vec<PathBuf> {
        let Some(evidence) = find_best_match(answer_lines, results) else {
            info!("no evidence span matches the answer, nothing to highlight");
            return Vec::new();
        };
        debug!(
            document = %evidence.document_name,
            score = evidence.similarity_score,
            tags = evidence.position_tags.len(),
            "best evidence match"
        );
        match self.highlight(&evidence, output_dir) {
            Ok(paths) => paths,
            Err(err) => {
                warn!(document = %evidence.document_name, "highlight failed: {err}");
                Vec::new()
            }
        }
    }

    pub fn highlight(&self, evidence: &EvidenceMatch, output_dir: &Path) -> Result<Vec<PathBuf>> {
        if evidence.position_tags.is_empty() {
            info!(document = %evidence.document_name, "matched span carries no position tags");
            return Ok(Vec::new());
        }
        self.prepare_output(output_dir)?;

        let source = self.policy_dir.join(&evidence.document_name);
        let page_size = self.page_size(&source)?;
        let rendered = self.rasterizer.render_pages(&source, output_dir)?;

        let mut by_page: BTreeMap<usize, Vec<&PositionTag>> = BTreeMap::new();
        for tag in &evidence.position_tags {
            match tag.page_index() {
                Some(idx) => by_page.entry(idx).or_default().push(tag),
                None => warn!(page = tag.page, "tag with invalid page number ignored"),
            }
        }

        // Every page must exist before anything is written.
        let pages = by_page
            .into_iter()
            .map(|(page_index, tags)| {
                rendered
                    .get(page_index)
                    .map(|image_path| (page_index, image_path, tags))
                    .ok_or(RagError::MissingPage {
                        page_index,
                        rendered: rendered.len(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut written = Vec::new();
        for (page_index, image_path, tags) in pages {
            let out = output_dir.join(format!("{page_index}_highlighted.jpg"));
            if let Err(err) = self.paint_page(image_path, &tags, page_size, &out) {
                for path in &written {
                    let _ = fs::remove_file(path);
                }
                return Err(err);
            }
            info!(path = %out.display(), "highlight written");
            written.push(out);
        }
        Ok(written)
    }

    fn paint_page(
        &self,
        image_path: &Path,
        tags: &[&PositionTag],
        page_size: (f64, f64),
        out: &Path,
    ) -> Result<()> {
        let mut image = image::open(image_path)?.to_rgb8();
        let boxes: Vec<PixelBox> = tags
            .iter()
            .map(|tag| map_box(tag, page_size, image.dimensions()))
            .collect();
        debug!(path = %image_path.display(), ?boxes, "highlighting page");
        highlight_boxes(&mut image, &boxes, HIGHLIGHT, self.config.alpha);
        image.save(out)?;
        Ok(())
    }

    fn page_size(&self, source: &Path) -> Result<(f64, f64)> {
        let is_pdf = source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if is_pdf {
            Ok(self.geometry.page_size(source)?)
        } else {
            Ok((self.config.page_width_pts, self.config.page_height_pts))
        }
    }

    fn prepare_output(&self, output_dir: &Path) -> Result<()> {
        if self.config.clear_output && output_dir.exists() {
            fs::remove_dir_all(output_dir)?;
        }
        fs::create_dir_all(output_dir)?;
        Ok(())
    }
}
