use std::path::Path;

use lopdf::{Document as PdfDocument, Object};

use crate::error::{PolicyError, Result};

/// Native page size, in points, of a source document.
pub trait PageGeometry: Send + Sync {
    fn page_size(&self, path: &Path) -> Result<(f64, f64)>;
}

/// First page's MediaBox, following inheritance up the page tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfGeometry;

impl PageGeometry for PdfGeometry {
    fn page_size(&self, path: &Path) -> Result<(f64, f64)> {
        let doc = PdfDocument::load(path)?;
        let lookup_err = |reason: &str| PolicyError::PageLookup {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        let first = doc
            .get_pages()
            .values()
            .next()
            .copied()
            .ok_or_else(|| lookup_err("document has no pages"))?;
        let mut current = Some(first);
        while let Some(id) = current {
            let dict = doc.get_dictionary(id)?;
            if let Ok(obj) = dict.get(b"MediaBox") {
                let (_, resolved) = doc.dereference(obj)?;
                return media_box_size(resolved).ok_or_else(|| lookup_err("malformed MediaBox"));
            }
            current = dict.get(b"Parent").and_then(Object::as_reference).ok();
        }
        Err(lookup_err("no MediaBox on page or its parents"))
    }
}

/// The same size for every document; for sources without a page model.
#[derive(Debug, Clone, Copy)]
pub struct FixedGeometry {
    pub width_pts: f64,
    pub height_pts: f64,
}

impl Default for FixedGeometry {
    fn default() -> Self {
        Self {
            width_pts: 595.3,
            height_pts: 841.9,
        }
    }
}

impl PageGeometry for FixedGeometry {
    fn page_size(&self, _path: &Path) -> Result<(f64, f64)> {
        Ok((self.width_pts, self.height_pts))
    }
}

fn media_box_size(obj: &Object) -> Option<(f64, f64)> {
    let values = obj.as_array().ok()?;
    if values.len() != 4 {
        return None;
    }
    let mut nums = [0f64; 4];
    for (slot, value) in nums.iter_mut().zip(values) {
        *slot = match value {
            Object::Integer(i) => *i as f64,
            Object::Real(r) => f64::from(*r),
            _ => return None,
        };
    }
    let width = (nums[2] - nums[0]).abs();
    let height = (nums[3] - nums[1]).abs();
    if width == 0.0 || height == 0.0 {
        return None;
    }
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;
    use tempfile::tempdir;

    #[test]
    fn media_box_accepts_integers_and_reals() {
        let obj = Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(595.0),
            Object::Integer(842),
        ]);
        assert_eq!(media_box_size(&obj), Some((595.0, 842.0)));
        assert_eq!(media_box_size(&Object::Array(vec![])), None);
    }

    #[test]
    fn reads_inherited_media_box() {
        let mut doc = PdfDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let dir = tempdir().unwrap();
        let path = dir.path().join("letter.pdf");
        doc.save(&path).unwrap();
        assert_eq!(PdfGeometry.page_size(&path).unwrap(), (612.0, 792.0));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(PdfGeometry.page_size(&dir.path().join("absent.pdf")).is_err());
    }
}
