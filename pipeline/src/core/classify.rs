//! Deterministic classification of scanned paths into pipeline candidates.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::manifest::MediaKind;

/// Extension sets driving classification. All comparisons are
/// case-insensitive on the file extension.
#[derive(Debug, Clone)]
pub struct MediaExtensions {
    pub image: Vec<String>,
    pub video: Vec<String>,
    /// Canonical (describable as-is) image format, e.g. `png`.
    pub canonical: String,
}

/// A classified input file, ready to become an [`crate::manifest::ItemRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// Path relative to the input root, as scanned.
    pub source_path: PathBuf,
    pub kind: MediaKind,
    /// True for images already in the canonical format.
    pub canonical: bool,
}

/// Stable item id: truncated hex digest of the normalized relative path.
///
/// Stays stable across runs over the same tree; moving a file yields a new id.
pub fn item_id(relative_path: &Path) -> String {
    let normalized = normalize(relative_path);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Normalize a relative path to forward slashes for hashing and sorting.
pub fn normalize(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// Classify relative paths into candidates, sorted by normalized path.
///
/// Pure and order-stable: identical inputs always yield the identical list,
/// which resume reconciliation depends on.
pub fn classify(paths: &[PathBuf], extensions: &MediaExtensions) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = paths
        .iter()
        .map(|path| {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let (kind, canonical) = if ext == extensions.canonical {
                (MediaKind::Image, true)
            } else if extensions.image.iter().any(|e| *e == ext) {
                (MediaKind::Image, false)
            } else if extensions.video.iter().any(|e| *e == ext) {
                (MediaKind::Video, false)
            } else {
                (MediaKind::Unsupported, false)
            };
            Candidate {
                id: item_id(path),
                source_path: path.clone(),
                kind,
                canonical,
            }
        })
        .collect();
    candidates.sort_by(|a, b| {
        normalize(&a.source_path)
            .cmp(&normalize(&b.source_path))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions() -> MediaExtensions {
        MediaExtensions {
            image: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            video: vec!["mp4".to_string(), "mov".to_string()],
            canonical: "png".to_string(),
        }
    }

    #[test]
    fn item_id_is_stable_and_path_sensitive() {
        let a1 = item_id(Path::new("photos/cat.jpg"));
        let a2 = item_id(Path::new("photos/cat.jpg"));
        let b = item_id(Path::new("photos/dog.jpg"));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 16);
    }

    #[test]
    fn item_id_ignores_path_separator_style() {
        assert_eq!(
            item_id(Path::new("./photos/cat.jpg")),
            item_id(Path::new("photos/cat.jpg"))
        );
    }

    #[test]
    fn classify_assigns_kinds_by_extension() {
        let paths = vec![
            PathBuf::from("a.JPG"),
            PathBuf::from("b.mp4"),
            PathBuf::from("c.txt"),
            PathBuf::from("d.png"),
        ];
        let candidates = classify(&paths, &extensions());
        let kinds: Vec<(String, MediaKind, bool)> = candidates
            .iter()
            .map(|c| {
                (
                    c.source_path.to_string_lossy().into_owned(),
                    c.kind,
                    c.canonical,
                )
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("a.JPG".to_string(), MediaKind::Image, false),
                ("b.mp4".to_string(), MediaKind::Video, false),
                ("c.txt".to_string(), MediaKind::Unsupported, false),
                ("d.png".to_string(), MediaKind::Image, true),
            ]
        );
    }

    #[test]
    fn classify_is_order_stable() {
        let forward = vec![PathBuf::from("z.jpg"), PathBuf::from("a.jpg")];
        let reversed = vec![PathBuf::from("a.jpg"), PathBuf::from("z.jpg")];
        assert_eq!(
            classify(&forward, &extensions()),
            classify(&reversed, &extensions())
        );
    }

    #[test]
    fn extensionless_files_are_unsupported() {
        let candidates = classify(&[PathBuf::from("README")], &extensions());
        assert_eq!(candidates[0].kind, MediaKind::Unsupported);
    }
}
