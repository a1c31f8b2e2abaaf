//! Slippy-map tile addressing.
//!
//! Tiles live on disk as `<root>/{z}/{x}/{y}.<ext>`. Only numeric path
//! components and extensions the `image` crate can decode are considered.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use image::ImageFormat;
use walkdir::WalkDir;

use crate::error::{RoboSatError, RoboSatResult};

/// A square raster patch addressed by zoom level and column/row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub const fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The extension-less path of this tile below `root`.
    pub fn stem_in(&self, root: &Path) -> PathBuf {
        root.join(self.z.to_string())
            .join(self.x.to_string())
            .join(self.y.to_string())
    }

    /// Finds this tile's file below `root`, whatever its image extension.
    pub fn find_in(&self, root: &Path) -> Option<PathBuf> {
        let stem = self.stem_in(root);
        supported_extensions()
            .into_iter()
            .map(|ext| stem.with_extension(ext))
            .find(|candidate| candidate.is_file())
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Image extensions the `image` crate can decode, lower and upper case.
pub fn supported_extensions() -> Vec<String> {
    let mut extensions: Vec<String> = ImageFormat::all()
        .filter(|format| format.reading_enabled())
        .flat_map(|format| format.extensions_str().iter())
        .flat_map(|ext| [ext.to_string(), ext.to_uppercase()])
        .collect();

    extensions.sort();
    extensions.dedup();
    extensions
}

/// Lists every tile below a slippy-map directory, sorted by `(z, x, y)`.
///
/// # Errors
///
/// Returns `RoboSatError::Io` if the directory cannot be walked.
pub fn tiles_from_slippy_map(root: &Path) -> RoboSatResult<Vec<(Tile, PathBuf)>> {
    let extensions = supported_extensions();
    let mut tiles = Vec::new();

    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = entry.map_err(|e| {
            let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
            RoboSatError::io(path, e.into())
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        let has_image_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.iter().any(|known| known == ext));
        if !has_image_extension {
            continue;
        }

        if let Some(tile) = parse_tile_path(root, &path) {
            tiles.push((tile, path));
        }
    }

    tiles.sort_by_key(|(tile, _)| *tile);
    Ok(tiles)
}

fn parse_tile_path(root: &Path, path: &Path) -> Option<Tile> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.iter();
    let z = components.next()?.to_str()?.parse().ok()?;
    let x = components.next()?.to_str()?.parse().ok()?;
    let y = Path::new(components.next()?).file_stem()?.to_str()?.parse().ok()?;
    Some(Tile::new(z, x, y))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("robosat-tiles-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().expect("parent")).expect("create parents");
        fs::write(path, b"").expect("write file");
    }

    #[test]
    fn tile_display_is_slippy_path() {
        assert_eq!(Tile::new(18, 69105, 105093).to_string(), "18/69105/105093");
    }

    #[test]
    fn tiles_are_sorted_and_non_numeric_entries_skipped() {
        let root = scratch_dir("walk");
        touch(root.join("18/5/9.png"));
        touch(root.join("18/5/3.png"));
        touch(root.join("17/9/1.jpg"));
        touch(root.join("18/5/notes.png"));
        touch(root.join("18/5/4.txt"));
        touch(root.join("tiles/5/4.png"));

        let tiles: Vec<Tile> = tiles_from_slippy_map(&root)
            .expect("walk")
            .into_iter()
            .map(|(tile, _)| tile)
            .collect();

        assert_eq!(
            tiles,
            vec![Tile::new(17, 9, 1), Tile::new(18, 5, 3), Tile::new(18, 5, 9)]
        );

        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn find_in_resolves_any_supported_extension() {
        let root = scratch_dir("find");
        touch(root.join("16/1/2.webp"));

        let tile = Tile::new(16, 1, 2);
        assert_eq!(tile.find_in(&root), Some(root.join("16/1/2.webp")));
        assert_eq!(Tile::new(16, 1, 3).find_in(&root), None);

        fs::remove_dir_all(root).ok();
    }
}
