//! Flatten a directory of PNGs into one labeled CSV.
//!
//! Every PNG under the directory (recursively) becomes one row: the raw
//! RGB bytes in row-major order followed by a label column, the layout
//! simple training scripts ingest. The output file is removed up front so
//! a rerun never appends onto stale rows.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use tracing::{debug, info};

pub const DEFAULT_DIR: &str = "images";
pub const DEFAULT_OUTPUT: &str = "output.csv";
pub const DEFAULT_LABEL: &str = "andy";

/// What a conversion produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvSummary {
    pub rows: usize,
}

/// Convert every PNG under `dir` into rows of `output`.
///
/// Images must be 8-bit RGB; anything else (alpha, grayscale, 16-bit) is an
/// error rather than a silently reshaped row. Files are processed in sorted
/// path order so reruns produce identical output.
pub fn convert_dir(dir: &Path, output: &Path, label: &str) -> Result<CsvSummary> {
    match std::fs::remove_file(output) {
        Ok(()) => debug!(path = %output.display(), "Removed previous output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", output.display()))
        }
    }

    let mut files = Vec::new();
    collect_pngs(dir, &mut files)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    files.sort();
    info!(count = files.len(), dir = %dir.display(), "Found PNG files");

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    for path in &files {
        let image = image::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let rgb = match image {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => bail!(
                "{} is not an 8-bit RGB image (found {:?})",
                path.display(),
                other.color()
            ),
        };

        for value in rgb.as_raw() {
            writer.write_field(value.to_string())?;
        }
        writer.write_field(label)?;
        writer.write_record(None::<&[u8]>)?;

        debug!(
            file = %path.display(),
            fields = rgb.as_raw().len() + 1,
            "Row written"
        );
    }
    writer.flush()?;

    info!(rows = files.len(), output = %output.display(), "✓ CSV written");
    Ok(CsvSummary { rows: files.len() })
}

fn collect_pngs(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_pngs(&path, files)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb, RgbImage};

    fn write_png(path: &Path, width: u32, height: u32, first_pixel: [u8; 3]) {
        let mut img = RgbImage::from_pixel(width, height, Rgb([9, 9, 9]));
        img.put_pixel(0, 0, Rgb(first_pixel));
        img.save(path).unwrap();
    }

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .unwrap()
            .records()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn one_row_per_file_including_nested() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(images.join("nested")).unwrap();
        write_png(&images.join("a.png"), 2, 2, [1, 2, 3]);
        write_png(&images.join("b.png"), 2, 2, [4, 5, 6]);
        write_png(&images.join("nested").join("c.png"), 2, 2, [7, 8, 9]);

        let output = dir.path().join("output.csv");
        let summary = convert_dir(&images, &output, "andy").unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(read_rows(&output).len(), 3);
    }

    #[test]
    fn rows_hold_all_pixels_plus_label() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        write_png(&images.join("a.png"), 3, 2, [1, 2, 3]);

        let output = dir.path().join("output.csv");
        convert_dir(&images, &output, "cat").unwrap();

        let rows = read_rows(&output);
        assert_eq!(rows.len(), 1);
        // width * height * 3 pixel bytes, then the label.
        assert_eq!(rows[0].len(), 3 * 2 * 3 + 1);
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][1], "2");
        assert_eq!(&rows[0][2], "3");
        assert_eq!(&rows[0][rows[0].len() - 1], "cat");
    }

    #[test]
    fn rerun_replaces_instead_of_appending() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        write_png(&images.join("a.png"), 2, 2, [1, 2, 3]);
        write_png(&images.join("b.png"), 2, 2, [4, 5, 6]);

        let output = dir.path().join("output.csv");
        convert_dir(&images, &output, "andy").unwrap();
        let second = convert_dir(&images, &output, "andy").unwrap();

        assert_eq!(second.rows, 2);
        assert_eq!(read_rows(&output).len(), 2);
    }

    #[test]
    fn files_are_processed_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        // Create out of order, expect sorted rows.
        write_png(&images.join("zebra.png"), 1, 1, [200, 0, 0]);
        write_png(&images.join("apple.png"), 1, 1, [100, 0, 0]);

        let output = dir.path().join("output.csv");
        convert_dir(&images, &output, "andy").unwrap();

        let rows = read_rows(&output);
        assert_eq!(&rows[0][0], "100");
        assert_eq!(&rows[1][0], "200");
    }

    #[test]
    fn non_rgb_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        GrayImage::from_pixel(2, 2, image::Luma([7]))
            .save(images.join("gray.png"))
            .unwrap();

        let output = dir.path().join("output.csv");
        let err = convert_dir(&images, &output, "andy").unwrap_err();
        assert!(err.to_string().contains("8-bit RGB"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output.csv");
        assert!(convert_dir(&dir.path().join("nope"), &output, "andy").is_err());
    }

    #[test]
    fn empty_directory_yields_empty_csv() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();

        let output = dir.path().join("output.csv");
        let summary = convert_dir(&images, &output, "andy").unwrap();
        assert_eq!(summary.rows, 0);
        assert!(output.exists());
        assert_eq!(read_rows(&output).len(), 0);
    }
}
