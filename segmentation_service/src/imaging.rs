use crate::model_service::RawMask;
use image::{GrayImage, ImageBuffer, ImageError, ImageFormat, ImageReader, Luma, RgbImage};
use ndarray::Array2;
use std::io::Cursor;

pub type LabelImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Decodes any supported format into RGB. Grayscale sources get their single
/// channel replicated, which loses nothing.
pub fn decode_rgb(image_data: &[u8]) -> Result<RgbImage, ImageError> {
    let image = ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()?
        .decode()?;
    Ok(image.to_rgb8())
}

pub fn mask_to_gray(mask: &Array2<bool>) -> GrayImage {
    let (rows, cols) = mask.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        if mask[[y as usize, x as usize]] {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

pub fn encode_mask_png(mask: &Array2<bool>) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    mask_to_gray(mask).write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Paints segment indices (1-based, in the given order) into a `width x height`
/// raster. A pixel keeps the first index that claims it; 0 means unlabeled.
pub fn compose_labels(width: u32, height: u32, ranked: &[RawMask]) -> LabelImage {
    let mut labels = LabelImage::new(width, height);
    for (rank, raw) in ranked.iter().enumerate() {
        let index = u16::try_from(rank + 1).unwrap_or(u16::MAX);
        for ((row, col), _) in raw.mask.indexed_iter().filter(|(_, inside)| **inside) {
            let (x, y) = (col as u32, row as u32);
            if x >= width || y >= height {
                continue;
            }
            let pixel = labels.get_pixel_mut(x, y);
            if pixel.0[0] == 0 {
                pixel.0[0] = index;
            }
        }
    }
    labels
}

pub fn encode_labels_png(labels: &LabelImage) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    labels.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb};

    fn mask_from(rows: &[&str]) -> Array2<bool> {
        let cols = rows[0].len();
        let cells = rows
            .iter()
            .flat_map(|row| row.chars().map(|c| c == '#'))
            .collect();
        Array2::from_shape_vec((rows.len(), cols), cells).unwrap()
    }

    #[test]
    fn test_decode_upconverts_grayscale() {
        let gray = GrayImage::from_pixel(4, 3, Luma([77]));
        let mut bytes = Cursor::new(Vec::new());
        gray.write_to(&mut bytes, ImageFormat::Png).unwrap();

        let rgb = decode_rgb(bytes.get_ref()).unwrap();

        assert_eq!(rgb.dimensions(), (4, 3));
        assert!(rgb.pixels().all(|p| *p == Rgb([77, 77, 77])));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_rgb(&[0, 1, 2, 3, 4]).is_err());
        assert!(decode_rgb(&[]).is_err());
    }

    #[test]
    fn test_mask_png_round_trip() {
        let mask = mask_from(&["#..", ".#.", "..#", "###"]);
        let png = encode_mask_png(&mask).unwrap();

        let decoded = image::load_from_memory(&png).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
        let gray = decoded.to_luma8();
        assert_eq!(gray.dimensions(), (3, 4));
        assert_eq!(gray.get_pixel(0, 0).0, [255]);
        assert_eq!(gray.get_pixel(1, 0).0, [0]);
        assert_eq!(gray.get_pixel(2, 3).0, [255]);
    }

    #[test]
    fn test_compose_labels_keeps_higher_rank() {
        let first = RawMask {
            mask: mask_from(&["##..", "##..", "...."]),
            score: 0.9,
        };
        let second = RawMask {
            mask: mask_from(&[".##.", ".##.", ".##."]),
            score: 0.4,
        };

        let labels = compose_labels(4, 3, &[first, second]);

        let row = |y: u32| -> Vec<u16> { (0..4).map(|x| labels.get_pixel(x, y).0[0]).collect() };
        assert_eq!(row(0), vec![1, 1, 2, 0]);
        assert_eq!(row(1), vec![1, 1, 2, 0]);
        assert_eq!(row(2), vec![0, 2, 2, 0]);
    }

    #[test]
    fn test_compose_labels_clips_to_declared_size() {
        let mask = RawMask {
            mask: Array2::from_elem((5, 5), true),
            score: 1.0,
        };

        let labels = compose_labels(2, 3, &[mask]);

        assert_eq!(labels.dimensions(), (2, 3));
        assert!(labels.pixels().all(|p| p.0[0] == 1));
    }

    #[test]
    fn test_label_png_is_sixteen_bit() {
        let labels = LabelImage::from_pixel(3, 2, Luma([300]));
        let png = encode_labels_png(&labels).unwrap();

        let decoded = image::load_from_memory(&png).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageLuma16(_)));
        assert_eq!(decoded.to_luma16().get_pixel(2, 1).0, [300]);
    }
}
