use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context};
use memmap2::{Mmap, MmapOptions};
use ndarray::{Array1, Array3};

use crate::error::{Error, Result};
use crate::io::BLOCK_SIZE;
use crate::model::FitsHeader;

/// Read the first 3-D HDU of a FITS file as a `(nchan, ny, nx)` cube.
pub fn read_cube(path: &Path) -> Result<(Array3<f32>, FitsHeader)> {
    cube_inner(path).map_err(Error::Fits)
}

/// Read the first 1-D HDU of a FITS file (degenerate trailing axes are
/// accepted) as a spectrum.
pub fn read_spectrum(path: &Path) -> Result<(Array1<f32>, FitsHeader)> {
    spectrum_inner(path).map_err(Error::Fits)
}

fn cube_inner(path: &Path) -> anyhow::Result<(Array3<f32>, FitsHeader)> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mmap = map_file(&file)?;

    let mut offset = 0usize;
    while offset < mmap.len() {
        let hdu = next_hdu(&mmap, offset)?;
        let h = &hdu.header;

        if h.naxis() == 3 && h.axis_len(3) > 0 {
            let (nx, ny, nchan) = (h.axis_len(1), h.axis_len(2), h.axis_len(3));
            let pixels = decode_hdu_data(&mmap, &hdu, nx * ny * nchan)?;
            let cube = Array3::from_shape_vec((nchan, ny, nx), pixels)
                .context("cube data does not match NAXIS1/2/3")?;
            return Ok((cube, hdu.header));
        }

        offset = hdu.next_offset;
    }

    bail!("no 3-D data block in {}", path.display())
}

fn spectrum_inner(path: &Path) -> anyhow::Result<(Array1<f32>, FitsHeader)> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mmap = map_file(&file)?;

    let mut offset = 0usize;
    while offset < mmap.len() {
        let hdu = next_hdu(&mmap, offset)?;
        let h = &hdu.header;

        let naxis = h.naxis();
        let n = h.axis_len(1);
        let degenerate = (2..=naxis).all(|i| h.axis_len(i) <= 1);
        if naxis >= 1 && n > 1 && degenerate {
            let pixels = decode_hdu_data(&mmap, &hdu, n)?;
            return Ok((Array1::from_vec(pixels), hdu.header));
        }

        offset = hdu.next_offset;
    }

    bail!("no 1-D data block in {}", path.display())
}

fn map_file(file: &File) -> anyhow::Result<Mmap> {
    let mmap = unsafe { MmapOptions::new().map(file).context("mmap failed")? };
    #[cfg(unix)]
    {
        let _ = mmap.advise(memmap2::Advice::Sequential);
    }
    Ok(mmap)
}

struct Hdu {
    header: FitsHeader,
    data_start: usize,
    next_offset: usize,
}

/// Parse the header blocks starting at `offset` and locate the data that
/// follows them.
fn next_hdu(bytes: &[u8], offset: usize) -> anyhow::Result<Hdu> {
    let mut cards = Vec::new();
    let mut pos = offset;
    let mut end_found = false;

    while !end_found {
        if pos + BLOCK_SIZE > bytes.len() {
            bail!("truncated header at byte {}", offset);
        }
        let block = &bytes[pos..pos + BLOCK_SIZE];
        pos += BLOCK_SIZE;

        for card in block.chunks_exact(80) {
            let keyword = String::from_utf8_lossy(&card[0..8]).trim().to_string();
            if keyword == "END" {
                end_found = true;
                break;
            }
            if card.len() < 10 || &card[8..10] != b"= " {
                continue;
            }
            let value = card_value(&String::from_utf8_lossy(&card[10..]));
            cards.push((keyword, value));
        }
    }

    let header = FitsHeader::from_cards(cards);
    let data_start = pos;
    let next_offset = data_start + header.padded_data_bytes();
    Ok(Hdu {
        header,
        data_start,
        next_offset,
    })
}

/// Strip quoting and inline comments from a raw card value field.
fn card_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        if let Some(end) = rest.find('\'') {
            return rest[..end].trim_end().to_string();
        }
    }
    match trimmed.find('/') {
        Some(pos) => trimmed[..pos].trim().to_string(),
        None => trimmed.to_string(),
    }
}

fn decode_hdu_data(bytes: &[u8], hdu: &Hdu, count: usize) -> anyhow::Result<Vec<f32>> {
    let bitpix = hdu
        .header
        .get_i64("BITPIX")
        .context("missing BITPIX in data HDU")?;
    let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
    let end = hdu.data_start + count * bytes_per_pixel;
    if end > bytes.len() {
        bail!("data block exceeds file size");
    }
    let bscale = hdu.header.get_f64("BSCALE").unwrap_or(1.0);
    let bzero = hdu.header.get_f64("BZERO").unwrap_or(0.0);
    let pixels = decode_pixels(&bytes[hdu.data_start..end], bitpix, bscale, bzero);
    if pixels.len() != count {
        bail!("unsupported BITPIX {}", bitpix);
    }
    Ok(pixels)
}

/// Decode big-endian pixels into f32 with BSCALE/BZERO applied.
pub(crate) fn decode_pixels(data: &[u8], bitpix: i64, bscale: f64, bzero: f64) -> Vec<f32> {
    match bitpix {
        8 => data
            .iter()
            .map(|&b| (b as f64 * bscale + bzero) as f32)
            .collect(),
        16 => data
            .chunks_exact(2)
            .map(|c| {
                let v = i16::from_be_bytes([c[0], c[1]]);
                (v as f64 * bscale + bzero) as f32
            })
            .collect(),
        32 => data
            .chunks_exact(4)
            .map(|c| {
                let v = i32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                (v as f64 * bscale + bzero) as f32
            })
            .collect(),
        -32 => data
            .chunks_exact(4)
            .map(|c| {
                let v = f32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                (v as f64 * bscale + bzero) as f32
            })
            .collect(),
        -64 => data
            .chunks_exact(8)
            .map(|c| {
                let v = f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
                (v * bscale + bzero) as f32
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn card(key: &str, value: &str) -> Vec<u8> {
        format!("{:<8}= {:>20}{}", key, value, " ".repeat(50)).into_bytes()
    }

    fn write_test_fits(cards: &[(&str, &str)], data: &[f32]) -> tempfile::NamedTempFile {
        let mut bytes = Vec::new();
        for &(k, v) in cards {
            bytes.extend_from_slice(&card(k, v));
        }
        bytes.extend_from_slice(format!("{:<80}", "END").as_bytes());
        let pad = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - bytes.len();
        bytes.extend(std::iter::repeat_n(b' ', pad));
        for v in data {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let pad = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE - bytes.len();
        bytes.extend(std::iter::repeat_n(0u8, pad));

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&bytes).unwrap();
        tmp
    }

    #[test]
    fn test_card_value_parsing() {
        assert_eq!(card_value("          42 / comment"), "42");
        assert_eq!(card_value("'km/s    '"), "km/s");
        assert_eq!(card_value("  -32"), "-32");
    }

    #[test]
    fn test_decode_pixels_i16() {
        let data: &[u8] = &[0x01, 0x00, 0xFF, 0xFF];
        let pixels = decode_pixels(data, 16, 1.0, 0.0);
        assert_eq!(pixels.len(), 2);
        assert!((pixels[0] - 256.0).abs() < 1e-6);
        assert!((pixels[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_pixels_with_scaling() {
        let data: &[u8] = &[100];
        let pixels = decode_pixels(data, 8, 2.0, 10.0);
        assert!((pixels[0] - 210.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_cube() {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let tmp = write_test_fits(
            &[
                ("SIMPLE", "T"),
                ("BITPIX", "-32"),
                ("NAXIS", "3"),
                ("NAXIS1", "2"),
                ("NAXIS2", "3"),
                ("NAXIS3", "4"),
                ("CRVAL3", "0.0"),
            ],
            &data,
        );

        let (cube, header) = read_cube(tmp.path()).unwrap();
        assert_eq!(cube.dim(), (4, 3, 2));
        assert!((cube[[0, 0, 1]] - 1.0).abs() < 1e-6);
        assert!((cube[[1, 0, 0]] - 6.0).abs() < 1e-6);
        assert_eq!(header.get_i64("NAXIS3"), Some(4));
    }

    #[test]
    fn test_read_spectrum_degenerate_axes() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let tmp = write_test_fits(
            &[
                ("SIMPLE", "T"),
                ("BITPIX", "-32"),
                ("NAXIS", "2"),
                ("NAXIS1", "5"),
                ("NAXIS2", "1"),
            ],
            &data,
        );

        let (spec, _) = read_spectrum(tmp.path()).unwrap();
        assert_eq!(spec.len(), 5);
        assert!((spec[4] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_cube_rejects_2d() {
        let tmp = write_test_fits(
            &[
                ("SIMPLE", "T"),
                ("BITPIX", "-32"),
                ("NAXIS", "2"),
                ("NAXIS1", "2"),
                ("NAXIS2", "2"),
            ],
            &[0.0; 4],
        );
        assert!(read_cube(tmp.path()).is_err());
    }
}
