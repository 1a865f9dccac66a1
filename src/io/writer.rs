use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use ndarray::{Array2, Array3};

use crate::error::{Error, Result};
use crate::io::BLOCK_SIZE;
use crate::model::FitsHeader;

/// Header cards carried over from a source header when writing derived
/// products, so parameter maps stay aligned with the input cube on sky.
const WCS_KEYS: &[&str] = &[
    "CTYPE1", "CTYPE2", "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2",
    "CD1_1", "CD1_2", "CD2_1", "CD2_2",
    "CDELT1", "CDELT2", "CROTA2", "RADESYS", "EQUINOX",
];

const SPECTRAL_KEYS: &[&str] = &[
    "CTYPE3", "CUNIT3", "CRPIX3", "CRVAL3", "CDELT3", "RESTFRQ", "RESTFREQ",
];

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Copy spatial WCS cards from the source header.
    pub copy_wcs: bool,
    /// Extra cards appended after the mandatory set, replacing duplicates.
    pub extra_cards: Vec<(String, String)>,
    /// Emitted as a HISTORY card when set.
    pub software: Option<String>,
}

/// Write a 2-D map (integral map, a single parameter plane) as BITPIX -32.
pub fn write_map(
    map: &Array2<f32>,
    path: &Path,
    source: Option<&FitsHeader>,
    opts: &WriteOptions,
) -> Result<()> {
    let (ny, nx) = map.dim();
    let mut cards = mandatory_cards(&[nx, ny]);
    append_cards(&mut cards, source, opts, false);

    let slice = map
        .as_slice()
        .ok_or_else(|| Error::shape("map must be contiguous"))?;
    write_file(path, &cards, slice).map_err(Error::Fits)
}

/// Write a 3-D array (a parameter or error cube) as BITPIX -32. The leading
/// axis of the array becomes NAXIS3.
pub fn write_cube(
    cube: &Array3<f32>,
    path: &Path,
    source: Option<&FitsHeader>,
    opts: &WriteOptions,
) -> Result<()> {
    let (nz, ny, nx) = cube.dim();
    let mut cards = mandatory_cards(&[nx, ny, nz]);
    append_cards(&mut cards, source, opts, true);

    let slice = cube
        .as_slice()
        .ok_or_else(|| Error::shape("cube must be contiguous"))?;
    write_file(path, &cards, slice).map_err(Error::Fits)
}

fn mandatory_cards(shape: &[usize]) -> Vec<(String, String)> {
    let mut cards = vec![
        ("SIMPLE".into(), "T".into()),
        ("BITPIX".into(), "-32".into()),
        ("NAXIS".into(), format!("{}", shape.len())),
    ];
    for (i, n) in shape.iter().enumerate() {
        cards.push((format!("NAXIS{}", i + 1), format!("{}", n)));
    }
    cards.push(("BSCALE".into(), "1.0".into()));
    cards.push(("BZERO".into(), "0.0".into()));
    cards
}

fn append_cards(
    cards: &mut Vec<(String, String)>,
    source: Option<&FitsHeader>,
    opts: &WriteOptions,
    spectral: bool,
) {
    if let Some(src) = source {
        if opts.copy_wcs {
            for key in WCS_KEYS {
                if let Some(val) = src.get(key) {
                    cards.push((key.to_string(), val.to_string()));
                }
            }
            if spectral {
                for key in SPECTRAL_KEYS {
                    if let Some(val) = src.get(key) {
                        cards.push((key.to_string(), val.to_string()));
                    }
                }
            }
        }
    }
    for (k, v) in &opts.extra_cards {
        cards.retain(|(ck, _)| ck != k);
        cards.push((k.clone(), v.clone()));
    }
    if let Some(sw) = &opts.software {
        cards.push(("HISTORY".into(), format!("Written by {}", sw)));
    }
}

fn write_file(path: &Path, cards: &[(String, String)], data: &[f32]) -> anyhow::Result<()> {
    let file =
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    write_header(&mut writer, cards)?;
    write_be_f32(&mut writer, data)?;
    writer.flush()?;
    Ok(())
}

fn write_header(writer: &mut impl Write, cards: &[(String, String)]) -> anyhow::Result<()> {
    let mut block = Vec::new();
    for (key, value) in cards {
        block.extend_from_slice(format_card(key, value).as_bytes());
    }
    block.extend_from_slice(format!("{:<80}", "END").as_bytes());

    let remainder = block.len() % BLOCK_SIZE;
    if remainder != 0 {
        block.extend(std::iter::repeat_n(b' ', BLOCK_SIZE - remainder));
    }
    writer.write_all(&block)?;
    Ok(())
}

fn format_card(key: &str, value: &str) -> String {
    if key == "HISTORY" || key == "COMMENT" {
        return format!("{:<8}{:<72}", key, value);
    }

    let keyword = format!("{:<8}", &key[..key.len().min(8)]);
    let trimmed = value.trim();
    let bare = trimmed == "T"
        || trimmed == "F"
        || trimmed.parse::<f64>().is_ok()
        || trimmed.parse::<i64>().is_ok();

    let formatted = if bare {
        format!("{:>20}", trimmed)
    } else {
        format!("'{:<8}'", trimmed)
    };

    let card = format!("{}= {}", keyword, formatted);
    format!("{:<80}", &card[..card.len().min(80)])
}

fn write_be_f32(writer: &mut impl Write, data: &[f32]) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(data.len() * 4);
    for v in data {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    let remainder = buf.len() % BLOCK_SIZE;
    if remainder != 0 {
        buf.extend(std::iter::repeat_n(0u8, BLOCK_SIZE - remainder));
    }
    writer.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_cube;

    #[test]
    fn test_format_card_numeric() {
        let card = format_card("BITPIX", "-32");
        assert_eq!(card.len(), 80);
        assert!(card.starts_with("BITPIX  = "));
        assert!(card.contains("-32"));
    }

    #[test]
    fn test_format_card_string() {
        let card = format_card("CUNIT3", "km/s");
        assert_eq!(card.len(), 80);
        assert!(card.contains("'km/s"));
    }

    #[test]
    fn test_cube_roundtrip() {
        let cube = Array3::from_shape_fn((3, 4, 5), |(p, y, x)| (p * 20 + y * 5 + x) as f32);
        let tmp = tempfile::NamedTempFile::new().unwrap();

        let opts = WriteOptions {
            software: Some("speckit test".into()),
            ..Default::default()
        };
        write_cube(&cube, tmp.path(), None, &opts).unwrap();

        let (back, header) = read_cube(tmp.path()).unwrap();
        assert_eq!(back.dim(), (3, 4, 5));
        assert_eq!(header.get_i64("NAXIS"), Some(3));
        for (a, b) in back.iter().zip(cube.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_map_copies_wcs_cards() {
        let src = FitsHeader::from_cards(vec![
            ("CRVAL1".into(), "83.5".into()),
            ("CRVAL2".into(), "22.0".into()),
            ("CRVAL3".into(), "2.3e10".into()),
        ]);
        let map = Array2::from_elem((4, 4), 1.0f32);
        let tmp = tempfile::NamedTempFile::new().unwrap();

        let opts = WriteOptions {
            copy_wcs: true,
            ..Default::default()
        };
        write_map(&map, tmp.path(), Some(&src), &opts).unwrap();

        let bytes = std::fs::read(tmp.path()).unwrap();
        let header = String::from_utf8_lossy(&bytes[..BLOCK_SIZE]).to_string();
        assert!(header.contains("CRVAL1"));
        // Spectral cards stay out of 2-D products.
        assert!(!header.contains("CRVAL3"));
    }
}
