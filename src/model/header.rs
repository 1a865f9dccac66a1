use std::collections::HashMap;

use crate::io::BLOCK_SIZE;

/// Parsed FITS header: ordered cards plus a keyed index for lookups.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    pub cards: Vec<(String, String)>,
    pub index: HashMap<String, String>,
}

impl FitsHeader {
    pub fn from_cards(cards: Vec<(String, String)>) -> Self {
        let index = cards.iter().cloned().collect();
        FitsHeader { cards, index }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|s| s.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.index.get(key)?.trim().parse().ok()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.index.get(key)?.trim().parse().ok()
    }

    pub fn naxis(&self) -> usize {
        self.get_i64("NAXIS").unwrap_or(0).max(0) as usize
    }

    pub fn axis_len(&self, axis: usize) -> usize {
        self.get_i64(&format!("NAXIS{}", axis)).unwrap_or(0).max(0) as usize
    }

    /// Rest frequency in Hz, checking both spellings seen in the wild.
    pub fn rest_frequency(&self) -> Option<f64> {
        self.get_f64("RESTFRQ").or_else(|| self.get_f64("RESTFREQ"))
    }

    /// Unit string of the spectral (third) axis. Falls back from CUNIT3 to
    /// a guess based on CTYPE3.
    pub fn spectral_unit(&self) -> Option<&str> {
        if let Some(u) = self.get("CUNIT3") {
            return Some(u);
        }
        match self.get("CTYPE3") {
            Some(t) if t.starts_with("VELO") || t.starts_with("VRAD") => Some("m/s"),
            Some(t) if t.starts_with("FREQ") => Some("Hz"),
            _ => None,
        }
    }

    pub fn data_byte_count(&self) -> usize {
        let naxis = self.naxis();
        if naxis == 0 {
            return 0;
        }
        let bitpix = self.get_i64("BITPIX").unwrap_or(0);
        let bytes_per_pixel = (bitpix.unsigned_abs() / 8) as usize;
        let mut total: usize = 1;
        for i in 1..=naxis {
            total *= self.axis_len(i).max(1);
        }
        total * bytes_per_pixel
    }

    pub fn padded_data_bytes(&self) -> usize {
        let raw = self.data_byte_count();
        raw.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pairs: &[(&str, &str)]) -> FitsHeader {
        FitsHeader::from_cards(
            pairs
                .iter()
                .map(|&(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_typed_getters() {
        let h = header(&[("NAXIS", "3"), ("CRVAL3", "23.69e9"), ("OBJECT", "G000")]);
        assert_eq!(h.get_i64("NAXIS"), Some(3));
        assert!((h.get_f64("CRVAL3").unwrap() - 23.69e9).abs() < 1.0);
        assert_eq!(h.get("OBJECT"), Some("G000"));
        assert_eq!(h.get_f64("MISSING"), None);
    }

    #[test]
    fn test_rest_frequency_both_spellings() {
        let h1 = header(&[("RESTFRQ", "2.369e10")]);
        let h2 = header(&[("RESTFREQ", "2.369e10")]);
        assert!(h1.rest_frequency().is_some());
        assert!(h2.rest_frequency().is_some());
    }

    #[test]
    fn test_spectral_unit_fallback() {
        let h = header(&[("CTYPE3", "VELO-LSR")]);
        assert_eq!(h.spectral_unit(), Some("m/s"));
        let h = header(&[("CUNIT3", "km/s"), ("CTYPE3", "FREQ")]);
        assert_eq!(h.spectral_unit(), Some("km/s"));
    }

    #[test]
    fn test_data_byte_count() {
        let h = header(&[
            ("NAXIS", "3"),
            ("NAXIS1", "4"),
            ("NAXIS2", "5"),
            ("NAXIS3", "6"),
            ("BITPIX", "-32"),
        ]);
        assert_eq!(h.data_byte_count(), 4 * 5 * 6 * 4);
        assert_eq!(h.padded_data_bytes(), BLOCK_SIZE);
    }
}
