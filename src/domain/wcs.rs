use crate::error::{Error, Result};
use crate::model::FitsHeader;

/// Minimal celestial WCS for the spatial axes of a cube, enough to place
/// world-coordinate apertures: CRPIX/CRVAL reference plus a CD matrix
/// (or CDELT + CROTA2 fallback) and a small projection set.
#[derive(Debug, Clone)]
pub struct CelestialWcs {
    crpix: (f64, f64),
    crval: (f64, f64),
    cd: [[f64; 2]; 2],
    projection: Projection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Tan,
    Sin,
    Car,
}

impl CelestialWcs {
    pub fn from_header(header: &FitsHeader) -> Result<Self> {
        let crpix = (
            header
                .get_f64("CRPIX1")
                .ok_or_else(|| Error::shape("missing CRPIX1"))?,
            header
                .get_f64("CRPIX2")
                .ok_or_else(|| Error::shape("missing CRPIX2"))?,
        );
        let crval = (
            header
                .get_f64("CRVAL1")
                .ok_or_else(|| Error::shape("missing CRVAL1"))?,
            header
                .get_f64("CRVAL2")
                .ok_or_else(|| Error::shape("missing CRVAL2"))?,
        );

        let cd = match (
            header.get_f64("CD1_1"),
            header.get_f64("CD1_2"),
            header.get_f64("CD2_1"),
            header.get_f64("CD2_2"),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => [[a, b], [c, d]],
            _ => {
                let cdelt1 = header
                    .get_f64("CDELT1")
                    .ok_or_else(|| Error::shape("missing CD matrix and CDELT1"))?;
                let cdelt2 = header
                    .get_f64("CDELT2")
                    .ok_or_else(|| Error::shape("missing CD matrix and CDELT2"))?;
                let theta = header.get_f64("CROTA2").unwrap_or(0.0).to_radians();
                [
                    [cdelt1 * theta.cos(), -cdelt2 * theta.sin()],
                    [cdelt1 * theta.sin(), cdelt2 * theta.cos()],
                ]
            }
        };

        let projection = match header.get("CTYPE1").map(|t| &t[t.len().saturating_sub(3)..]) {
            Some("SIN") => Projection::Sin,
            Some("CAR") => Projection::Car,
            _ => Projection::Tan,
        };

        Ok(CelestialWcs {
            crpix,
            crval,
            cd,
            projection,
        })
    }

    /// Mean sky scale of one pixel, in degrees.
    pub fn pixel_scale_deg(&self) -> f64 {
        let sx = (self.cd[0][0].powi(2) + self.cd[1][0].powi(2)).sqrt();
        let sy = (self.cd[0][1].powi(2) + self.cd[1][1].powi(2)).sqrt();
        (sx + sy) / 2.0
    }

    /// Zero-based pixel coordinates of an (ra, dec) position in degrees.
    pub fn world_to_pixel(&self, ra: f64, dec: f64) -> (f64, f64) {
        let (xi, eta) = self.project(ra, dec);

        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        if det.abs() < 1e-30 {
            return (f64::NAN, f64::NAN);
        }
        let dx = (self.cd[1][1] * xi - self.cd[0][1] * eta) / det;
        let dy = (-self.cd[1][0] * xi + self.cd[0][0] * eta) / det;
        (dx + self.crpix.0 - 1.0, dy + self.crpix.1 - 1.0)
    }

    /// (ra, dec) in degrees of a zero-based pixel position.
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.crpix.0 + 1.0;
        let dy = y - self.crpix.1 + 1.0;
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();

        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();

        let (ra, dec) = match self.projection {
            Projection::Tan => {
                let denom = dec0.cos() - eta * dec0.sin();
                (
                    ra0 + xi.atan2(denom),
                    (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt()),
                )
            }
            Projection::Sin => {
                let cos_c = (1.0 - xi * xi - eta * eta).max(0.0).sqrt();
                (
                    ra0 + xi.atan2(cos_c * dec0.cos() - eta * dec0.sin()),
                    (cos_c * dec0.sin() + eta * dec0.cos()).asin(),
                )
            }
            Projection::Car => (ra0 + xi / dec0.cos(), dec0 + eta),
        };

        let mut ra_deg = ra.to_degrees() % 360.0;
        if ra_deg < 0.0 {
            ra_deg += 360.0;
        }
        (ra_deg, dec.to_degrees())
    }

    fn project(&self, ra: f64, dec: f64) -> (f64, f64) {
        let ra_r = ra.to_radians();
        let dec_r = dec.to_radians();
        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();
        let dra = ra_r - ra0;

        match self.projection {
            Projection::Tan => {
                let denom = dec_r.sin() * dec0.sin() + dec_r.cos() * dec0.cos() * dra.cos();
                if denom.abs() < 1e-15 {
                    return (f64::NAN, f64::NAN);
                }
                let xi = dec_r.cos() * dra.sin() / denom;
                let eta =
                    (dec_r.sin() * dec0.cos() - dec_r.cos() * dec0.sin() * dra.cos()) / denom;
                (xi.to_degrees(), eta.to_degrees())
            }
            Projection::Sin => {
                let xi = dec_r.cos() * dra.sin();
                let eta = dec_r.sin() * dec0.cos() - dec_r.cos() * dec0.sin() * dra.cos();
                (xi.to_degrees(), eta.to_degrees())
            }
            Projection::Car => ((dra * dec0.cos()).to_degrees(), (dec_r - dec0).to_degrees()),
        }
    }
}
