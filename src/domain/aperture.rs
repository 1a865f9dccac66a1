use ndarray::{Array1, Array3};

use crate::domain::wcs::CelestialWcs;
use crate::error::{Error, Result};

/// Spatial region used to reduce a cube to one spectrum.
#[derive(Debug, Clone)]
pub struct Aperture {
    /// Center x (pixel column, or RA in degrees for world frame).
    pub x: f64,
    /// Center y (pixel row, or Dec in degrees for world frame).
    pub y: f64,
    pub shape: ApertureShape,
    pub frame: CoordFrame,
}

#[derive(Debug, Clone)]
pub enum ApertureShape {
    /// Radius in pixels (or degrees for world frame).
    Circle { radius: f64 },
    /// Semi-axes in pixels (or degrees for world frame); the position angle
    /// rotates the major axis counterclockwise from +x, in degrees.
    Ellipse {
        major: f64,
        minor: f64,
        position_angle: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordFrame {
    Pixel,
    World,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Mean,
}

impl Aperture {
    pub fn circle(x: f64, y: f64, radius: f64) -> Self {
        Aperture {
            x,
            y,
            shape: ApertureShape::Circle { radius },
            frame: CoordFrame::Pixel,
        }
    }

    pub fn in_world_frame(mut self) -> Self {
        self.frame = CoordFrame::World;
        self
    }
}

/// Reduce a cube over the spatial pixels enclosed by the aperture. Pure
/// function: one output value per spectral channel.
///
/// World-frame apertures need a WCS; the center converts through
/// `world_to_pixel` and radii (degrees) through the pixel scale. An
/// aperture enclosing no pixel center is an explicit error, never a silent
/// all-zero spectrum.
pub fn extract_aperture(
    cube: &Array3<f32>,
    aperture: &Aperture,
    reduce: Reduce,
    wcs: Option<&CelestialWcs>,
) -> Result<Array1<f32>> {
    let (nchan, ny, nx) = cube.dim();

    let (cx, cy, shape) = match aperture.frame {
        CoordFrame::Pixel => (aperture.x, aperture.y, aperture.shape.clone()),
        CoordFrame::World => {
            let wcs = wcs.ok_or(Error::MissingWcs)?;
            let (px, py) = wcs.world_to_pixel(aperture.x, aperture.y);
            let scale = wcs.pixel_scale_deg().max(f64::MIN_POSITIVE);
            let shape = match aperture.shape {
                ApertureShape::Circle { radius } => ApertureShape::Circle {
                    radius: radius / scale,
                },
                ApertureShape::Ellipse {
                    major,
                    minor,
                    position_angle,
                } => ApertureShape::Ellipse {
                    major: major / scale,
                    minor: minor / scale,
                    position_angle,
                },
            };
            (px, py, shape)
        }
    };

    let mut members = Vec::new();
    for y in 0..ny {
        for x in 0..nx {
            if shape.contains(x as f64 - cx, y as f64 - cy) {
                members.push((x, y));
            }
        }
    }

    if members.is_empty() {
        return Err(Error::EmptyAperture {
            x: cx,
            y: cy,
            nx,
            ny,
        });
    }

    let mut out = Array1::<f32>::zeros(nchan);
    for (o, z) in out.iter_mut().zip(0..nchan) {
        let mut acc = 0.0f64;
        for &(x, y) in &members {
            acc += cube[[z, y, x]] as f64;
        }
        *o = match reduce {
            Reduce::Sum => acc as f32,
            Reduce::Mean => (acc / members.len() as f64) as f32,
        };
    }
    Ok(out)
}

impl ApertureShape {
    /// Membership test for a pixel center offset (dx, dy) from the aperture
    /// center.
    fn contains(&self, dx: f64, dy: f64) -> bool {
        match *self {
            ApertureShape::Circle { radius } => dx * dx + dy * dy <= radius * radius,
            ApertureShape::Ellipse {
                major,
                minor,
                position_angle,
            } => {
                if major <= 0.0 || minor <= 0.0 {
                    return false;
                }
                let theta = position_angle.to_radians();
                let u = dx * theta.cos() + dy * theta.sin();
                let v = -dx * theta.sin() + dy * theta.cos();
                (u / major).powi(2) + (v / minor).powi(2) <= 1.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_cube(value: f32) -> Array3<f32> {
        Array3::from_elem((6, 9, 9), value)
    }

    #[test]
    fn test_mean_over_constant_cube_is_exact() {
        let cube = constant_cube(7.5);
        let ap = Aperture::circle(4.0, 4.0, 2.5);
        let spec = extract_aperture(&cube, &ap, Reduce::Mean, None).unwrap();
        assert_eq!(spec.len(), 6);
        for &v in spec.iter() {
            assert_eq!(v, 7.5);
        }
    }

    #[test]
    fn test_sum_scales_with_member_count() {
        let cube = constant_cube(2.0);
        let ap = Aperture::circle(4.0, 4.0, 1.0);
        // Radius 1 encloses the center and its four edge neighbors.
        let spec = extract_aperture(&cube, &ap, Reduce::Sum, None).unwrap();
        for &v in spec.iter() {
            assert!((v - 10.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_aperture_outside_grid_is_an_error() {
        let cube = constant_cube(1.0);
        let ap = Aperture::circle(100.0, 100.0, 2.0);
        assert!(matches!(
            extract_aperture(&cube, &ap, Reduce::Mean, None),
            Err(Error::EmptyAperture { .. })
        ));
    }

    #[test]
    fn test_world_frame_requires_wcs() {
        let cube = constant_cube(1.0);
        let ap = Aperture::circle(83.6, 22.0, 0.01).in_world_frame();
        assert!(matches!(
            extract_aperture(&cube, &ap, Reduce::Mean, None),
            Err(Error::MissingWcs)
        ));
    }

    #[test]
    fn test_ellipse_rotation() {
        let shape = ApertureShape::Ellipse {
            major: 3.0,
            minor: 1.0,
            position_angle: 90.0,
        };
        // Major axis now points along +y.
        assert!(shape.contains(0.0, 2.5));
        assert!(!shape.contains(2.5, 0.0));
    }
}
