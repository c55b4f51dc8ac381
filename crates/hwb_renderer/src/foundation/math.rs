//! Math types and the display-orientation transform

use nalgebra::{Matrix4, Vector3};

/// 4x4 column-major matrix
pub type Mat4 = Matrix4<f32>;
/// 3-component vector
pub type Vec3 = Vector3<f32>;

/// Rotation of the camera buffer relative to the display, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// No rotation
    #[default]
    Deg0,
    /// Quarter turn
    Deg90,
    /// Half turn
    Deg180,
    /// Three-quarter turn
    Deg270,
}

impl Orientation {
    /// Map an angle in degrees; anything that is not a multiple of 90 is rejected
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    /// Angle in degrees
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether the buffer's width and height trade places on screen
    pub fn swaps_axes(self) -> bool {
        self.degrees() % 180 != 0
    }
}

/// Model matrix that letterboxes a `content` sized image inside a `window`
/// sized viewport and then rotates it by `orientation` about Z.
///
/// The axis that would overflow is compressed so the aspect ratio is kept.
pub fn fit_rotated_content(
    window: (u32, u32),
    content: (u32, u32),
    orientation: Orientation,
) -> Mat4 {
    let (mut content_w, mut content_h) = content;
    if orientation.swaps_axes() {
        std::mem::swap(&mut content_w, &mut content_h);
    }

    let window_ratio = window.0 as f32 / window.1.max(1) as f32;
    let content_ratio = content_w as f32 / content_h.max(1) as f32;

    let scale = if content_ratio >= window_ratio {
        Vec3::new(1.0, window_ratio / content_ratio, 1.0)
    } else {
        Vec3::new(content_ratio / window_ratio, 1.0, 1.0)
    };

    let rotation = Mat4::from_axis_angle(
        &Vec3::z_axis(),
        (orientation.degrees() as f32).to_radians(),
    );

    Mat4::new_nonuniform_scaling(&scale) * rotation
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-6;

    #[test]
    fn test_orientation_parsing() {
        assert_eq!(Orientation::from_degrees(90), Some(Orientation::Deg90));
        assert_eq!(Orientation::from_degrees(-90), Some(Orientation::Deg270));
        assert_eq!(Orientation::from_degrees(450), Some(Orientation::Deg90));
        assert_eq!(Orientation::from_degrees(45), None);
        assert!(Orientation::Deg270.swaps_axes());
        assert!(!Orientation::Deg180.swaps_axes());
    }

    #[test]
    fn test_matching_aspect_is_identity() {
        let model = fit_rotated_content((1920, 1080), (1920, 1080), Orientation::Deg0);
        assert_relative_eq!(model, Mat4::identity(), epsilon = EPSILON);
    }

    #[test]
    fn test_wide_content_compresses_y() {
        // 2:1 content in a 4:3 window
        let model = fit_rotated_content((1600, 1200), (2000, 1000), Orientation::Deg0);
        assert_relative_eq!(model[(0, 0)], 1.0, epsilon = EPSILON);
        assert_relative_eq!(model[(1, 1)], (4.0 / 3.0) / 2.0, epsilon = EPSILON);
    }

    #[test]
    fn test_quarter_turn_swaps_then_rotates() {
        // 4:3 sensor shown sideways in a 16:9 window becomes 3:4 content
        let model = fit_rotated_content((1920, 1080), (4032, 3024), Orientation::Deg90);
        let sx = 0.75 / (1920.0 / 1080.0);

        assert_relative_eq!(model[(0, 0)], 0.0, epsilon = EPSILON);
        assert_relative_eq!(model[(0, 1)], -sx, epsilon = EPSILON);
        assert_relative_eq!(model[(1, 0)], 1.0, epsilon = EPSILON);
        assert_relative_eq!(model[(1, 1)], 0.0, epsilon = EPSILON);
        assert_relative_eq!(model[(2, 2)], 1.0, epsilon = EPSILON);
    }
}
