use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::geometry::contour_area;
use imageproc::map::map_colors2;
use imageproc::point::Point;
use imageproc::rect::Rect;

use crate::errors::{MotionError, Result};

const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Bounding box of one changed region, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub motion_detected: bool,
    /// Input frame with the qualifying regions outlined
    pub annotated: RgbImage,
    pub delta: GrayImage,
    pub threshold: GrayImage,
    pub regions: Vec<Region>,
}

/// Image analysis backend used by camera sessions.
pub trait MotionAnalyzer: Send + Sync {
    /// Convert a frame into the form `analyze` compares against the reference.
    fn prepare(&self, frame: &RgbImage) -> Result<GrayImage>;

    /// Compare `gray` (the prepared form of `frame`) against `reference`.
    fn analyze(&self, frame: RgbImage, gray: &GrayImage, reference: &GrayImage, min_area: u32) -> Result<Analysis>;
}

/// Frame differencing against a reference: blur, absolute difference,
/// binary threshold, dilation, then outer contours filtered by area.
#[derive(Debug, Clone)]
pub struct DiffAnalyzer {
    pub blur_sigma: f32,
    pub pixel_threshold: u8,
    pub dilate_radius: u8,
}

impl Default for DiffAnalyzer {
    fn default() -> Self {
        Self {
            blur_sigma: 3.5, // roughly a 21x21 gaussian kernel
            pixel_threshold: 25,
            dilate_radius: 2,
        }
    }
}

impl MotionAnalyzer for DiffAnalyzer {
    fn prepare(&self, frame: &RgbImage) -> Result<GrayImage> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(MotionError::analysis("cannot convert an empty frame"));
        }
        let gray = image::imageops::grayscale(frame);
        Ok(imageproc::filter::gaussian_blur_f32(&gray, self.blur_sigma.max(0.1)))
    }

    fn analyze(&self, mut frame: RgbImage, gray: &GrayImage, reference: &GrayImage, min_area: u32) -> Result<Analysis> {
        if gray.dimensions() != reference.dimensions() {
            return Err(MotionError::analysis(format!(
                "frame is {:?} but reference is {:?}",
                gray.dimensions(),
                reference.dimensions()
            )));
        }

        let delta: GrayImage = map_colors2(gray, reference, |a, b| Luma([a[0].abs_diff(b[0])]));
        let binary = threshold(&delta, self.pixel_threshold, ThresholdType::Binary);
        let threshold = imageproc::morphology::dilate(&binary, Norm::LInf, self.dilate_radius);

        let mut regions = Vec::new();
        for contour in find_contours::<i32>(&threshold) {
            if contour.border_type != BorderType::Outer || contour.points.is_empty() {
                continue;
            }
            if contour_area(&contour.points).abs() < min_area as f64 {
                continue;
            }
            regions.push(bounding_box(&contour.points));
        }

        for region in &regions {
            draw_region(&mut frame, region);
        }

        Ok(Analysis {
            motion_detected: !regions.is_empty(),
            annotated: frame,
            delta,
            threshold,
            regions,
        })
    }
}

fn bounding_box(points: &[Point<i32>]) -> Region {
    let min_x = points.iter().map(|p| p.x).min().unwrap_or(0).max(0);
    let max_x = points.iter().map(|p| p.x).max().unwrap_or(0).max(0);
    let min_y = points.iter().map(|p| p.y).min().unwrap_or(0).max(0);
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(0).max(0);
    Region {
        x: min_x as u32,
        y: min_y as u32,
        width: (max_x - min_x) as u32 + 1,
        height: (max_y - min_y) as u32 + 1,
    }
}

fn draw_region(frame: &mut RgbImage, region: &Region) {
    let outer = Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height);
    draw_hollow_rect_mut(frame, outer, REGION_COLOR);
    if region.width > 2 && region.height > 2 {
        let inner = Rect::at(region.x as i32 + 1, region.y as i32 + 1).of_size(region.width - 2, region.height - 2);
        draw_hollow_rect_mut(frame, inner, REGION_COLOR);
    }
}
