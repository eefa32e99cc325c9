use crate::error::AnalysisError;
use crate::util::ensure_parent_dir;
use crate::widgets::{parse_bounds, Bounds, WidgetRecord};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{DynamicImage, Rgba, RgbaImage};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CLICKABLE_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
pub const TEXT_ONLY_COLOR: Rgba<u8> = Rgba([0, 0, 255, 255]);
pub const BOX_THICKNESS: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedWidget {
    pub label: u32,
    #[serde(flatten)]
    pub widget: WidgetRecord,
    #[serde(rename = "rect")]
    pub parsed_bounds: Bounds,
    pub description: String,
}

impl AnnotatedWidget {
    fn color(&self) -> Rgba<u8> {
        if self.widget.clickable {
            CLICKABLE_COLOR
        } else {
            TEXT_ONLY_COLOR
        }
    }
}

/// A notable widget that got no box: its bounds did not parse or fell
/// outside the screenshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipDiagnostic {
    /// Position in the extracted widget list.
    pub index: usize,
    pub bounds: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub widgets: Vec<AnnotatedWidget>,
    pub skipped: Vec<SkipDiagnostic>,
}

impl Annotation {
    pub fn descriptions(&self) -> Vec<String> {
        self.widgets.iter().map(|w| w.description.clone()).collect()
    }

    pub fn labels(&self) -> Vec<u32> {
        self.widgets.iter().map(|w| w.label).collect()
    }
}

pub fn describe_widget(label: u32, widget: &WidgetRecord) -> String {
    let mut out = format!(
        "label {label}: class={}, text={}, clickable={}",
        widget.class_name, widget.text, widget.clickable
    );
    if !widget.resource_id.is_empty() {
        out.push_str(&format!(", resource-id={}", widget.resource_id));
    }
    out
}

/// Label the clickable or text-bearing widgets in order. Labels stay dense
/// (1..N) over the widgets that actually get a box. With a `frame`, widgets
/// lying wholly outside the `(width, height)` screenshot are skipped too.
pub fn plan_annotations(
    widgets: &[WidgetRecord],
    frame: Option<(u32, u32)>,
) -> (Vec<AnnotatedWidget>, Vec<SkipDiagnostic>) {
    let mut annotated = Vec::new();
    let mut skipped = Vec::new();

    for (index, widget) in widgets.iter().enumerate() {
        if !widget.is_notable() {
            continue;
        }
        let parsed = parse_bounds(&widget.bounds).and_then(|bounds| match frame {
            Some((w, h)) if !overlaps_frame(bounds, (w, h)) => Err(format!(
                "bounds {} lie outside the {w}x{h} screenshot",
                widget.bounds
            )),
            _ => Ok(bounds),
        });
        match parsed {
            Ok(parsed_bounds) => {
                let label = annotated.len() as u32 + 1;
                annotated.push(AnnotatedWidget {
                    label,
                    widget: widget.clone(),
                    parsed_bounds,
                    description: describe_widget(label, widget),
                });
            }
            Err(reason) => {
                debug!(index, %reason, "skipping widget");
                skipped.push(SkipDiagnostic {
                    index,
                    bounds: widget.bounds.clone(),
                    reason,
                });
            }
        }
    }

    (annotated, skipped)
}

pub fn render_annotations(img: &mut RgbaImage, widgets: &[AnnotatedWidget]) {
    let glyph_scale = label_glyph_scale(img.width(), img.height());
    for widget in widgets {
        let color = widget.color();
        draw_bounds_outline(img, widget.parsed_bounds, color, BOX_THICKNESS);
        draw_label_tag(img, widget.parsed_bounds, &widget.label.to_string(), color, glyph_scale);
    }
}

/// Open the screenshot, burn in boxes and label tags, and save to `out_path`.
pub fn annotate_screenshot(
    image_path: &Path,
    widgets: &[WidgetRecord],
    out_path: &Path,
) -> Result<Annotation, AnalysisError> {
    if !image_path.exists() {
        warn!("image file not found at {}", image_path.display());
        return Err(AnalysisError::UnreadableImage {
            path: image_path.to_path_buf(),
            reason: "file not found".to_string(),
        });
    }
    let input = image::open(image_path).map_err(|err| {
        warn!("could not read image at {}: {err}", image_path.display());
        AnalysisError::UnreadableImage {
            path: image_path.to_path_buf(),
            reason: err.to_string(),
        }
    })?;

    let mut rendered = input.to_rgba8();
    let (width, height) = rendered.dimensions();
    let (annotated, skipped) = plan_annotations(widgets, Some((width, height)));
    if !skipped.is_empty() {
        warn!(count = skipped.len(), "skipped widgets without a drawable box");
    }
    render_annotations(&mut rendered, &annotated);

    ensure_parent_dir(out_path).map_err(|err| {
        AnalysisError::io(format!("failed to create directory for {}", out_path.display()), err)
    })?;
    DynamicImage::ImageRgba8(rendered)
        .save(out_path)
        .map_err(|err| {
            AnalysisError::io(
                format!("failed to save annotated image: {}", out_path.display()),
                io::Error::other(err.to_string()),
            )
        })?;

    Ok(Annotation {
        image_path: out_path.to_path_buf(),
        width,
        height,
        widgets: annotated,
        skipped,
    })
}

fn label_glyph_scale(img_w: u32, img_h: u32) -> u32 {
    let max_dim = f64::from(img_w.max(img_h).max(1));
    let scale = (max_dim / 1200.0).clamp(1.0, 2.0);
    (scale * 2.0).round() as u32
}

fn color_luma(color: Rgba<u8>) -> f64 {
    let [r, g, b, _] = color.0;
    (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)) / 255.0
}

fn contrast_text_color(color: Rgba<u8>) -> Rgba<u8> {
    if color_luma(color) > 0.5 {
        Rgba([0, 0, 0, 255])
    } else {
        Rgba([255, 255, 255, 255])
    }
}

/// Source-over compositing in integer space.
fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = u32::from(src[3]);
    if a == 0 {
        return dst;
    }
    let inv = 255 - a;
    let mix = |d: u8, s: u8| ((u32::from(d) * inv + u32::from(s) * a + 127) / 255) as u8;
    let out_a = (a + (u32::from(dst[3]) * inv + 127) / 255).min(255) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

/// Inclusive pixel rectangle that lies inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

/// Intersect an inclusive rectangle with the image. Coordinates are widened to
/// `i64` so screen bounds anywhere in the `i32` range never overflow.
fn clip_rect(img: &RgbaImage, x0: i64, y0: i64, x1: i64, y1: i64) -> Option<PixelRect> {
    let left = x0.min(x1).max(0);
    let right = x0.max(x1).min(i64::from(img.width()) - 1);
    let top = y0.min(y1).max(0);
    let bottom = y0.max(y1).min(i64::from(img.height()) - 1);
    if left > right || top > bottom {
        return None;
    }
    Some(PixelRect {
        x0: left as u32,
        y0: top as u32,
        x1: right as u32,
        y1: bottom as u32,
    })
}

fn overlaps_frame(bounds: Bounds, (width, height): (u32, u32)) -> bool {
    let (left, right) = (bounds.x1.min(bounds.x2), bounds.x1.max(bounds.x2));
    let (top, bottom) = (bounds.y1.min(bounds.y2), bounds.y1.max(bounds.y2));
    right >= 0
        && bottom >= 0
        && i64::from(left) < i64::from(width)
        && i64::from(top) < i64::from(height)
}

fn fill_rect(img: &mut RgbaImage, rect: PixelRect, color: Rgba<u8>) {
    for y in rect.y0..=rect.y1 {
        for x in rect.x0..=rect.x1 {
            let dst = *img.get_pixel(x, y);
            img.put_pixel(x, y, blend_pixel(dst, color));
        }
    }
}

/// Rectangle outline growing outward from the bounds. Edges that fall off
/// the image are not drawn.
fn draw_bounds_outline(img: &mut RgbaImage, bounds: Bounds, color: Rgba<u8>, thickness: u32) {
    let (left, right) = (i64::from(bounds.x1.min(bounds.x2)), i64::from(bounds.x1.max(bounds.x2)));
    let (top, bottom) = (i64::from(bounds.y1.min(bounds.y2)), i64::from(bounds.y1.max(bounds.y2)));

    for t in 0..i64::from(thickness.max(1)) {
        let (l, r, tp, b) = (left - t, right + t, top - t, bottom + t);
        for (x0, y0, x1, y1) in [(l, tp, r, tp), (l, b, r, b), (l, tp, l, b), (r, tp, r, b)] {
            if let Some(edge) = clip_rect(img, x0, y0, x1, y1) {
                fill_rect(img, edge, color);
            }
        }
    }
}

/// Filled tag with the label number at the top-left corner of the visible
/// part of the box; above the box when it fits, inside it otherwise.
fn draw_label_tag(img: &mut RgbaImage, bounds: Bounds, text: &str, color: Rgba<u8>, scale: u32) {
    let Some(visible) = clip_rect(
        img,
        i64::from(bounds.x1),
        i64::from(bounds.y1),
        i64::from(bounds.x2),
        i64::from(bounds.y2),
    ) else {
        return;
    };
    let pad = i64::from(scale.max(1)) * 2;
    let (tw, th) = text_size(text, scale);
    let (tag_w, tag_h) = (tw + pad * 2, th + pad * 2);

    let x0 = i64::from(visible.x0);
    let top = i64::from(visible.y0);
    let y0 = if top - tag_h >= 0 { top - tag_h } else { top };

    if let Some(tag) = clip_rect(img, x0, y0, x0 + tag_w - 1, y0 + tag_h - 1) {
        fill_rect(img, tag, color);
    }
    draw_bitmap_text(img, x0 + pad, y0 + pad, text, contrast_text_color(color), scale);
}

fn text_size(text: &str, scale: u32) -> (i64, i64) {
    let scale = i64::from(scale.max(1));
    (text.chars().count() as i64 * 8 * scale, 8 * scale)
}

fn draw_bitmap_text(img: &mut RgbaImage, x: i64, y: i64, text: &str, color: Rgba<u8>, scale: u32) {
    let scale = i64::from(scale.max(1));
    for (index, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            continue;
        };
        let origin_x = x + index as i64 * 8 * scale;
        for (row_idx, row) in glyph.iter().enumerate() {
            let py = y + row_idx as i64 * scale;
            for col_idx in 0..8i64 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = origin_x + col_idx * scale;
                if let Some(cell) = clip_rect(img, px, py, px + scale - 1, py + scale - 1) {
                    fill_rect(img, cell, color);
                }
            }
        }
    }
}
