//! Loss/accuracy-per-epoch chart.
//!
//! `.svg` paths get a vector chart; anything else is rasterised with `image`
//! and encoded according to the extension.

use std::{fmt::Write as _, fs, path::Path};

use image::{Rgb, RgbImage};

use crate::{
    error::{Error, Result},
    training::TrainingHistory,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 20.0;
const MARGIN_TOP: f64 = 36.0;
const MARGIN_BOTTOM: f64 = 50.0;

const BACKGROUND: [u8; 3] = [255, 255, 255];
const PANEL: [u8; 3] = [229, 229, 229];
const GRID: [u8; 3] = [255, 255, 255];
const TEXT: [u8; 3] = [85, 85, 85];

pub const TITLE: &str = "Training Loss and Accuracy";
pub const X_LABEL: &str = "Epoch #";
pub const Y_LABEL: &str = "Loss/Accuracy";

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: &'static str,
    pub values: Vec<f64>,
    pub color: [u8; 3],
}

/// The four curves, in legend order.
pub fn history_series(history: &TrainingHistory) -> Vec<Series> {
    vec![
        Series {
            name: "train_loss",
            values: history.loss(),
            color: [226, 74, 51],
        },
        Series {
            name: "val_loss",
            values: history.val_loss(),
            color: [52, 138, 189],
        },
        Series {
            name: "train_acc",
            values: history.accuracy(),
            color: [152, 142, 213],
        },
        Series {
            name: "val_acc",
            values: history.val_accuracy(),
            color: [119, 119, 119],
        },
    ]
}

/// Data-to-pixel mapping shared by both renderers.
struct Frame {
    epochs: usize,
    y_max: f64,
}

impl Frame {
    fn new(series: &[Series]) -> Self {
        let epochs = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
        let peak = series
            .iter()
            .flat_map(|s| s.values.iter().copied())
            .filter(|v| v.is_finite())
            .fold(1.0_f64, f64::max);

        Self {
            epochs,
            y_max: (peak * 1.05 * 10.0).ceil() / 10.0,
        }
    }

    fn plot_width(&self) -> f64 {
        WIDTH as f64 - MARGIN_LEFT - MARGIN_RIGHT
    }

    fn plot_height(&self) -> f64 {
        HEIGHT as f64 - MARGIN_TOP - MARGIN_BOTTOM
    }

    fn x(&self, epoch: f64) -> f64 {
        let span = self.epochs.saturating_sub(1).max(1) as f64;
        MARGIN_LEFT + epoch / span * self.plot_width()
    }

    fn y(&self, value: f64) -> f64 {
        MARGIN_TOP + self.plot_height() - value.clamp(0.0, self.y_max) / self.y_max * self.plot_height()
    }

    fn y_ticks(&self) -> Vec<f64> {
        (0..=5).map(|i| self.y_max * i as f64 / 5.0).collect()
    }

    fn x_ticks(&self) -> Vec<usize> {
        let step = self.epochs.div_ceil(10).max(1);
        (0..self.epochs.max(1)).step_by(step).collect()
    }
}

pub fn plot_history(history: &TrainingHistory, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let series = history_series(history);
    let is_svg = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("svg"));

    if is_svg {
        fs::write(path, render_svg(&series))?;
        Ok(())
    } else {
        render_raster(&series)
            .save(path)
            .map_err(|e| Error::Plot(format!("{}: {e}", path.display())))
    }
}

fn hex([r, g, b]: [u8; 3]) -> String {
    format!("#{r:02x}{g:02x}{b:02x}")
}

pub fn render_svg(series: &[Series]) -> String {
    let frame = Frame::new(series);
    let mut svg = String::new();

    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {WIDTH} {HEIGHT}" width="{WIDTH}" height="{HEIGHT}">"#
    );
    let _ = write!(
        svg,
        r#"<rect width="{WIDTH}" height="{HEIGHT}" fill="{}"/><rect x="{MARGIN_LEFT}" y="{MARGIN_TOP}" width="{}" height="{}" fill="{}"/>"#,
        hex(BACKGROUND),
        frame.plot_width(),
        frame.plot_height(),
        hex(PANEL)
    );

    for tick in frame.y_ticks() {
        let y = frame.y(tick);
        let _ = write!(
            svg,
            r#"<line x1="{MARGIN_LEFT}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="{}"/><text x="{:.1}" y="{:.1}" text-anchor="end" font-family="sans-serif" font-size="11" fill="{}">{tick:.1}</text>"#,
            MARGIN_LEFT + frame.plot_width(),
            hex(GRID),
            MARGIN_LEFT - 6.0,
            y + 4.0,
            hex(TEXT)
        );
    }
    for tick in frame.x_ticks() {
        let x = frame.x(tick as f64);
        let _ = write!(
            svg,
            r#"<line x1="{x:.1}" y1="{MARGIN_TOP}" x2="{x:.1}" y2="{:.1}" stroke="{}"/><text x="{x:.1}" y="{:.1}" text-anchor="middle" font-family="sans-serif" font-size="11" fill="{}">{tick}</text>"#,
            MARGIN_TOP + frame.plot_height(),
            hex(GRID),
            MARGIN_TOP + frame.plot_height() + 16.0,
            hex(TEXT)
        );
    }

    for s in series {
        let points: Vec<String> = s
            .values
            .iter()
            .enumerate()
            .map(|(i, &v)| format!("{:.1},{:.1}", frame.x(i as f64), frame.y(v)))
            .collect();
        let _ = write!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
            points.join(" "),
            hex(s.color)
        );
    }

    let legend_top = MARGIN_TOP + frame.plot_height() - 10.0 - 18.0 * series.len() as f64;
    for (i, s) in series.iter().enumerate() {
        let y = legend_top + 18.0 * i as f64 + 9.0;
        let x = MARGIN_LEFT + 12.0;
        let _ = write!(
            svg,
            r#"<line x1="{x}" y1="{y}" x2="{}" y2="{y}" stroke="{}" stroke-width="2"/><text x="{}" y="{}" font-family="sans-serif" font-size="12" fill="{}">{}</text>"#,
            x + 24.0,
            hex(s.color),
            x + 30.0,
            y + 4.0,
            hex(TEXT),
            s.name
        );
    }

    let _ = write!(
        svg,
        r#"<text x="{:.1}" y="{}" text-anchor="middle" font-family="sans-serif" font-size="13" fill="{}">{X_LABEL}</text>"#,
        MARGIN_LEFT + frame.plot_width() / 2.0,
        HEIGHT - 12,
        hex(TEXT)
    );
    let _ = write!(
        svg,
        r#"<text x="18" y="{:.1}" text-anchor="middle" font-family="sans-serif" font-size="13" fill="{}" transform="rotate(-90 18 {:.1})">{Y_LABEL}</text>"#,
        MARGIN_TOP + frame.plot_height() / 2.0,
        hex(TEXT),
        MARGIN_TOP + frame.plot_height() / 2.0
    );

    let _ = write!(
        svg,
        r#"<text x="{:.1}" y="24" text-anchor="middle" font-family="sans-serif" font-size="15" fill="{}">{TITLE}</text>"#,
        MARGIN_LEFT + frame.plot_width() / 2.0,
        hex(TEXT)
    );

    svg.push_str("</svg>");
    svg
}

pub fn render_raster(series: &[Series]) -> RgbImage {
    let frame = Frame::new(series);
    let mut canvas = Canvas(RgbImage::from_pixel(WIDTH, HEIGHT, Rgb(BACKGROUND)));

    let (left, top) = (MARGIN_LEFT, MARGIN_TOP);
    let (right, bottom) = (left + frame.plot_width(), top + frame.plot_height());
    canvas.fill_rect(left, top, right, bottom, PANEL);

    for tick in frame.y_ticks() {
        let y = frame.y(tick);
        canvas.line((left, y), (right, y), GRID, 1.0);
        let label = format!("{tick:.1}");
        canvas.text(left - 8.0 - glyph::width(&label, 1) as f64, y - 3.0, &label, TEXT, 1);
    }
    for tick in frame.x_ticks() {
        let x = frame.x(tick as f64);
        canvas.line((x, top), (x, bottom), GRID, 1.0);
        let label = tick.to_string();
        canvas.text(x - glyph::width(&label, 1) as f64 / 2.0, bottom + 6.0, &label, TEXT, 1);
    }

    for s in series {
        let points: Vec<(f64, f64)> = s
            .values
            .iter()
            .enumerate()
            .map(|(i, &v)| (frame.x(i as f64), frame.y(v)))
            .collect();
        match points.as_slice() {
            [single] => canvas.fill_rect(single.0 - 2.0, single.1 - 2.0, single.0 + 2.0, single.1 + 2.0, s.color),
            _ => {
                for pair in points.windows(2) {
                    canvas.line(pair[0], pair[1], s.color, 2.0);
                }
            }
        }
    }

    let legend_height = 18.0 * series.len() as f64 + 8.0;
    let legend_width = 24.0 + 8.0 + series.iter().map(|s| glyph::width(s.name, 2)).max().unwrap_or(0) as f64 + 16.0;
    let (lx, ly) = (left + 8.0, bottom - 8.0 - legend_height);
    canvas.fill_rect(lx, ly, lx + legend_width, ly + legend_height, [242, 242, 242]);
    for (i, s) in series.iter().enumerate() {
        let y = ly + 13.0 + 18.0 * i as f64;
        canvas.line((lx + 6.0, y), (lx + 30.0, y), s.color, 2.0);
        canvas.text(lx + 36.0, y - 7.0, s.name, TEXT, 2);
    }

    let title_at = left + frame.plot_width() / 2.0 - glyph::width(TITLE, 2) as f64 / 2.0;
    canvas.text(title_at, 12.0, TITLE, TEXT, 2);
    let x_label_at = left + frame.plot_width() / 2.0 - glyph::width(X_LABEL, 2) as f64 / 2.0;
    canvas.text(x_label_at, HEIGHT as f64 - 22.0, X_LABEL, TEXT, 2);
    let y_label_at = top + frame.plot_height() / 2.0 + glyph::width(Y_LABEL, 2) as f64 / 2.0;
    canvas.text_vertical(6.0, y_label_at, Y_LABEL, TEXT, 2);

    canvas.0
}

struct Canvas(RgbImage);

impl Canvas {
    fn put(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x >= 0 && y >= 0 && (x as u32) < self.0.width() && (y as u32) < self.0.height() {
            self.0.put_pixel(x as u32, y as u32, Rgb(color));
        }
    }

    fn fill_rect(&mut self, x0: f64, y0: f64, x1: f64, y1: f64, color: [u8; 3]) {
        for y in y0.round() as i64..=y1.round() as i64 {
            for x in x0.round() as i64..=x1.round() as i64 {
                self.put(x, y, color);
            }
        }
    }

    fn line(&mut self, (x0, y0): (f64, f64), (x1, y1): (f64, f64), color: [u8; 3], thickness: f64) {
        let length = (x1 - x0).hypot(y1 - y0);
        let steps = (length * 2.0).ceil().max(1.0) as usize;
        let half = thickness / 2.0;

        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let (x, y) = (x0 + (x1 - x0) * t, y0 + (y1 - y0) * t);
            self.fill_rect(x - half + 0.5, y - half + 0.5, x + half - 0.5, y + half - 0.5, color);
        }
    }

    fn text(&mut self, x: f64, y: f64, text: &str, color: [u8; 3], scale: i64) {
        let (x, y) = (x.round() as i64, y.round() as i64);
        for (i, ch) in text.chars().enumerate() {
            let origin = x + i as i64 * glyph::ADVANCE * scale;
            for (row, bits) in glyph::rows(ch).iter().enumerate() {
                for col in 0..5 {
                    if bits & (0b10000 >> col) != 0 {
                        for dy in 0..scale {
                            for dx in 0..scale {
                                self.put(origin + col * scale + dx, y + row as i64 * scale + dy, color);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reads bottom to top, starting at `(x, y)`.
    fn text_vertical(&mut self, x: f64, y: f64, text: &str, color: [u8; 3], scale: i64) {
        let (x, y) = (x.round() as i64, y.round() as i64);
        for (i, ch) in text.chars().enumerate() {
            let origin = y - i as i64 * glyph::ADVANCE * scale;
            for (row, bits) in glyph::rows(ch).iter().enumerate() {
                for col in 0..5 {
                    if bits & (0b10000 >> col) != 0 {
                        for dy in 0..scale {
                            for dx in 0..scale {
                                self.put(x + row as i64 * scale + dx, origin - col * scale - dy, color);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// 5x7 bitmap glyphs for the characters the chart needs.
mod glyph {
    pub const ADVANCE: i64 = 6;

    pub fn width(text: &str, scale: i64) -> i64 {
        text.chars().count() as i64 * ADVANCE * scale
    }

    pub fn rows(ch: char) -> [u8; 7] {
        match ch {
            '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
            '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
            '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
            '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
            '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
            '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
            '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
            '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
            '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
            '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
            '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
            '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
            '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
            '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
            '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
            'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
            'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
            'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
            'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
            'a' => [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F],
            'c' => [0x00, 0x00, 0x0E, 0x10, 0x10, 0x11, 0x0E],
            'd' => [0x01, 0x01, 0x0D, 0x13, 0x11, 0x11, 0x0F],
            'g' => [0x00, 0x00, 0x0F, 0x11, 0x0F, 0x01, 0x0E],
            'h' => [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11],
            'i' => [0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x0E],
            'l' => [0x0C, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
            'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
            'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
            'p' => [0x00, 0x00, 0x1E, 0x11, 0x1E, 0x10, 0x10],
            'r' => [0x00, 0x00, 0x16, 0x19, 0x10, 0x10, 0x10],
            's' => [0x00, 0x00, 0x0E, 0x10, 0x0E, 0x01, 0x1E],
            't' => [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06],
            'u' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x13, 0x0D],
            'v' => [0x00, 0x00, 0x11, 0x11, 0x11, 0x0A, 0x04],
            'y' => [0x00, 0x00, 0x11, 0x11, 0x0F, 0x01, 0x0E],
            _ => [0; 7],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::EpochMetrics;
    use tempfile::TempDir;

    fn history(epochs: usize) -> TrainingHistory {
        TrainingHistory {
            epochs: (0..epochs)
                .map(|i| EpochMetrics {
                    epoch: i + 1,
                    loss: 0.7 / (i + 1) as f64,
                    accuracy: 0.5 + 0.04 * i as f64,
                    val_loss: 0.6 / (i + 1) as f64,
                    val_accuracy: 0.55 + 0.04 * i as f64,
                    learning_rate: 1e-3,
                })
                .collect(),
        }
    }

    #[test]
    fn png_is_written_into_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plots/plot.png");

        plot_history(&history(5), &path).unwrap();

        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (WIDTH, HEIGHT));
    }

    #[test]
    fn raster_draws_every_series_color() {
        let series = history_series(&history(4));
        let image = render_raster(&series);

        for s in &series {
            assert!(image.pixels().any(|p| p.0 == s.color), "{} missing", s.name);
        }
    }

    #[test]
    fn svg_has_a_curve_and_legend_entry_per_series() {
        let series = history_series(&history(3));
        let svg = render_svg(&series);

        assert_eq!(svg.matches("<polyline").count(), 4);
        for name in ["train_loss", "val_loss", "train_acc", "val_acc"] {
            assert!(svg.contains(&format!(">{name}</text>")));
        }
        assert!(svg.contains(TITLE) && svg.contains(X_LABEL) && svg.contains(Y_LABEL));
    }

    #[test]
    fn single_epoch_history_still_renders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plot.svg");
        plot_history(&history(1), &path).unwrap();
        assert!(fs::read_to_string(path).unwrap().ends_with("</svg>"));
    }
}
