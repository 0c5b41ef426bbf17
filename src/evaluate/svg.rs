//! Minimal SVG charts for evaluation reports.

use super::{CurvePoint, Histogram};

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 400.0;
const MARGIN: f64 = 48.0;

fn plot_w() -> f64 {
    WIDTH - 2.0 * MARGIN
}

fn plot_h() -> f64 {
    HEIGHT - 2.0 * MARGIN
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn open(title: &str) -> String {
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">
<rect width="100%" height="100%" fill="#ffffff"/>
<text x="{cx}" y="24" text-anchor="middle" font-family="sans-serif" font-size="16">{title}</text>
<line x1="{m}" y1="{b}" x2="{r}" y2="{b}" stroke="#333"/>
<line x1="{m}" y1="{m}" x2="{m}" y2="{b}" stroke="#333"/>
"##,
        w = WIDTH,
        h = HEIGHT,
        cx = WIDTH / 2.0,
        m = MARGIN,
        r = WIDTH - MARGIN,
        b = HEIGHT - MARGIN,
        title = escape(title),
    )
}

fn axis_labels(x_label: &str, y_label: &str, x_range: (f64, f64), y_range: (f64, f64)) -> String {
    let b = HEIGHT - MARGIN;
    format!(
        r##"<text x="{cx}" y="{xl}" text-anchor="middle" font-family="sans-serif" font-size="12">{x_label}</text>
<text x="14" y="{cy}" text-anchor="middle" font-family="sans-serif" font-size="12" transform="rotate(-90 14 {cy})">{y_label}</text>
<text x="{m}" y="{tick}" font-family="sans-serif" font-size="10">{x0:.3}</text>
<text x="{r}" y="{tick}" text-anchor="end" font-family="sans-serif" font-size="10">{x1:.3}</text>
<text x="{yl}" y="{b}" text-anchor="end" font-family="sans-serif" font-size="10">{y0:.3}</text>
<text x="{yl}" y="{top}" text-anchor="end" font-family="sans-serif" font-size="10">{y1:.3}</text>
"##,
        cx = WIDTH / 2.0,
        xl = HEIGHT - 8.0,
        cy = HEIGHT / 2.0,
        m = MARGIN,
        r = WIDTH - MARGIN,
        b = b,
        tick = b + 14.0,
        yl = MARGIN - 4.0,
        top = MARGIN + 4.0,
        x0 = x_range.0,
        x1 = x_range.1,
        y0 = y_range.0,
        y1 = y_range.1,
        x_label = escape(x_label),
        y_label = escape(y_label),
    )
}

/// Bar chart of score counts with a vertical threshold marker.
pub fn histogram(hist: &Histogram, threshold: f64, title: &str) -> String {
    let mut out = open(title);
    let max_count = hist.counts.iter().copied().max().unwrap_or(0).max(1) as f64;
    let bar_w = plot_w() / hist.counts.len() as f64;
    let base = HEIGHT - MARGIN;

    for (i, &count) in hist.counts.iter().enumerate() {
        let h = plot_h() * count as f64 / max_count;
        out.push_str(&format!(
            "<rect x=\"{:.2}\" y=\"{:.2}\" width=\"{:.2}\" height=\"{:.2}\" fill=\"#4a78b5\"/>\n",
            MARGIN + i as f64 * bar_w,
            base - h,
            (bar_w - 1.0).max(0.5),
            h
        ));
    }

    let span = hist.upper - hist.lower;
    if threshold.is_finite() {
        let pos = if span > 0.0 {
            ((threshold - hist.lower) / span).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let x = MARGIN + pos * plot_w();
        out.push_str(&format!(
            "<line x1=\"{x:.2}\" y1=\"{top}\" x2=\"{x:.2}\" y2=\"{base}\" stroke=\"#c0392b\" stroke-width=\"2\" stroke-dasharray=\"6 4\"/>\n\
             <text x=\"{x:.2}\" y=\"{label}\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"11\" fill=\"#c0392b\">threshold {threshold:.4}</text>\n",
            top = MARGIN,
            label = MARGIN - 6.0,
        ));
    }

    out.push_str(&axis_labels(
        "score",
        "count",
        (hist.lower, hist.upper),
        (0.0, max_count),
    ));
    out.push_str("</svg>\n");
    out
}

/// Line chart on the unit square, optionally with the chance diagonal.
pub fn curve(points: &[CurvePoint], title: &str, x_label: &str, y_label: &str, diagonal: bool) -> String {
    let mut out = open(title);
    let to_px = |p: &CurvePoint| {
        (
            MARGIN + p.x.clamp(0.0, 1.0) * plot_w(),
            HEIGHT - MARGIN - p.y.clamp(0.0, 1.0) * plot_h(),
        )
    };

    if diagonal {
        out.push_str(&format!(
            "<line x1=\"{m}\" y1=\"{b}\" x2=\"{r}\" y2=\"{m}\" stroke=\"#999\" stroke-dasharray=\"4 4\"/>\n",
            m = MARGIN,
            b = HEIGHT - MARGIN,
            r = WIDTH - MARGIN,
        ));
    }

    let path: Vec<String> = points
        .iter()
        .map(to_px)
        .map(|(x, y)| format!("{:.2},{:.2}", x, y))
        .collect();
    out.push_str(&format!(
        "<polyline points=\"{}\" fill=\"none\" stroke=\"#4a78b5\" stroke-width=\"2\"/>\n",
        path.join(" ")
    ));

    out.push_str(&axis_labels(x_label, y_label, (0.0, 1.0), (0.0, 1.0)));
    out.push_str("</svg>\n");
    out
}
