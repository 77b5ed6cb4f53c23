//! Size-over-time chart rendered as a standalone SVG document.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::contract::SizeRecord;

const WIDTH: f64 = 1000.0;
const HEIGHT: f64 = 600.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_BOTTOM: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPoint {
    pub timestamp_secs: i64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSeries {
    pub store_id: String,
    pub points: Vec<ReportPoint>,
    pub peak_total: u64,
}

impl ReportSeries {
    pub fn from_records(
        store_id: impl Into<String>,
        records: &[SizeRecord],
        peak_total: Option<u64>,
    ) -> Self {
        let mut points: Vec<ReportPoint> = records
            .iter()
            .map(|record| ReportPoint {
                timestamp_secs: record.timestamp_ms.div_euclid(1_000),
                total_size: record.total_size,
            })
            .collect();
        points.sort_by_key(|point| point.timestamp_secs);

        let series_peak = points.iter().map(|point| point.total_size).max();
        Self {
            store_id: store_id.into(),
            points,
            peak_total: peak_total.max(series_peak).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

pub fn render_svg(series: &ReportSeries) -> String {
    let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let (min_x, max_x) = match (series.points.first(), series.points.last()) {
        (Some(first), Some(last)) => (first.timestamp_secs, last.timestamp_secs),
        _ => (0, 0),
    };
    let span_x = ((max_x - min_x) as f64).max(1.0);
    let max_y = series
        .points
        .iter()
        .map(|point| point.total_size)
        .max()
        .unwrap_or(0)
        .max(series.peak_total)
        .max(1) as f64;

    let to_x = |timestamp: i64| {
        if series.points.len() <= 1 {
            MARGIN_LEFT + plot_width / 2.0
        } else {
            MARGIN_LEFT + ((timestamp - min_x) as f64 / span_x) * plot_width
        }
    };
    let to_y = |size: u64| MARGIN_TOP + plot_height - (size as f64 / max_y) * plot_height;

    let mut svg = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}">"#
    );
    let _ = writeln!(
        svg,
        r#"<rect x="0" y="0" width="{WIDTH}" height="{HEIGHT}" fill="white"/>"#
    );
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="30" text-anchor="middle" font-size="20">Bucket Size Over Time: {}</text>"#,
        WIDTH / 2.0,
        escape_xml(&series.store_id)
    );
    let _ = writeln!(
        svg,
        r#"<line x1="{MARGIN_LEFT}" y1="{}" x2="{}" y2="{}" stroke="black"/>"#,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height
    );
    let _ = writeln!(
        svg,
        r#"<line x1="{MARGIN_LEFT}" y1="{MARGIN_TOP}" x2="{MARGIN_LEFT}" y2="{}" stroke="black"/>"#,
        MARGIN_TOP + plot_height
    );
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-size="14">Timestamp (seconds)</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        HEIGHT - 15.0
    );
    let _ = writeln!(
        svg,
        r#"<text x="20" y="{}" text-anchor="middle" font-size="14" transform="rotate(-90 20 {})">Size (bytes)</text>"#,
        MARGIN_TOP + plot_height / 2.0,
        MARGIN_TOP + plot_height / 2.0
    );

    if series.is_empty() {
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="middle" font-size="16" fill="gray">No size data yet</text>"#,
            MARGIN_LEFT + plot_width / 2.0,
            MARGIN_TOP + plot_height / 2.0
        );
    } else {
        let path: Vec<String> = series
            .points
            .iter()
            .map(|point| {
                format!(
                    "{:.1},{:.1}",
                    to_x(point.timestamp_secs),
                    to_y(point.total_size)
                )
            })
            .collect();
        let _ = writeln!(
            svg,
            r##"<polyline points="{}" fill="none" stroke="#1f77b4" stroke-width="2"/>"##,
            path.join(" ")
        );
        for point in &series.points {
            let _ = writeln!(
                svg,
                r##"<circle cx="{:.1}" cy="{:.1}" r="4" fill="#1f77b4"><title>{}: {} bytes</title></circle>"##,
                to_x(point.timestamp_secs),
                to_y(point.total_size),
                point.timestamp_secs,
                point.total_size
            );
        }
        let _ = writeln!(
            svg,
            r#"<text x="{MARGIN_LEFT}" y="{}" font-size="12">{}</text>"#,
            HEIGHT - 35.0,
            min_x
        );
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="end" font-size="12">{}</text>"#,
            MARGIN_LEFT + plot_width,
            HEIGHT - 35.0,
            max_x
        );
    }

    let peak_y = to_y(series.peak_total);
    let _ = writeln!(
        svg,
        r#"<line x1="{MARGIN_LEFT}" y1="{peak_y:.1}" x2="{}" y2="{peak_y:.1}" stroke="red" stroke-dasharray="8,6"/>"#,
        MARGIN_LEFT + plot_width
    );
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="{:.1}" text-anchor="end" font-size="12" fill="red">Max Size Ever: {} bytes</text>"#,
        MARGIN_LEFT + plot_width,
        peak_y - 6.0,
        series.peak_total
    );
    svg.push_str("</svg>\n");
    svg
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
