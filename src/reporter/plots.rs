//! Plotly-style figure builders used by the chart reporting calls.
//!
//! Non-finite numbers are written as the strings `"nan"`, `"inf"` and
//! `"-inf"` since JSON has no representation for them.

use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// How multiple histogram series share a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarMode {
    Stack,
    #[default]
    Group,
    Relative,
}

impl BarMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BarMode::Stack => "stack",
            BarMode::Group => "group",
            BarMode::Relative => "relative",
        }
    }
}

/// Trace drawing mode for line and scatter plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlotMode {
    #[default]
    Lines,
    Markers,
    LinesMarkers,
}

impl PlotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PlotMode::Lines => "lines",
            PlotMode::Markers => "markers",
            PlotMode::LinesMarkers => "lines+markers",
        }
    }
}

/// Titles and free-form layout shared by every chart.
#[derive(Debug, Clone, Default)]
pub struct ChartLayout {
    pub xtitle: Option<String>,
    pub ytitle: Option<String>,
    pub ztitle: Option<String>,
    pub comment: Option<String>,
    /// Deep-merged into the generated `layout` object.
    pub layout_config: Option<Value>,
}

/// One line of a line plot: `(x, y)` pairs as rows.
#[derive(Debug, Clone)]
pub struct LineSeries<'a> {
    pub name: String,
    pub data: ArrayView2<'a, f64>,
    pub labels: Option<Vec<String>>,
}

/// A table as header plus rows of cells.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

pub fn number(value: f64) -> Value {
    if value.is_nan() {
        Value::String("nan".to_string())
    } else if value.is_infinite() {
        Value::String(if value > 0.0 { "inf" } else { "-inf" }.to_string())
    } else {
        json!(value)
    }
}

fn numbers(values: ArrayView1<'_, f64>) -> Value {
    Value::Array(values.iter().copied().map(number).collect())
}

fn column(data: &ArrayView2<'_, f64>, index: usize) -> Value {
    if index < data.ncols() {
        numbers(data.column(index))
    } else {
        Value::Array(Vec::new())
    }
}

fn chart_title(title: &str, comment: Option<&str>) -> String {
    match comment {
        Some(comment) if !comment.is_empty() => format!("{title}<br><sup>{comment}</sup>"),
        _ => title.to_string(),
    }
}

fn base_layout(title: &str, layout: &ChartLayout) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "title".to_string(),
        Value::String(chart_title(title, layout.comment.as_deref())),
    );
    if let Some(xtitle) = &layout.xtitle {
        map.insert("xaxis".to_string(), json!({ "title": xtitle }));
    }
    if let Some(ytitle) = &layout.ytitle {
        map.insert("yaxis".to_string(), json!({ "title": ytitle }));
    }
    map
}

fn figure(data: Vec<Value>, mut layout: Map<String, Value>, config: &ChartLayout) -> Value {
    if let Some(extra) = &config.layout_config {
        let mut merged = Value::Object(std::mem::take(&mut layout));
        merge(&mut merged, extra);
        return json!({ "data": data, "layout": merged });
    }
    json!({ "data": data, "layout": layout })
}

/// Recursively merges `patch` into `target`; non-object values replace.
pub fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Bar chart with one trace per row of `rows` and one bar per column.
pub fn histogram(
    rows: ArrayView2<'_, f64>,
    title: &str,
    series: &str,
    labels: Option<&[String]>,
    xlabels: Option<&[String]>,
    mode: BarMode,
    layout: &ChartLayout,
) -> Value {
    let x: Value = match xlabels {
        Some(xlabels) => json!(xlabels),
        None => Value::Array((0..rows.ncols()).map(|i| json!(i)).collect()),
    };
    let data = rows
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(i, row)| {
            let name = labels
                .and_then(|labels| labels.get(i))
                .cloned()
                .unwrap_or_else(|| series.to_string());
            json!({
                "type": "bar",
                "name": name,
                "x": x.clone(),
                "y": numbers(row),
            })
        })
        .collect();

    let mut map = base_layout(title, layout);
    map.insert("barmode".to_string(), json!(mode.as_str()));
    figure(data, map, layout)
}

pub fn table(table: &Table, title: &str, series: &str, layout: &ChartLayout) -> Value {
    let columns: Vec<Value> = (0..table.header.len())
        .map(|c| {
            Value::Array(
                table
                    .rows
                    .iter()
                    .map(|row| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect();
    let data = vec![json!({
        "type": "table",
        "name": series,
        "header": { "values": table.header },
        "cells": { "values": columns },
    })];
    figure(data, base_layout(title, layout), layout)
}

pub fn line_plot(
    title: &str,
    series: &[LineSeries<'_>],
    mode: PlotMode,
    reverse_xaxis: bool,
    layout: &ChartLayout,
) -> Value {
    let data = series
        .iter()
        .map(|line| {
            let mut trace = json!({
                "type": "scatter",
                "mode": mode.as_str(),
                "name": line.name,
                "x": column(&line.data, 0),
                "y": column(&line.data, 1),
            });
            if let Some(labels) = &line.labels {
                trace["text"] = json!(labels);
            }
            trace
        })
        .collect();

    let mut map = base_layout(title, layout);
    if reverse_xaxis {
        let xaxis = map.entry("xaxis".to_string()).or_insert_with(|| json!({}));
        xaxis["autorange"] = json!("reversed");
    }
    figure(data, map, layout)
}

pub fn scatter_2d(
    data: ArrayView2<'_, f64>,
    title: &str,
    series: &str,
    mode: PlotMode,
    labels: Option<&[String]>,
    layout: &ChartLayout,
) -> Value {
    let line = LineSeries {
        name: series.to_string(),
        data,
        labels: labels.map(<[String]>::to_vec),
    };
    line_plot(title, std::slice::from_ref(&line), mode, false, layout)
}

/// 3-D scatter with one trace per `(x, y, z)` row set.
pub fn scatter_3d(
    data: &[ArrayView2<'_, f64>],
    title: &str,
    series: &[String],
    mode: PlotMode,
    labels: Option<&[String]>,
    layout: &ChartLayout,
) -> Value {
    let traces = data
        .iter()
        .enumerate()
        .map(|(i, points)| {
            let mut trace = json!({
                "type": "scatter3d",
                "mode": mode.as_str(),
                "x": column(points, 0),
                "y": column(points, 1),
                "z": column(points, 2),
            });
            if let Some(name) = series.get(i).or_else(|| series.last()) {
                trace["name"] = json!(name);
            }
            if let Some(labels) = labels {
                trace["text"] = json!(labels);
            }
            trace
        })
        .collect();
    figure(traces, scene_layout(title, layout, None), layout)
}

fn scene_layout(title: &str, layout: &ChartLayout, camera: Option<[f64; 3]>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "title".to_string(),
        Value::String(chart_title(title, layout.comment.as_deref())),
    );
    let mut scene = json!({
        "xaxis": { "title": layout.xtitle.clone().unwrap_or_default() },
        "yaxis": { "title": layout.ytitle.clone().unwrap_or_default() },
        "zaxis": { "title": layout.ztitle.clone().unwrap_or_default() },
    });
    if let Some([x, y, z]) = camera {
        scene["camera"] = json!({ "eye": { "x": x, "y": y, "z": z } });
    }
    map.insert("scene".to_string(), scene);
    map
}

fn matrix_rows(matrix: &ArrayView2<'_, f64>) -> Value {
    Value::Array(matrix.axis_iter(Axis(0)).map(numbers).collect())
}

/// Heat map, e.g. a confusion matrix.
pub fn value_matrix(
    matrix: ArrayView2<'_, f64>,
    title: &str,
    series: &str,
    xlabels: Option<&[String]>,
    ylabels: Option<&[String]>,
    yaxis_reversed: bool,
    layout: &ChartLayout,
) -> Value {
    let mut trace = json!({
        "type": "heatmap",
        "name": series,
        "z": matrix_rows(&matrix),
    });
    if let Some(xlabels) = xlabels {
        trace["x"] = json!(xlabels);
    }
    if let Some(ylabels) = ylabels {
        trace["y"] = json!(ylabels);
    }

    let mut map = base_layout(title, layout);
    if yaxis_reversed {
        let yaxis = map.entry("yaxis".to_string()).or_insert_with(|| json!({}));
        yaxis["autorange"] = json!("reversed");
    }
    figure(vec![trace], map, layout)
}

/// Surface over the same data a value matrix shows.
pub fn value_surface(
    matrix: ArrayView2<'_, f64>,
    title: &str,
    series: &str,
    xlabels: Option<&[String]>,
    ylabels: Option<&[String]>,
    camera: Option<[f64; 3]>,
    layout: &ChartLayout,
) -> Value {
    let mut trace = json!({
        "type": "surface",
        "name": series,
        "z": matrix_rows(&matrix),
    });
    if let Some(xlabels) = xlabels {
        trace["x"] = json!(xlabels);
    }
    if let Some(ylabels) = ylabels {
        trace["y"] = json!(ylabels);
    }
    let camera = camera.unwrap_or([1.0, 1.0, 1.0]);
    figure(vec![trace], scene_layout(title, layout, Some(camera)), layout)
}

/// Empty chart whose background is the image at `src`.
pub fn image_plot(src: &str, title: &str, width: u32, height: u32) -> Value {
    json!({
        "data": [],
        "layout": {
            "title": title,
            "width": width,
            "height": height,
            "xaxis": { "visible": false, "range": [0, width] },
            "yaxis": { "visible": false, "range": [0, height], "scaleanchor": "x" },
            "images": [{
                "source": src,
                "xref": "x",
                "yref": "y",
                "x": 0,
                "y": height,
                "sizex": width,
                "sizey": height,
                "sizing": "stretch",
                "layer": "below",
            }],
        },
    })
}

/// Rounds every number inside the `data` traces; `"nan"` strings become
/// `null` when `nan_as_null` is set.
pub fn normalize_traces(plot: &mut Value, round_digits: Option<u32>, nan_as_null: bool) {
    let Some(traces) = plot.get_mut("data").and_then(Value::as_array_mut) else {
        return;
    };
    for trace in traces.iter_mut().filter_map(Value::as_object_mut) {
        for value in trace.values_mut() {
            normalize_value(value, round_digits, nan_as_null);
        }
    }
}

fn normalize_value(value: &mut Value, round_digits: Option<u32>, nan_as_null: bool) {
    let replacement = match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                normalize_value(item, round_digits, nan_as_null);
            }
            return;
        }
        Value::Number(n) if n.is_f64() => match (round_digits, n.as_f64()) {
            (Some(digits), Some(v)) => json!(round_to(v, digits)),
            _ => return,
        },
        Value::String(s) if nan_as_null && s == "nan" => Value::Null,
        _ => return,
    };
    *value = replacement;
}

fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits.min(15) as i32);
    (value * scale).round() / scale
}
