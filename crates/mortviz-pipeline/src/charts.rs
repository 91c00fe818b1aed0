//! Chart Spec Builder: plotly figure descriptions for each artifact kind, plus HTML rendering.

use std::collections::BTreeMap;

use askama::Template;
use mortviz_core::{ArtifactKey, ChartKind, EnrichedDataset, Metric, SeriesPoint};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

pub const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";

/// Declarative figure: plotly `data` traces and `layout`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
    pub title: String,
    pub data: JsonValue,
    pub layout: JsonValue,
}

impl ChartSpec {
    pub fn figure(&self) -> JsonValue {
        json!({ "data": self.data, "layout": self.layout })
    }
}

pub fn build_spec(key: &ArtifactKey, rows: &EnrichedDataset) -> ChartSpec {
    match key.kind() {
        ChartKind::WorldMap => world_map(key, rows),
        ChartKind::Histogram => histogram(key, rows),
        ChartKind::PerPeriodBars => per_period_bars(key, rows),
        ChartKind::CumulativeBars => cumulative_bars(key, rows),
    }
}

fn world_map(key: &ArtifactKey, rows: &EnrichedDataset) -> ChartSpec {
    let title = format!("Deaths per 100 000 population, {}", key.params().join(", "));
    let locations = rows
        .rows()
        .iter()
        .map(|r| r.reference.code.as_str())
        .collect::<Vec<_>>();
    let z = rows
        .rows()
        .iter()
        .map(|r| r.record.deaths_per_100k)
        .collect::<Vec<_>>();
    let text = rows
        .rows()
        .iter()
        .map(|r| match r.deaths_percent_of_population {
            Some(pct) => format!("{} ({pct:.5}% of population)", r.record.entity),
            None => r.record.entity.clone(),
        })
        .collect::<Vec<_>>();

    ChartSpec {
        data: json!([{
            "type": "choropleth",
            "locations": locations,
            "z": z,
            "text": text,
            "colorscale": "hot",
            "autocolorscale": false,
            "reversescale": true,
            "marker": {"line": {"color": "darkgray", "width": 0.5}},
            "colorbar": {"title": {"text": "Deaths"}}
        }]),
        layout: json!({
            "title": {"text": title},
            "geo": {
                "showframe": false,
                "showcoastlines": false,
                "projection": {"type": "equirectangular"}
            }
        }),
        title,
    }
}

fn histogram(key: &ArtifactKey, rows: &EnrichedDataset) -> ChartSpec {
    let title = format!(
        "Distribution of deaths per 100 000 population, {}",
        key.params().join(", ")
    );
    let x = rows
        .rows()
        .iter()
        .map(|r| r.record.deaths_per_100k)
        .collect::<Vec<_>>();
    ChartSpec {
        data: json!([{
            "type": "histogram",
            "x": x,
            "marker": {"color": "#b91c1c"}
        }]),
        layout: json!({
            "title": {"text": title},
            "xaxis": {"title": {"text": Metric::DeathsPer100k.label()}},
            "yaxis": {"title": {"text": "Countries"}},
            "bargap": 0.05
        }),
        title,
    }
}

fn per_period_bars(key: &ArtifactKey, rows: &EnrichedDataset) -> ChartSpec {
    let series = rows.aggregate_by_entity(key.params(), Metric::Deaths);
    let title = format!("Deaths per year: {}", key.params().join(", "));
    bar_chart(title, &series)
}

fn cumulative_bars(key: &ArtifactKey, rows: &EnrichedDataset) -> ChartSpec {
    let series = rows
        .aggregate_by_entity(key.params(), Metric::Deaths)
        .into_iter()
        .map(|(entity, points)| (entity, running_total(&points)))
        .collect::<BTreeMap<_, _>>();
    let title = format!("Cumulative deaths: {}", key.params().join(", "));
    bar_chart(title, &series)
}

fn running_total(points: &[SeriesPoint]) -> Vec<SeriesPoint> {
    let mut total = 0.0;
    points
        .iter()
        .map(|p| {
            total += p.value;
            SeriesPoint {
                year: p.year,
                value: total,
            }
        })
        .collect()
}

fn bar_chart(title: String, series: &BTreeMap<String, Vec<SeriesPoint>>) -> ChartSpec {
    let traces = series
        .iter()
        .map(|(entity, points)| {
            json!({
                "type": "bar",
                "name": entity,
                "x": points.iter().map(|p| p.year).collect::<Vec<_>>(),
                "y": points.iter().map(|p| p.value).collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();
    ChartSpec {
        data: JsonValue::Array(traces),
        layout: json!({
            "title": {"text": title},
            "barmode": "group",
            "xaxis": {"title": {"text": "Year"}, "dtick": 1},
            "yaxis": {"title": {"text": Metric::Deaths.label()}}
        }),
        title,
    }
}

/// Turns a [`ChartSpec`] into the bytes stored in the artifact cache.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, spec: &ChartSpec) -> anyhow::Result<Vec<u8>>;
}

#[derive(Template)]
#[template(path = "chart.html")]
struct ChartPageTemplate<'a> {
    title: &'a str,
    plotly_src: &'a str,
    figure_json: String,
}

/// Standalone HTML page loading plotly.js and drawing the figure on load.
#[derive(Debug, Clone)]
pub struct PlotlyHtmlRenderer {
    plotly_src: String,
}

impl Default for PlotlyHtmlRenderer {
    fn default() -> Self {
        Self {
            plotly_src: PLOTLY_CDN.to_string(),
        }
    }
}

impl PlotlyHtmlRenderer {
    pub fn with_script_src(plotly_src: impl Into<String>) -> Self {
        Self {
            plotly_src: plotly_src.into(),
        }
    }
}

impl ChartRenderer for PlotlyHtmlRenderer {
    fn render(&self, spec: &ChartSpec) -> anyhow::Result<Vec<u8>> {
        // Inline <script> content must not contain a closing tag sequence.
        let figure_json = serde_json::to_string(&spec.figure())?.replace("</", "<\\/");
        let page = ChartPageTemplate {
            title: &spec.title,
            plotly_src: &self.plotly_src,
            figure_json,
        };
        Ok(page.render()?.into_bytes())
    }
}
