use serde::{Deserialize, Serialize};

/// Fields shared by every metric record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub timestamp: i64,
    pub metric: String,
    pub variant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iter: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_event: Option<bool>,
}

/// Backend event record, tagged by its event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireRecord {
    #[serde(rename = "training_stats_scalar")]
    Scalar {
        #[serde(flatten)]
        header: MetricHeader,
        value: f64,
    },
    #[serde(rename = "training_stats_vector")]
    Vector {
        #[serde(flatten)]
        header: MetricHeader,
        values: Vec<f64>,
    },
    #[serde(rename = "plot")]
    Plot {
        #[serde(flatten)]
        header: MetricHeader,
        plot_str: String,
    },
    #[serde(rename = "training_debug_image")]
    Image {
        #[serde(flatten)]
        header: MetricHeader,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    #[serde(rename = "log")]
    Log {
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        timestamp: i64,
        level: String,
        worker: String,
        msg: String,
    },
}

impl WireRecord {
    pub fn event_type(&self) -> &'static str {
        match self {
            WireRecord::Scalar { .. } => "training_stats_scalar",
            WireRecord::Vector { .. } => "training_stats_vector",
            WireRecord::Plot { .. } => "plot",
            WireRecord::Image { .. } => "training_debug_image",
            WireRecord::Log { .. } => "log",
        }
    }

    pub fn task(&self) -> Option<&str> {
        match self {
            WireRecord::Scalar { header, .. }
            | WireRecord::Vector { header, .. }
            | WireRecord::Plot { header, .. }
            | WireRecord::Image { header, .. } => header.task.as_deref(),
            WireRecord::Log { task, .. } => task.as_deref(),
        }
    }
}
