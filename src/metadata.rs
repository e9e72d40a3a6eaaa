//! OME-NGFF multiscale and rendering metadata.
//!
//! Zarr V2 groups get NGFF 0.4 attributes (`multiscales` and `omero` at the top
//! level); Zarr V3 groups get NGFF 0.5 attributes nested under `ome`.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    dtype::PixelType,
    scale::{C, NDIM, ScalePlan, Z},
};

/// The kind of a dimension, as understood by NGFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    Time,
    Channel,
    Space,
}

impl FromStr for AxisKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "time" => Ok(Self::Time),
            "channel" => Ok(Self::Channel),
            "space" => Ok(Self::Space),
            other => Err(Error::invalid_option(
                "axis_types",
                format!("unknown axis type {other:?}"),
            )),
        }
    }
}

/// Description of one output axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisSpec {
    pub name: String,
    pub kind: AxisKind,
    pub unit: Option<String>,
    /// Physical size of one level-0 pixel; only used for space axes.
    pub physical_size: f64,
}

impl AxisSpec {
    pub fn new(name: impl Into<String>, kind: AxisKind, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            kind,
            unit: unit.map(str::to_owned),
            physical_size: 1.0,
        }
    }

    /// `t`/time/second, `c`/channel, `z`, `y`, `x`/space/micrometer.
    pub fn defaults() -> [AxisSpec; NDIM] {
        [
            Self::new("t", AxisKind::Time, Some("second")),
            Self::new("c", AxisKind::Channel, None),
            Self::new("z", AxisKind::Space, Some("micrometer")),
            Self::new("y", AxisKind::Space, Some("micrometer")),
            Self::new("x", AxisKind::Space, Some("micrometer")),
        ]
    }
}

/// Display window of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f64,
    pub max: f64,
    pub start: f64,
    pub end: f64,
}

impl Window {
    /// The full representable range of `dtype`.
    pub fn for_dtype(dtype: PixelType) -> Self {
        let (min, max) = dtype.range();
        Self {
            min,
            max,
            start: min,
            end: max,
        }
    }
}

/// Rendering settings of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub label: String,
    /// Six hex digits, no leading `#`.
    pub color: String,
    pub active: bool,
    pub coefficient: f64,
    pub family: String,
    pub inverted: bool,
    pub window: Window,
}

impl ChannelSpec {
    /// A white, active, linear channel spanning the range of `dtype`.
    pub fn new(label: impl Into<String>, dtype: PixelType) -> Self {
        Self {
            label: label.into(),
            color: "FFFFFF".into(),
            active: true,
            coefficient: 1.0,
            family: "linear".into(),
            inverted: false,
            window: Window::for_dtype(dtype),
        }
    }

    /// Label used when neither the user nor the reader names channel `idx`.
    pub fn default_label(idx: usize) -> String {
        format!("Channel:{idx}")
    }
}

const NAMED_COLORS: [(&str, &str); 10] = [
    ("red", "FF0000"),
    ("green", "00FF00"),
    ("blue", "0000FF"),
    ("cyan", "00FFFF"),
    ("magenta", "FF00FF"),
    ("yellow", "FFFF00"),
    ("white", "FFFFFF"),
    ("black", "000000"),
    ("gray", "808080"),
    ("grey", "808080"),
];

/// Normalise a channel color: a name, or hex with optional `#` / `0x` prefix.
pub fn parse_color(s: &str) -> Result<String> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    if let Some((_, hex)) = NAMED_COLORS.iter().find(|(name, _)| *name == lower) {
        return Ok((*hex).to_owned());
    }
    let hex = lower
        .strip_prefix('#')
        .or_else(|| lower.strip_prefix("0x"))
        .unwrap_or(&lower);
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(hex.to_ascii_uppercase())
    } else {
        Err(Error::invalid_option(
            "channel_colors",
            format!("{s:?} is neither a known color name nor six hex digits"),
        ))
    }
}

/// On-disk Zarr format; fixes the NGFF metadata version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "FormatRepr", into = "u8")]
pub enum FormatVersion {
    V2,
    #[default]
    V3,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FormatRepr {
    Number(u8),
    Text(String),
}

impl TryFrom<FormatRepr> for FormatVersion {
    type Error = Error;

    fn try_from(value: FormatRepr) -> Result<Self> {
        match value {
            FormatRepr::Number(n) => n.to_string().parse(),
            FormatRepr::Text(s) => s.parse(),
        }
    }
}

impl From<FormatVersion> for u8 {
    fn from(value: FormatVersion) -> Self {
        match value {
            FormatVersion::V2 => 2,
            FormatVersion::V3 => 3,
        }
    }
}

impl FromStr for FormatVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches(['v', 'V']) {
            "2" => Ok(Self::V2),
            "3" => Ok(Self::V3),
            _ => Err(Error::invalid_option(
                "format",
                format!("unsupported zarr format {s:?}; expected 2 or 3"),
            )),
        }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", u8::from(*self))
    }
}

impl FormatVersion {
    pub fn ngff_version(&self) -> &'static str {
        match self {
            FormatVersion::V2 => "0.4",
            FormatVersion::V3 => "0.5",
        }
    }

    pub fn supports_sharding(&self) -> bool {
        matches!(self, FormatVersion::V3)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AxisKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CoordinateTransformation {
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub name: String,
    pub axes: Vec<Axis>,
    // highest resolution first
    pub datasets: Vec<Dataset>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub downscaling_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeroChannel {
    pub active: bool,
    pub coefficient: f64,
    pub color: String,
    pub family: String,
    pub inverted: bool,
    pub label: String,
    pub window: Window,
}

impl From<&ChannelSpec> for OmeroChannel {
    fn from(value: &ChannelSpec) -> Self {
        Self {
            active: value.active,
            coefficient: value.coefficient,
            color: value.color.clone(),
            family: value.family.clone(),
            inverted: value.inverted,
            label: value.label.clone(),
            window: value.window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderingDefaults {
    #[serde(rename = "defaultT")]
    pub default_t: u64,
    #[serde(rename = "defaultZ")]
    pub default_z: u64,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Omero {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub name: String,
    pub channels: Vec<OmeroChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdefs: Option<RenderingDefaults>,
}

/// Complete OME metadata for one multiscale image group.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub format: FormatVersion,
    pub multiscale: Multiscale,
    pub omero: Omero,
}

#[derive(Serialize, Deserialize)]
struct NgffAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    multiscales: Vec<Multiscale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    omero: Option<Omero>,
}

impl Metadata {
    /// Build metadata for a pyramid described by `plan`.
    ///
    /// Each level gets a scale transform of physical size over scale factor
    /// (space axes only; other axes use 1 over the factor) and a zero translation.
    pub fn build(
        plan: &ScalePlan,
        axes: &[AxisSpec; NDIM],
        channels: &[ChannelSpec],
        dtype: PixelType,
        format: FormatVersion,
        name: &str,
    ) -> Result<Self> {
        let n_channels = plan.level0_shape()[C] as usize;
        if channels.len() != n_channels {
            return Err(Error::ChannelCountMismatch {
                expected: n_channels,
                given: channels.len(),
            });
        }
        if !dtype.is_float() {
            let (lo, hi) = dtype.range();
            for ch in channels {
                let w = &ch.window;
                if [w.min, w.max, w.start, w.end].iter().any(|v| *v < lo || *v > hi) {
                    return Err(Error::invalid_option(
                        "channel_window",
                        format!("window of channel {:?} lies outside the {dtype} range", ch.label),
                    ));
                }
            }
        }

        let datasets = plan
            .factors()
            .iter()
            .enumerate()
            .map(|(level, factors)| {
                let scale = axes
                    .iter()
                    .zip(factors)
                    .map(|(axis, f)| match axis.kind {
                        AxisKind::Space => axis.physical_size / f,
                        _ => 1.0 / f,
                    })
                    .collect();
                Dataset {
                    path: level.to_string(),
                    coordinate_transformations: vec![
                        CoordinateTransformation::Scale { scale },
                        CoordinateTransformation::Translation {
                            translation: vec![0.0; NDIM],
                        },
                    ],
                }
            })
            .collect();

        let nested = matches!(format, FormatVersion::V3);
        let version = (!nested).then(|| format.ngff_version().to_owned());
        let multiscale = Multiscale {
            version: version.clone(),
            name: name.to_owned(),
            axes: axes
                .iter()
                .map(|a| Axis {
                    name: a.name.clone(),
                    kind: a.kind,
                    unit: a.unit.clone(),
                })
                .collect(),
            datasets,
            downscaling_type: Some("mean".into()),
            metadata: Some(serde_json::json!({
                "method": "box average",
                "dtype": dtype.name(),
            })),
        };
        let omero = Omero {
            version,
            name: name.to_owned(),
            channels: channels.iter().map(OmeroChannel::from).collect(),
            rdefs: Some(RenderingDefaults {
                default_t: 0,
                default_z: plan.level0_shape()[Z] / 2,
                model: "color".into(),
            }),
        };
        Ok(Self {
            format,
            multiscale,
            omero,
        })
    }

    /// Group attributes holding this metadata.
    pub fn to_attributes(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let attrs = NgffAttributes {
            version: None,
            multiscales: vec![self.multiscale.clone()],
            omero: Some(self.omero.clone()),
        };
        let value = match self.format {
            FormatVersion::V2 => serde_json::to_value(attrs)?,
            FormatVersion::V3 => {
                let ome = NgffAttributes {
                    version: Some(self.format.ngff_version().to_owned()),
                    ..attrs
                };
                serde_json::json!({ "ome": ome })
            }
        };
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(Error::general("attributes did not serialize to an object")),
        }
    }

    /// Parse group attributes of either NGFF flavour.
    ///
    /// Returns `None` if the attributes do not describe a multiscale image.
    pub fn from_attributes(
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<(Multiscale, Option<Omero>)> {
        let container = match attributes.get("ome") {
            Some(ome) => ome.clone(),
            None => serde_json::Value::Object(attributes.clone()),
        };
        let attrs: NgffAttributes = serde_json::from_value(container).ok()?;
        let multiscale = attrs.multiscales.into_iter().next()?;
        Some((multiscale, attrs.omero))
    }
}
