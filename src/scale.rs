//! Resolution of scaling intent into a validated multiscale plan.
//!
//! All shapes and factors are in TCZYX order.
use crate::{Error, Result};

/// Number of axes; always TCZYX.
pub const NDIM: usize = 5;

pub const T: usize = 0;
pub const C: usize = 1;
pub const Z: usize = 2;
pub const Y: usize = 3;
pub const X: usize = 4;

/// Extent per axis, TCZYX.
pub type Shape = [u64; NDIM];

/// Scale factor per axis relative to level 0, TCZYX.
pub type Factors = [f64; NDIM];

const IDENTITY: Factors = [1.0; NDIM];

/// How the user asked for the pyramid to be built.
///
/// The variants are mutually exclusive; use [`ScaleIntent::from_parts`]
/// to build one from independently-optional inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleIntent {
    /// Per-level, per-axis factors, level 0 first.
    Explicit(Vec<Vec<f64>>),
    /// Independent XY and Z decimation sequences, excluding level 0.
    Decimation { xy: Vec<f64>, z: Vec<f64> },
    /// A number of levels, each halving X and Y.
    Levels(usize),
}

impl Default for ScaleIntent {
    fn default() -> Self {
        Self::Levels(1)
    }
}

impl ScaleIntent {
    /// Combine the separately-specified scale inputs, rejecting combinations.
    ///
    /// XY and Z decimation may be given together; any other pairing fails
    /// with [`Error::ConflictingScaleSpec`]. Nothing given means a single level.
    pub fn from_parts(
        level_scales: Option<Vec<Vec<f64>>>,
        xy_scale: Option<Vec<f64>>,
        z_scale: Option<Vec<f64>>,
        num_levels: Option<usize>,
    ) -> Result<Self> {
        let decimation = xy_scale.is_some() || z_scale.is_some();
        let given: Vec<&str> = [
            level_scales.as_ref().map(|_| "level_scales"),
            decimation.then_some("xy_scale/z_scale"),
            num_levels.map(|_| "num_levels"),
        ]
        .into_iter()
        .flatten()
        .collect();
        if given.len() > 1 {
            return Err(Error::ConflictingScaleSpec(given.join(", ")));
        }

        if let Some(levels) = level_scales {
            Ok(Self::Explicit(levels))
        } else if decimation {
            Ok(Self::Decimation {
                xy: xy_scale.unwrap_or_default(),
                z: z_scale.unwrap_or_default(),
            })
        } else {
            Ok(Self::Levels(num_levels.unwrap_or(1)))
        }
    }

    fn candidate_levels(&self) -> Result<Vec<Factors>> {
        match self {
            ScaleIntent::Explicit(levels) => {
                if levels.is_empty() {
                    return Err(Error::InvalidScaleSpec("no levels given".into()));
                }
                levels
                    .iter()
                    .enumerate()
                    .map(|(idx, lvl)| {
                        Factors::try_from(lvl.as_slice()).map_err(|_| {
                            Error::InvalidScaleSpec(format!(
                                "level {idx} has {} factors, expected {NDIM}",
                                lvl.len()
                            ))
                        })
                    })
                    .collect()
            }
            ScaleIntent::Decimation { xy, z } => {
                if xy.is_empty() && z.is_empty() {
                    return Err(Error::InvalidScaleSpec(
                        "empty XY and Z decimation sequences".into(),
                    ));
                }
                let n_levels = 1 + xy.len().max(z.len());
                // Missing entries repeat the last factor given for that axis.
                let nearest = |seq: &[f64], idx: usize| -> f64 {
                    seq.get(idx).or_else(|| seq.last()).copied().unwrap_or(1.0)
                };
                let mut levels = vec![IDENTITY];
                for idx in 0..n_levels - 1 {
                    let xy_f = nearest(xy, idx);
                    levels.push([1.0, 1.0, nearest(z, idx), xy_f, xy_f]);
                }
                Ok(levels)
            }
            ScaleIntent::Levels(n) => {
                if *n == 0 {
                    return Err(Error::InvalidScaleSpec(
                        "number of levels must be at least 1".into(),
                    ));
                }
                Ok((0..*n)
                    .map(|k| {
                        let f = 0.5f64.powi(k as i32);
                        [1.0, 1.0, 1.0, f, f]
                    })
                    .collect())
            }
        }
    }
}

fn validate(levels: &[Factors]) -> Result<()> {
    if levels[0] != IDENTITY {
        return Err(Error::InvalidScaleSpec(format!(
            "level 0 must be full resolution, got {:?}",
            levels[0]
        )));
    }
    for (idx, lvl) in levels.iter().enumerate() {
        if let Some(f) = lvl.iter().find(|f| !(f.is_finite() && **f > 0.0 && **f <= 1.0)) {
            return Err(Error::InvalidScaleSpec(format!(
                "level {idx} has factor {f}; factors must be in (0, 1]"
            )));
        }
        if lvl[T] != 1.0 || lvl[C] != 1.0 {
            return Err(Error::InvalidScaleSpec(format!(
                "level {idx} downsamples T or C; only Z, Y and X can be downsampled"
            )));
        }
    }
    for (idx, pair) in levels.windows(2).enumerate() {
        if let Some(axis) = (0..NDIM).find(|&a| pair[1][a] > pair[0][a]) {
            return Err(Error::InvalidScaleSpec(format!(
                "factor for axis {axis} increases from level {idx} to level {}",
                idx + 1
            )));
        }
    }
    Ok(())
}

/// A validated, immutable multiscale plan for one image.
///
/// Factors are snapped so that each level is an integer box-window reduction of the
/// previous one; the stored factors are exactly those of the written data.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePlan {
    shape: Shape,
    factors: Vec<Factors>,
    windows: Vec<Shape>,
}

impl ScalePlan {
    /// Resolve `intent` against the full-resolution shape.
    pub fn resolve(intent: &ScaleIntent, level0_shape: Shape) -> Result<Self> {
        let mut levels = intent.candidate_levels()?;
        validate(&levels)?;

        // A singleton axis cannot be downsampled.
        for lvl in levels.iter_mut() {
            for (axis, f) in lvl.iter_mut().enumerate() {
                if level0_shape[axis] <= 1 {
                    *f = 1.0;
                }
            }
        }

        let mut factors = vec![IDENTITY];
        let mut windows = vec![[1; NDIM]];
        for (idx, lvl) in levels.iter().enumerate().skip(1) {
            let prev = factors[idx - 1];
            let mut window = [1u64; NDIM];
            let mut snapped = prev;
            for axis in 0..NDIM {
                let w = (prev[axis] / lvl[axis]).round().max(1.0);
                window[axis] = w as u64;
                snapped[axis] = prev[axis] / w;
                if (snapped[axis] - lvl[axis]).abs() > 1e-9 {
                    log::warn!(
                        "level {idx} axis {axis}: factor {} snapped to {} (integer window {w})",
                        lvl[axis],
                        snapped[axis]
                    );
                }
            }
            factors.push(snapped);
            windows.push(window);
        }

        let plan = Self {
            shape: level0_shape,
            factors,
            windows,
        };
        log::debug!("resolved scale plan: {:?}", plan.level_shapes());
        Ok(plan)
    }

    pub fn num_levels(&self) -> usize {
        self.factors.len()
    }

    pub fn level0_shape(&self) -> &Shape {
        &self.shape
    }

    /// Factors of every level, level 0 first.
    pub fn factors(&self) -> &[Factors] {
        &self.factors
    }

    /// Integer reduction window from level `level - 1` to `level`; all ones for level 0.
    pub fn window(&self, level: usize) -> &Shape {
        &self.windows[level]
    }

    /// Shape of each level, derived by chaining the reduction windows.
    pub fn level_shapes(&self) -> Vec<Shape> {
        let mut shapes: Vec<Shape> = Vec::with_capacity(self.num_levels());
        let mut current = self.shape;
        for window in &self.windows {
            for axis in 0..NDIM {
                current[axis] = current[axis].div_ceil(window[axis]);
            }
            shapes.push(current);
        }
        shapes
    }
}
