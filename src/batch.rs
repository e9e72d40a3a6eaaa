//! Discovery and execution of many conversion jobs.
use std::{
    collections::HashMap,
    fmt,
    io::Read,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{
    Error, Result,
    convert::{
        CancelToken, ConversionJob, ConversionOptions, ConversionReport, ExecutionContext,
        default_name,
    },
    options::{OptionKey, OptionOverrides, SceneSelection},
    storage::group_key,
};

/// A source plus the options specific to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Where the job came from, e.g. `jobs.csv:3`.
    pub origin: String,
    pub source: PathBuf,
    pub overrides: OptionOverrides,
}

/// A discovered job, or the reason its description was rejected.
#[derive(Debug)]
pub enum JobEntry {
    Ready(Job),
    Rejected { origin: String, error: Error },
}

impl JobEntry {
    pub fn origin(&self) -> &str {
        match self {
            JobEntry::Ready(job) => &job.origin,
            JobEntry::Rejected { origin, .. } => origin,
        }
    }
}

/// Result of one job in a batch.
#[derive(Debug)]
pub struct JobOutcome {
    pub origin: String,
    pub source: Option<PathBuf>,
    pub result: Result<ConversionReport>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of every job, in submission order.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin_width = self
            .outcomes
            .iter()
            .map(|o| o.origin.len())
            .chain(std::iter::once("job".len()))
            .max()
            .unwrap_or(0);
        writeln!(f, "{:<7}  {:<origin_width$}  detail", "status", "job")?;
        for outcome in &self.outcomes {
            let (status, detail) = match &outcome.result {
                Ok(report) => {
                    let names: Vec<String> =
                        report.scenes.iter().map(|s| group_key(&s.name)).collect();
                    let status = if report.cancelled() { "partial" } else { "ok" };
                    (status, names.join(", "))
                }
                Err(e) => ("FAILED", e.to_string()),
            };
            writeln!(f, "{status:<7}  {:<origin_width$}  {detail}", outcome.origin)?;
        }
        write!(
            f,
            "{} job(s): {} succeeded, {} failed",
            self.outcomes.len(),
            self.succeeded(),
            self.failed()
        )
    }
}

/// The groups one job may write under its destination.
#[derive(Debug)]
struct Reservation {
    destination: PathBuf,
    /// Group names written as given.
    names: Vec<String>,
    /// Base of `<base>_<scene>` names, reserved when the number of scenes is only
    /// known once the source is open.
    scene_base: Option<String>,
}

impl Reservation {
    fn of(options: &ConversionOptions) -> Self {
        let destination = std::path::absolute(&options.destination)
            .unwrap_or_else(|_| options.destination.clone());
        let (names, scene_base) = match &options.scenes {
            SceneSelection::All => (vec![options.name.clone()], Some(options.name.clone())),
            selection => {
                let scenes = selection.distinct();
                let multi_scene = scenes.len() > 1;
                let names = scenes
                    .into_iter()
                    .map(|scene| options.output_name(scene, multi_scene))
                    .collect();
                (names, None)
            }
        };
        Self {
            destination,
            names,
            scene_base,
        }
    }

    fn claims(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
            || self
                .scene_base
                .as_deref()
                .is_some_and(|base| is_scene_name(name, base))
    }

    /// A group name both reservations could write, if any.
    fn overlap(&self, other: &Reservation) -> Option<String> {
        if self.destination != other.destination {
            return None;
        }
        let name = self
            .names
            .iter()
            .find(|n| other.claims(n))
            .or_else(|| other.names.iter().find(|n| self.claims(n)));
        match (name, &self.scene_base, &other.scene_base) {
            (Some(name), _, _) => Some(name.clone()),
            (None, Some(a), Some(b)) if a == b => Some(format!("{a}_*")),
            _ => None,
        }
    }
}

/// Whether `name` is `<base>_<scene index>`.
fn is_scene_name(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Turns job descriptions into conversions, sharing one set of default options.
#[derive(Debug, Clone, Default)]
pub struct BatchOrchestrator {
    defaults: OptionOverrides,
    context: ExecutionContext,
    cancel: CancelToken,
}

impl BatchOrchestrator {
    /// `defaults` apply to every job; per-job overrides win.
    pub fn new(defaults: OptionOverrides) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    /// Run jobs on `context`.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// One job per path, with no per-job overrides.
    pub fn from_list<P: AsRef<Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Vec<JobEntry> {
        paths
            .into_iter()
            .enumerate()
            .map(|(idx, path)| {
                JobEntry::Ready(Job {
                    origin: format!("list[{idx}]"),
                    source: path.as_ref().to_owned(),
                    overrides: OptionOverrides::default(),
                })
            })
            .collect()
    }

    /// One job per file under `root` whose name matches `pattern`, in name order.
    ///
    /// `max_depth` 0 visits only the files directly in `root`. Directories named
    /// `*.zarr` are treated as sources rather than descended into. Sources which
    /// would get the same default output name are disambiguated with their parent
    /// directories.
    pub fn from_directory(
        &self,
        root: &Path,
        max_depth: usize,
        pattern: &str,
    ) -> Result<Vec<JobEntry>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::invalid_option("pattern", e.to_string()))?;
        if !root.is_dir() {
            return Err(Error::invalid_option(
                "directory",
                format!("{} is not a directory", root.display()),
            ));
        }

        let mut found = Vec::new();
        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth + 1)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(Error::wrap)?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let is_zarr = entry.file_type().is_dir() && file_name.ends_with(".zarr");
            if is_zarr {
                walker.skip_current_dir();
            }
            if (entry.file_type().is_file() || is_zarr) && pattern.matches(&file_name) {
                found.push(entry.into_path());
            }
        }
        log::info!("found {} source(s) under {}", found.len(), root.display());

        let mut counts: HashMap<String, usize> = HashMap::new();
        for path in &found {
            *counts.entry(default_name(path)).or_default() += 1;
        }
        Ok(found
            .into_iter()
            .map(|source| {
                let mut overrides = OptionOverrides::default();
                let name = default_name(&source);
                if counts[&name] > 1 {
                    let mut parts: Vec<String> = source
                        .strip_prefix(root)
                        .unwrap_or(&source)
                        .parent()
                        .into_iter()
                        .flat_map(|p| p.components())
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    parts.push(name);
                    overrides.name = Some(parts.join("_"));
                }
                JobEntry::Ready(Job {
                    origin: source.display().to_string(),
                    source,
                    overrides,
                })
            })
            .collect())
    }

    /// Read jobs from a CSV file with a header row.
    ///
    /// The `source` column is mandatory in every row; every other column names an
    /// option. Empty cells leave the option unset. A row with a missing source or an
    /// unknown column is rejected on its own, without affecting the other rows.
    pub fn from_csv(&self, path: &Path) -> Result<Vec<JobEntry>> {
        let file = std::fs::File::open(path)?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.from_csv_reader(file, &label)
    }

    /// As [`Self::from_csv`], reading from `reader`; `label` prefixes job origins.
    pub fn from_csv_reader<R: Read>(&self, reader: R, label: &str) -> Result<Vec<JobEntry>> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let columns: Vec<Result<Option<OptionKey>>> = headers
            .iter()
            .map(|h| {
                if h.eq_ignore_ascii_case("source") {
                    Ok(None)
                } else {
                    h.parse().map(Some)
                }
            })
            .collect();

        let mut entries = Vec::new();
        for (idx, record) in rdr.records().enumerate() {
            let record = record?;
            // Header is line 1.
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(idx + 2);
            let origin = format!("{label}:{line}");
            let entry = match Self::parse_row(&headers, &columns, &record, line) {
                Ok((source, overrides)) => JobEntry::Ready(Job {
                    origin,
                    source,
                    overrides,
                }),
                Err(error) => {
                    log::warn!("{origin}: {error}");
                    JobEntry::Rejected { origin, error }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn parse_row(
        headers: &csv::StringRecord,
        columns: &[Result<Option<OptionKey>>],
        record: &csv::StringRecord,
        line: usize,
    ) -> Result<(PathBuf, OptionOverrides)> {
        let mut source = None;
        let mut overrides = OptionOverrides::default();
        for (col, header) in headers.iter().enumerate() {
            let key = match &columns[col] {
                Ok(key) => key,
                Err(_) => return Err(Error::UnknownOption(header.to_owned())),
            };
            let value = record.get(col).unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            match key {
                None => source = Some(PathBuf::from(value)),
                Some(key) => overrides.set(key.name(), value)?,
            }
        }
        let source = source.ok_or(Error::MissingSource { row: line })?;
        Ok((source, overrides))
    }

    /// Run every ready job with the default filesystem conversion.
    pub fn run_jobs(&self, jobs: Vec<JobEntry>) -> RunSummary {
        let cancel = self.cancel.clone();
        self.run_jobs_with(jobs, move |options| {
            ConversionJob::new(options.clone())
                .with_cancel(cancel.clone())
                .run()
        })
    }

    /// Run every ready job with `runner`.
    ///
    /// Each job's options are its overrides layered on the defaults. Jobs whose
    /// options fail to resolve, or which could write a group an earlier job could
    /// also write, fail without running. Destinations are compared as absolute
    /// paths, and a job converting all scenes of a source reserves both `<name>`
    /// and every `<name>_<scene>`. A failing or panicking job never stops the others.
    pub fn run_jobs_with<F>(&self, jobs: Vec<JobEntry>, runner: F) -> RunSummary
    where
        F: Fn(&ConversionOptions) -> Result<ConversionReport> + Sync + Send,
    {
        let mut reserved: Vec<Reservation> = Vec::new();
        let mut prepared: Vec<(String, Option<PathBuf>, Result<ConversionOptions>)> =
            Vec::with_capacity(jobs.len());
        for entry in jobs {
            match entry {
                JobEntry::Rejected { origin, error } => prepared.push((origin, None, Err(error))),
                JobEntry::Ready(job) => {
                    let merged = self.defaults.merged_with(&job.overrides);
                    let options =
                        ConversionOptions::resolve(&job.source, &merged).and_then(|options| {
                            let reservation = Reservation::of(&options);
                            match reserved.iter().find_map(|r| r.overlap(&reservation)) {
                                Some(name) => Err(Error::DestinationConflict(
                                    reservation
                                        .destination
                                        .join(group_key(&name))
                                        .display()
                                        .to_string(),
                                )),
                                None => {
                                    reserved.push(reservation);
                                    Ok(options)
                                }
                            }
                        });
                    prepared.push((job.origin, Some(job.source), options));
                }
            }
        }

        let outcomes = self
            .context
            .map(prepared, |(origin, source, options)| {
                let result = options.and_then(|options| {
                    std::panic::catch_unwind(AssertUnwindSafe(|| runner(&options)))
                        .unwrap_or_else(|payload| {
                            Err(Error::general(format!(
                                "job panicked: {}",
                                panic_message(payload)
                            )))
                        })
                });
                match &result {
                    Ok(report) => log::info!(
                        "{origin}: wrote {} scene(s) from {}",
                        report.scenes.len(),
                        report.source.display()
                    ),
                    Err(e) => log::error!("{origin}: {e}"),
                }
                JobOutcome {
                    origin,
                    source,
                    result,
                }
            });
        RunSummary { outcomes }
    }
}
