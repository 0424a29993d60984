use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sweep_core::{canonical_json_digest, ensure_dir};
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("model scan failed: {0}")]
    Scan(String),

    #[error("parameter space is missing declared parameter {section}.{name}")]
    Space { section: String, name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dataset corrupt: {0}")]
    Dataset(String),

    #[error("result already recorded for {0}")]
    DuplicateResult(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDeclaration {
    pub section: String,
    pub name: String,
    pub default: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub section: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub entries: Vec<AssignmentEntry>,
}

impl Assignment {
    pub fn value_of(&self, section: &str, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.section == section && e.name == name)
            .map(|e| e.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub assignment: Assignment,
    pub query: Query,
    pub identity: String,
}

impl Task {
    pub fn new(assignment: Assignment, query: Query) -> Self {
        let identity = task_identity(&assignment, &query);
        Self {
            assignment,
            query,
            identity,
        }
    }
}

/// Identity is computed over sorted assignment triples, so the digest does not
/// depend on entry order or on which process built the assignment.
pub fn task_identity(assignment: &Assignment, query: &Query) -> String {
    let mut triples: Vec<[&str; 3]> = assignment
        .entries
        .iter()
        .map(|e| [e.section.as_str(), e.name.as_str(), e.value.as_str()])
        .collect();
    triples.sort();
    canonical_json_digest(&json!({
        "assignment": triples,
        "query": { "index": query.index, "text": query.text },
    }))
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub text: String,
    span: (usize, usize),
}

#[derive(Debug, Clone)]
pub struct SectionMap {
    sections: Vec<Section>,
}

impl SectionMap {
    pub fn parse(model_text: &str) -> Result<Self> {
        let template_re =
            Regex::new(r"(?s)<template\b[^>]*>.*?</template>").expect("template regex is valid");
        let decl_re = Regex::new(r"(?s)<declaration\b[^>]*>(.*?)</declaration>")
            .expect("declaration regex is valid");
        let name_re = Regex::new(r"(?s)<name\b[^>]*>(.*?)</name>").expect("name regex is valid");
        let system_re =
            Regex::new(r"(?s)<system\b[^>]*>(.*?)</system>").expect("system regex is valid");

        let template_spans: Vec<(usize, usize)> = template_re
            .find_iter(model_text)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut sections = Vec::new();

        // Top-level declaration block, skipping any that belong to a template.
        for caps in decl_re.captures_iter(model_text) {
            if let Some(body) = caps.get(1) {
                let inside_template = template_spans
                    .iter()
                    .any(|&(start, end)| body.start() >= start && body.end() <= end);
                if !inside_template {
                    sections.push(Section {
                        name: "project".to_string(),
                        text: body.as_str().to_string(),
                        span: (body.start(), body.end()),
                    });
                    break;
                }
            }
        }

        for tm in template_re.find_iter(model_text) {
            let body = &model_text[tm.start()..tm.end()];
            let name = match name_re.captures(body).and_then(|c| c.get(1)) {
                Some(m) => m.as_str().trim().to_string(),
                None => continue,
            };
            if name.is_empty() {
                continue;
            }
            if let Some(decl) = decl_re.captures(body).and_then(|c| c.get(1)) {
                sections.push(Section {
                    name,
                    text: decl.as_str().to_string(),
                    span: (tm.start() + decl.start(), tm.start() + decl.end()),
                });
            }
        }

        if let Some(body) = system_re.captures(model_text).and_then(|c| c.get(1)) {
            sections.push(Section {
                name: "system".to_string(),
                text: body.as_str().to_string(),
                span: (body.start(), body.end()),
            });
        }

        if sections.is_empty() {
            return Err(Error::Scan(
                "no declaration sections found in model text".to_string(),
            ));
        }
        Ok(Self { sections })
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }
}

/// Lazily walks section text in document order and yields one declaration per
/// `@param`-annotated assignment line. Restartable: call again for a fresh pass.
pub fn param_markers<'a>(
    sections: &'a SectionMap,
) -> impl Iterator<Item = ParameterDeclaration> + 'a {
    sections.iter().flat_map(|section| {
        section
            .text
            .lines()
            .enumerate()
            .filter_map(move |(line_idx, line)| {
                if !line.contains("@param") {
                    return None;
                }
                let stmt = line.split(';').next()?;
                let (lhs, rhs) = stmt.split_once('=')?;
                let name = lhs.split_whitespace().last()?.to_string();
                if name.is_empty() {
                    return None;
                }
                Some(ParameterDeclaration {
                    section: section.name.clone(),
                    name,
                    default: rhs.trim().to_string(),
                    line: line_idx + 1,
                })
            })
    })
}

/// Declarations in document order, first occurrence wins per (section, name).
pub fn scan_declarations(sections: &SectionMap) -> Vec<ParameterDeclaration> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for decl in param_markers(sections) {
        if seen.insert((decl.section.clone(), decl.name.clone())) {
            out.push(decl);
        }
    }
    out
}

pub fn suggested_space(
    declarations: &[ParameterDeclaration],
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for decl in declarations {
        out.entry(decl.section.clone())
            .or_default()
            .insert(decl.name.clone(), decl.default.clone());
    }
    out
}

pub type ResolvedSpace = BTreeMap<String, BTreeMap<String, Vec<String>>>;

pub fn resolve_space(
    vars: &BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
) -> ResolvedSpace {
    vars.iter()
        .map(|(section, entries)| {
            (
                section.clone(),
                entries
                    .iter()
                    .map(|(name, value)| (name.clone(), candidate_values(value)))
                    .collect(),
            )
        })
        .collect()
}

/// Candidate lists come in as a YAML sequence, a `range(a,b[,step])` or
/// `list(...)` spec string, or a single scalar. Plain strings stay single
/// values; instantiation expressions like `Sender(q, X0)` contain commas.
pub fn candidate_values(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::Sequence(items) => items.iter().map(scalar_text).collect(),
        serde_yaml::Value::String(s) => parse_value_spec(s),
        other => vec![scalar_text(other)],
    }
}

fn scalar_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

fn parse_value_spec(spec: &str) -> Vec<String> {
    let spec = spec.trim();
    let range_re = Regex::new(r"^range\((\d+)\s*,\s*(\d+)(?:\s*,\s*(\d+))?\)$")
        .expect("range spec regex is valid");
    if let Some(caps) = range_re.captures(spec) {
        let start: u64 = caps[1].parse().unwrap_or(0);
        let end: u64 = caps[2].parse().unwrap_or(0);
        let step: u64 = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1)
            .max(1);
        let mut out = Vec::new();
        let mut v = start;
        while v < end {
            out.push(v.to_string());
            v += step;
        }
        return out;
    }
    let list_re = Regex::new(r"^list\((.*)\)$").expect("list spec regex is valid");
    if let Some(caps) = list_re.captures(spec) {
        return caps[1]
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
    }
    vec![spec.to_string()]
}

/// Axes follow scanner discovery order; candidates keep their given order; the
/// last axis varies fastest. Two runs over the same inputs enumerate the same
/// assignments in the same positions.
pub fn build_assignments(
    declarations: &[ParameterDeclaration],
    space: &ResolvedSpace,
) -> Result<Vec<Assignment>> {
    let declared: HashSet<(&str, &str)> = declarations
        .iter()
        .map(|d| (d.section.as_str(), d.name.as_str()))
        .collect();
    for (section, entries) in space {
        for name in entries.keys() {
            if !declared.contains(&(section.as_str(), name.as_str())) {
                warn!(
                    section = %section,
                    name = %name,
                    "parameter space entry has no declaration in the model; ignoring"
                );
            }
        }
    }

    let mut axes: Vec<(&ParameterDeclaration, &Vec<String>)> = Vec::new();
    for decl in declarations {
        match space.get(&decl.section).and_then(|m| m.get(&decl.name)) {
            Some(values) => axes.push((decl, values)),
            None => {
                return Err(Error::Space {
                    section: decl.section.clone(),
                    name: decl.name.clone(),
                })
            }
        }
    }
    if axes.is_empty() || axes.iter().any(|(_, values)| values.is_empty()) {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut idx = vec![0usize; axes.len()];
    loop {
        let entries = axes
            .iter()
            .zip(idx.iter())
            .map(|((decl, values), &i)| AssignmentEntry {
                section: decl.section.clone(),
                name: decl.name.clone(),
                value: values[i].clone(),
            })
            .collect();
        out.push(Assignment { entries });

        let mut pos = axes.len();
        loop {
            if pos == 0 {
                return Ok(out);
            }
            pos -= 1;
            idx[pos] += 1;
            if idx[pos] < axes[pos].1.len() {
                break;
            }
            idx[pos] = 0;
        }
    }
}

pub fn load_queries(path: &Path) -> Result<Vec<Query>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read queries {}: {}", path.display(), e)))?;
    Ok(queries_from_text(&text))
}

pub fn queries_from_text(text: &str) -> Vec<Query> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        out.push(Query {
            index: out.len(),
            text: line.to_string(),
        });
    }
    out
}

pub fn build_tasks(assignments: &[Assignment], queries: &[Query]) -> Vec<Task> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for assignment in assignments {
        for query in queries {
            let task = Task::new(assignment.clone(), query.clone());
            if seen.insert(task.identity.clone()) {
                out.push(task);
            } else {
                warn!(identity = %task.identity, "duplicate task identity in plan; keeping first");
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Timeout,
    EngineError,
    MalformedOutput,
}

impl TaskStatus {
    pub fn is_success(self) -> bool {
        self == TaskStatus::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRow {
    pub identity: String,
    pub assignment: Vec<AssignmentEntry>,
    pub query_index: usize,
    pub query_text: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    pub recorded_at: String,
}

#[derive(Debug)]
pub struct Dataset {
    path: PathBuf,
    file: fs::File,
    index: HashSet<String>,
}

impl Dataset {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
        let index = load_index(path)?;
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains(identity)
    }

    /// Appends one row and syncs it to disk before the identity becomes
    /// visible in the index. Duplicate identities are rejected unless force
    /// mode appends a superseding row (the loader keeps the last occurrence).
    pub fn merge(&mut self, row: &DatasetRow, force: bool) -> Result<()> {
        if self.index.contains(&row.identity) && !force {
            return Err(Error::DuplicateResult(row.identity.clone()));
        }
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.index.insert(row.identity.clone());
        Ok(())
    }

    pub fn merge_all<'a>(
        &mut self,
        rows: impl IntoIterator<Item = &'a DatasetRow>,
        force: bool,
    ) -> Result<usize> {
        let mut merged = 0;
        for row in rows {
            match self.merge(row, force) {
                Ok(()) => merged += 1,
                Err(Error::DuplicateResult(identity)) => {
                    warn!(%identity, "result already recorded; keeping the stored row");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }
}

#[derive(Deserialize)]
struct IndexRow {
    identity: String,
}

fn load_index(path: &Path) -> Result<HashSet<String>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };
    let line_count = text.lines().count();
    let mut index = HashSet::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRow>(line) {
            Ok(row) => {
                index.insert(row.identity);
            }
            Err(err) if i + 1 == line_count => {
                warn!(
                    line = i + 1,
                    %err,
                    "dataset ends with an unparsable row; treating it as a truncated write"
                );
            }
            Err(err) => {
                return Err(Error::Dataset(format!("row {}: {}", i + 1, err)));
            }
        }
    }
    Ok(index)
}

/// Full rows for downstream consumers, last occurrence winning per identity.
pub fn load_rows(path: &Path) -> Result<Vec<DatasetRow>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "dataset not found: {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    let line_count = text.lines().count();
    let mut rows: Vec<DatasetRow> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DatasetRow>(line) {
            Ok(row) => match position.get(&row.identity) {
                Some(&at) => rows[at] = row,
                None => {
                    position.insert(row.identity.clone(), rows.len());
                    rows.push(row);
                }
            },
            Err(err) if i + 1 == line_count => {
                warn!(
                    line = i + 1,
                    %err,
                    "dataset ends with an unparsable row; treating it as a truncated write"
                );
            }
            Err(err) => {
                return Err(Error::Dataset(format!("row {}: {}", i + 1, err)));
            }
        }
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

pub trait Checker: Sync {
    fn run(&self, task: &Task) -> std::io::Result<Invocation>;
}

/// Spawns the command with captured output and enforces the timeout by
/// killing the child once the deadline passes. Partial output captured before
/// the kill is preserved for the result row.
pub fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> std::io::Result<Invocation> {
    let start = Instant::now();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let timed_out = match timeout {
        Some(limit) => child.wait_timeout(limit)?.is_none(),
        None => false,
    };
    if timed_out {
        let _ = child.kill();
    }
    let output = child.wait_with_output()?;
    let duration = start.elapsed();

    Ok(Invocation {
        exit_code: if timed_out { None } else { output.status.code() },
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration,
        timed_out,
    })
}

pub struct VerifytaChecker {
    binary: PathBuf,
    model_text: String,
    sections: SectionMap,
    scratch_dir: PathBuf,
    seed: u64,
    timeout: Option<Duration>,
}

impl VerifytaChecker {
    pub fn new(
        binary: PathBuf,
        model_text: String,
        sections: SectionMap,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            binary,
            model_text,
            sections,
            scratch_dir,
            seed: 0,
            timeout: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Checker for VerifytaChecker {
    fn run(&self, task: &Task) -> std::io::Result<Invocation> {
        ensure_dir(&self.scratch_dir)?;
        let tag = short_identity(&task.identity);
        let model_path = self.scratch_dir.join(format!("model_{}.xml", tag));
        let query_path = self.scratch_dir.join(format!("query_{}.q", tag));
        fs::write(
            &model_path,
            apply_assignment(&self.model_text, &self.sections, &task.assignment),
        )?;
        fs::write(&query_path, format!("{}\n", task.query.text))?;

        let mut cmd = Command::new(&self.binary);
        if self.seed != 0 {
            cmd.arg("--seed").arg(self.seed.to_string());
        }
        cmd.arg(&model_path).arg(&query_path);
        let result = run_with_timeout(cmd, self.timeout);

        let _ = fs::remove_file(&model_path);
        let _ = fs::remove_file(&query_path);
        result
    }
}

fn short_identity(identity: &str) -> &str {
    let hex = identity.strip_prefix("sha256:").unwrap_or(identity);
    &hex[..hex.len().min(12)]
}

/// Rewrites `name = value;` statements inside each section's declaration
/// block, leaving every other section untouched.
pub fn apply_assignment(
    model_text: &str,
    sections: &SectionMap,
    assignment: &Assignment,
) -> String {
    let mut by_section: BTreeMap<&str, Vec<&AssignmentEntry>> = BTreeMap::new();
    for entry in &assignment.entries {
        by_section
            .entry(entry.section.as_str())
            .or_default()
            .push(entry);
    }

    let mut edits: Vec<((usize, usize), String)> = Vec::new();
    for (name, entries) in by_section {
        let section = match sections.get(name) {
            Some(section) => section,
            None => continue,
        };
        let mut body = section.text.clone();
        for entry in entries {
            let pattern = format!(r"\b{}\s*=\s*[^;]*;", regex::escape(&entry.name));
            if let Ok(re) = Regex::new(&pattern) {
                let replacement = format!("{} = {};", entry.name, entry.value);
                body = re
                    .replace_all(&body, regex::NoExpand(&replacement))
                    .into_owned();
            }
        }
        edits.push((section.span, body));
    }
    edits.sort_by_key(|(span, _)| span.0);

    let mut out = String::with_capacity(model_text.len());
    let mut cursor = 0usize;
    for ((start, end), body) in edits {
        out.push_str(&model_text[cursor..start]);
        out.push_str(&body);
        cursor = end;
    }
    out.push_str(&model_text[cursor..]);
    out
}

/// Structural capture of verifyta stdout: formula verdicts and `(t, v)`
/// data-point traces. Returns None when no formula marker is present.
pub fn parse_engine_output(stdout: &str) -> Option<Value> {
    let formula_re = Regex::new(r"Verifying formula (\d+)").expect("formula regex is valid");
    let point_re = Regex::new(r"\(([^,()]+),\s*([^)]+)\)").expect("data point regex is valid");

    let mut formulas: Vec<Value> = Vec::new();
    let mut data_points: Vec<serde_json::Map<String, Value>> = Vec::new();
    for raw in stdout.lines() {
        let line = raw.trim();
        if let Some(caps) = formula_re.captures(line) {
            let number = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            formulas.push(json!({ "number": number, "satisfied": Value::Null }));
            data_points.push(serde_json::Map::new());
        } else if line.contains("-- Formula is satisfied") {
            if let Some(last) = formulas.last_mut() {
                last["satisfied"] = json!(true);
            }
        } else if line.contains("-- Formula is not satisfied")
            || line.contains("-- Formula is NOT satisfied")
        {
            if let Some(last) = formulas.last_mut() {
                last["satisfied"] = json!(false);
            }
        } else if line.starts_with('[') && !data_points.is_empty() {
            if let Some((var, points_str)) = line.split_once(':') {
                let points: Vec<Value> = point_re
                    .captures_iter(points_str)
                    .map(|c| json!([num_or_string(c[1].trim()), num_or_string(c[2].trim())]))
                    .collect();
                if !points.is_empty() {
                    if let Some(last) = data_points.last_mut() {
                        last.insert(var.trim().to_string(), Value::Array(points));
                    }
                }
            }
        }
    }

    if formulas.is_empty() {
        return None;
    }
    let satisfied_count = formulas
        .iter()
        .filter(|f| f["satisfied"] == json!(true))
        .count();
    Some(json!({
        "formulas": formulas,
        "data_points": data_points,
        "satisfied_count": satisfied_count,
    }))
}

fn num_or_string(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    json!(s)
}

pub fn classify(invocation: &Invocation) -> (TaskStatus, Option<Value>) {
    if invocation.timed_out {
        return (TaskStatus::Timeout, None);
    }
    if invocation.exit_code != Some(0) {
        return (TaskStatus::EngineError, None);
    }
    match parse_engine_output(&invocation.stdout) {
        Some(metrics) => (TaskStatus::Success, Some(metrics)),
        None => (TaskStatus::MalformedOutput, None),
    }
}

#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    remaining: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub remaining: usize,
}

impl Progress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    pub threads: usize,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

struct TaskOutcome {
    task: Task,
    status: TaskStatus,
    duration: Duration,
    stdout: String,
    stderr: String,
    metrics: Option<Value>,
}

impl TaskOutcome {
    fn into_row(self) -> DatasetRow {
        DatasetRow {
            identity: self.task.identity,
            assignment: self.task.assignment.entries,
            query_index: self.task.query.index,
            query_text: self.task.query.text,
            status: self.status,
            duration_ms: self.duration.as_millis() as u64,
            stdout: self.stdout,
            stderr: self.stderr,
            metrics: self.metrics,
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

fn run_one<C: Checker>(checker: &C, task: Task) -> TaskOutcome {
    let started = Instant::now();
    match checker.run(&task) {
        Ok(invocation) => {
            let (status, metrics) = classify(&invocation);
            TaskOutcome {
                status,
                duration: invocation.duration,
                stdout: invocation.stdout,
                stderr: invocation.stderr,
                metrics,
                task,
            }
        }
        Err(err) => TaskOutcome {
            status: TaskStatus::EngineError,
            duration: started.elapsed(),
            stdout: String::new(),
            stderr: format!("failed to invoke checking engine: {}", err),
            metrics: None,
            task,
        },
    }
}

/// Runs every task whose identity is not yet recorded, with at most
/// `threads` concurrent engine invocations. Workers only pull from the queue
/// and emit outcomes; the single merge loop below is the only dataset writer.
/// A stop request halts dequeuing, lets in-flight tasks finish or time out,
/// and every completed outcome is merged and flushed before returning.
pub fn execute_tasks<C: Checker>(
    checker: &C,
    tasks: Vec<Task>,
    dataset: &mut Dataset,
    options: &ScheduleOptions,
    progress: &Progress,
    stop: &StopHandle,
) -> Result<RunSummary> {
    let mut pending: VecDeque<Task> = VecDeque::new();
    for task in tasks {
        if !options.force && dataset.contains(&task.identity) {
            progress.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            pending.push_back(task);
        }
    }
    progress.remaining.store(pending.len(), Ordering::Relaxed);
    info!(
        pending = pending.len(),
        skipped = progress.skipped.load(Ordering::Relaxed),
        "scheduling tasks"
    );
    if pending.is_empty() {
        return Ok(summary_from(progress));
    }

    let workers = options.threads.max(1).min(pending.len());
    let queue = Mutex::new(pending);
    let (tx, rx) = mpsc::channel::<TaskOutcome>();
    let mut write_error: Option<Error> = None;

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || loop {
                if stop.is_stopped() {
                    break;
                }
                let task = match queue.lock() {
                    Ok(mut guard) => guard.pop_front(),
                    Err(_) => break,
                };
                let task = match task {
                    Some(task) => task,
                    None => break,
                };
                let outcome = run_one(checker, task);
                if tx.send(outcome).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for outcome in rx {
            progress.remaining.fetch_sub(1, Ordering::Relaxed);
            if outcome.status.is_success() {
                progress.completed.fetch_add(1, Ordering::Relaxed);
            } else {
                progress.failed.fetch_add(1, Ordering::Relaxed);
            }
            if write_error.is_some() {
                continue;
            }
            let row = outcome.into_row();
            match dataset.merge(&row, options.force) {
                Ok(()) => {
                    let snap = progress.snapshot();
                    debug!(
                        identity = %row.identity,
                        status = ?row.status,
                        remaining = snap.remaining,
                        "merged result"
                    );
                }
                Err(Error::DuplicateResult(identity)) => {
                    warn!(%identity, "result already recorded; keeping the stored row");
                }
                Err(err) => {
                    stop.request_stop();
                    write_error = Some(err);
                }
            }
        }
    });

    match write_error {
        Some(err) => Err(err),
        None => Ok(summary_from(progress)),
    }
}

fn summary_from(progress: &Progress) -> RunSummary {
    let snap = progress.snapshot();
    RunSummary {
        completed: snap.completed,
        skipped: snap.skipped,
        failed: snap.failed,
        total: snap.completed + snap.skipped + snap.failed,
    }
}

fn default_threads() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub model: Option<PathBuf>,
    #[serde(default)]
    pub queries: Option<PathBuf>,
    #[serde(default)]
    pub vars: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub experiment_data: Option<PathBuf>,
    #[serde(default)]
    pub verifyta: Option<PathBuf>,
    #[serde(default)]
    pub plots: Vec<PlotSpec>,
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotSpec {
    pub name: String,
    #[serde(default)]
    pub query: usize,
    pub metric: String,
}

/// The `--get-params` surface: scan the model and render the declaration set
/// as a vars template ready to paste into the config.
pub fn get_params_template(config: &SweepConfig) -> Result<String> {
    let model_path = config
        .model
        .as_ref()
        .ok_or_else(|| Error::Config("model must be set".to_string()))?;
    let model_text = fs::read_to_string(model_path)
        .map_err(|e| Error::Config(format!("cannot read model {}: {}", model_path.display(), e)))?;
    let sections = SectionMap::parse(&model_text)?;
    let declarations = scan_declarations(&sections);
    let mut wrapper = BTreeMap::new();
    wrapper.insert("vars", suggested_space(&declarations));
    Ok(serde_yaml::to_string(&wrapper)?)
}

pub fn run_sweep(
    config: &SweepConfig,
    force: bool,
    stop: &StopHandle,
    progress: &Progress,
) -> Result<RunSummary> {
    let model_path = config
        .model
        .as_ref()
        .ok_or_else(|| Error::Config("model must be set".to_string()))?;
    let queries_path = config
        .queries
        .as_ref()
        .ok_or_else(|| Error::Config("queries must be set".to_string()))?;
    let dataset_path = config
        .experiment_data
        .as_ref()
        .ok_or_else(|| Error::Config("experiment_data must be set".to_string()))?;

    let model_text = fs::read_to_string(model_path)
        .map_err(|e| Error::Config(format!("cannot read model {}: {}", model_path.display(), e)))?;
    let sections = SectionMap::parse(&model_text)?;
    let declarations = scan_declarations(&sections);
    let space = resolve_space(&config.vars);
    let assignments = build_assignments(&declarations, &space)?;
    let queries = load_queries(queries_path)?;
    if queries.is_empty() {
        return Err(Error::Config(format!(
            "no queries found in {}",
            queries_path.display()
        )));
    }
    let tasks = build_tasks(&assignments, &queries);
    info!(
        assignments = assignments.len(),
        queries = queries.len(),
        tasks = tasks.len(),
        "sweep plan ready"
    );

    let mut dataset = Dataset::open(dataset_path)?;
    let scratch_dir = match dataset_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("tmp"),
        _ => PathBuf::from("tmp"),
    };
    let binary = config
        .verifyta
        .clone()
        .unwrap_or_else(|| PathBuf::from("verifyta"));
    let checker = VerifytaChecker::new(binary, model_text, sections, scratch_dir)
        .with_seed(config.seed)
        .with_timeout(config.timeout_secs.map(Duration::from_secs));

    let options = ScheduleOptions {
        threads: config.threads,
        force,
    };
    execute_tasks(&checker, tasks, &mut dataset, &options, progress, stop)
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub identity: String,
    pub assignment: Vec<AssignmentEntry>,
    pub value: f64,
}

/// One numeric value per successful row of the selected query: either the
/// satisfied-formula count or the last recorded value of a named data-point
/// trace, which is what the downstream plot tooling consumes.
pub fn plot_series(rows: &[DatasetRow], spec: &PlotSpec) -> Vec<SeriesPoint> {
    let mut out = Vec::new();
    for row in rows {
        if row.status != TaskStatus::Success || row.query_index != spec.query {
            continue;
        }
        let metrics = match &row.metrics {
            Some(metrics) => metrics,
            None => continue,
        };
        if let Some(value) = metric_value(metrics, &spec.metric) {
            out.push(SeriesPoint {
                identity: row.identity.clone(),
                assignment: row.assignment.clone(),
                value,
            });
        }
    }
    out
}

fn metric_value(metrics: &Value, metric: &str) -> Option<f64> {
    if metric == "satisfied_count" {
        return metrics.get("satisfied_count").and_then(Value::as_f64);
    }
    let traces = metrics.get("data_points")?.as_array()?;
    for per_formula in traces {
        if let Some(points) = per_formula.get(metric).and_then(Value::as_array) {
            if let Some(last) = points.last().and_then(Value::as_array) {
                if let Some(v) = last.get(1).and_then(Value::as_f64) {
                    return Some(v);
                }
            }
        }
    }
    None
}

pub fn export_plot_csv(
    dataset_path: &Path,
    rows: &[DatasetRow],
    spec: &PlotSpec,
) -> Result<PathBuf> {
    let series = plot_series(rows, spec);
    let out_path = dataset_path.with_file_name(format!("{}.csv", spec.name.replace(' ', "_")));
    let mut out = String::new();
    let columns: Vec<String> = series
        .first()
        .map(|point| {
            point
                .assignment
                .iter()
                .map(|e| format!("{}.{}", e.section, e.name))
                .collect()
        })
        .unwrap_or_default();
    for column in &columns {
        out.push_str(column);
        out.push(',');
    }
    out.push_str(&spec.metric);
    out.push('\n');
    for point in &series {
        for entry in &point.assignment {
            out.push_str(&csv_field(&entry.value));
            out.push(',');
        }
        out.push_str(&point.value.to_string());
        out.push('\n');
    }
    fs::write(&out_path, out)?;
    Ok(out_path)
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
