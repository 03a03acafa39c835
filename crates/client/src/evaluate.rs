//! Expression evaluation: variable scanning, evaluation requests, history.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::codegen::CodeGenerator;
use crate::error::EvaluateError;

/// Piece of an expression: raw code or a `$name` net variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Code(String),
    Variable(String),
}

/// A user expression split into code and net-variable references.
///
/// Variables are written `$name`. A `$` inside a string or character
/// literal is text, not a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    text: String,
    segments: Vec<Segment>,
}

impl Expression {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut code = String::new();
        let mut quote: Option<char> = None;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match quote {
                Some(q) => {
                    code.push(c);
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            code.push(escaped);
                        }
                    } else if c == q {
                        quote = None;
                    }
                }
                None if c == '"' || c == '\'' => {
                    quote = Some(c);
                    code.push(c);
                }
                None if c == '$' && chars.peek().is_some_and(|n| is_ident_start(*n)) => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if !is_ident_continue(n) {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    if !code.is_empty() {
                        segments.push(Segment::Code(std::mem::take(&mut code)));
                    }
                    segments.push(Segment::Variable(name));
                }
                None => code.push(c),
            }
        }
        if !code.is_empty() {
            segments.push(Segment::Code(code));
        }

        Self { text: text.to_string(), segments }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Referenced variable names, in order of first use.
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Variable(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn references_variables(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Variable(_)))
    }

    /// Rebuild the expression with each variable replaced by `access(name)`.
    pub fn render_with(&self, access: impl Fn(&str) -> String) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Code(code) => code.clone(),
                Segment::Variable(name) => access(name),
            })
            .collect()
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Recently evaluated expressions, most recent first, without duplicates.
#[derive(Debug, Clone, Default)]
pub struct LastEvaluations {
    entries: Vec<String>,
}

impl LastEvaluations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `expression` to the front.
    pub fn record(&mut self, expression: &str) {
        self.entries.retain(|e| e != expression);
        self.entries.insert(0, expression.to_string());
    }

    pub fn most_recent(&self) -> Option<&str> {
        self.entries.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One in-flight evaluation: the rendered stub on disk and where its
/// artifact goes.
#[derive(Debug)]
pub struct EvaluationRequest {
    pub expression: Expression,
    pub aux: Option<String>,
    pub source_path: PathBuf,
    pub artifact_path: PathBuf,
}

impl EvaluationRequest {
    /// Render the stub for `expression` into a fresh file under `dir`.
    pub fn prepare(
        expression: Expression,
        aux: Option<&str>,
        dir: &Path,
        codegen: &dyn CodeGenerator,
    ) -> Result<Self, EvaluateError> {
        let source = codegen
            .render_evaluator(&expression, aux)
            .map_err(EvaluateError::Render)?;

        let stem = format!("petri-eval-{}", uuid::Uuid::new_v4().simple());
        let source_path = dir.join(format!("{}.{}", stem, codegen.source_extension()));
        let mut artifact_path = dir.join(format!("{}-lib", stem));
        artifact_path.set_extension(codegen.artifact_extension());

        fs::create_dir_all(dir)?;
        fs::write(&source_path, source)?;

        Ok(Self { expression, aux: aux.map(str::to_string), source_path, artifact_path })
    }

    /// The expression as typed, with its format when one was given.
    pub fn describe(&self) -> String {
        match &self.aux {
            Some(aux) => format!("{} | {}", self.expression.text(), aux),
            None => self.expression.text().to_string(),
        }
    }

    /// The path shipped in `evaluate{lib}`.
    pub fn lib(&self) -> String {
        self.artifact_path.to_string_lossy().into_owned()
    }

    pub fn remove_source(&self) {
        remove_quietly(&self.source_path);
    }

    /// Remove both files (compile failure, send failure).
    pub fn discard(&self) {
        self.remove_source();
        remove_quietly(&self.artifact_path);
    }
}

/// Delete a temporary file, logging anything but "not found".
pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Cannot remove {}: {}", path.display(), e),
    }
}
