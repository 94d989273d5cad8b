// Pipeline and Rules Loader
// Parses pipeline specs and version rule files, then checks them for semantic problems

use crate::execution::context::{artifact_name, sanitize_name};
use crate::execution::graph::StageGraph;
use crate::execution::matrix::MatrixExpander;
use crate::parser::error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
use crate::parser::models::*;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Parser for pipeline specs and rule files
pub struct SpecParser;

impl SpecParser {
    /// Parse a pipeline spec from YAML
    pub fn parse(content: &str) -> ParseResult<PipelineSpec> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<PipelineSpec> {
        Self::parse(&read(path.as_ref())?)
    }

    /// Parse a version rules document (`rules: [...]`)
    pub fn parse_rules(content: &str) -> ParseResult<RuleSet> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    pub fn parse_rules_file<P: AsRef<Path>>(path: P) -> ParseResult<RuleSet> {
        Self::parse_rules(&read(path.as_ref())?)
    }

    /// Parse a trigger event from JSON
    pub fn parse_event(content: &str) -> ParseResult<TriggerEvent> {
        serde_json::from_str(content).map_err(|e| {
            ParseError::new(format!("invalid event: {}", e), e.line(), e.column())
                .with_source_context(content, 1)
        })
    }

    pub fn parse_event_file<P: AsRef<Path>>(path: P) -> ParseResult<TriggerEvent> {
        Self::parse_event(&read(path.as_ref())?)
    }
}

fn read(path: &Path) -> ParseResult<String> {
    fs::read_to_string(path).map_err(|e| {
        ParseError::io(format!("failed to read {}: {}", path.display(), e))
            .with_kind(ParseErrorKind::IoError)
    })
}

/// Semantic checks run before any execution
pub struct SpecValidator;

impl SpecValidator {
    /// Validate a parsed spec, collecting every problem
    pub fn validate(spec: &PipelineSpec) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if spec.name.trim().is_empty() {
            errors.push(ValidationError::new("pipeline name must not be empty", "name"));
        }

        if spec.stages.is_empty() {
            errors.push(
                ValidationError::new("pipeline must have at least one stage", "stages")
                    .with_suggestion("add a stage with 'run:', 'fetch:' or 'package:'"),
            );
        }

        Self::validate_matrix(&spec.matrix, &mut errors);
        Self::validate_stages(spec, &mut errors);
        Self::validate_globs(spec, &mut errors);

        // Names depend on valid dimensions; only check them once the matrix is sound
        if errors.iter().all(|e| !e.path.starts_with("matrix")) {
            Self::validate_run_names(spec, &mut errors);
            Self::validate_artifact_names(spec, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_matrix(matrix: &[Dimension], errors: &mut Vec<ValidationError>) {
        let mut seen = HashSet::new();

        for (i, dimension) in matrix.iter().enumerate() {
            let path = format!("matrix[{}]", i);

            if dimension.name.trim().is_empty() {
                errors.push(ValidationError::new("dimension name must not be empty", &path));
            }
            if !seen.insert(dimension.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("dimension '{}' is declared more than once", dimension.name),
                    &path,
                ));
            }
            if dimension.values.is_empty() {
                errors.push(
                    ValidationError::new(
                        format!("dimension '{}' has no values", dimension.name),
                        &path,
                    )
                    .with_suggestion("an empty dimension would expand to zero runs"),
                );
            }

            let mut values = HashSet::new();
            for value in &dimension.values {
                if !values.insert(value.as_str()) {
                    errors.push(ValidationError::new(
                        format!(
                            "dimension '{}' lists value '{}' more than once",
                            dimension.name, value
                        ),
                        format!("{}.values", path),
                    ));
                }
            }
        }
    }

    fn validate_stages(spec: &PipelineSpec, errors: &mut Vec<ValidationError>) {
        let mut seen = HashSet::new();
        for (i, stage) in spec.stages.iter().enumerate() {
            let path = format!("stages[{}]", i);
            if stage.name.trim().is_empty() {
                errors.push(ValidationError::new("stage name must not be empty", &path));
            }
            if !seen.insert(stage.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("stage '{}' is declared more than once", stage.name),
                    &path,
                ));
            }
            if let StageAction::Run(run) = &stage.action {
                if run.run.trim().is_empty() {
                    errors.push(ValidationError::new(
                        format!("stage '{}' has an empty command", stage.name),
                        format!("{}.run", path),
                    ));
                }
            }
            if stage.produces.is_some() && !matches!(stage.action, StageAction::Run(_)) {
                errors.push(ValidationError::new(
                    format!(
                        "stage '{}': 'produces' is only valid on run stages",
                        stage.name
                    ),
                    format!("{}.produces", path),
                ));
            }
        }

        let names: Vec<&str> = spec.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &spec.stages {
            for dep in &stage.depends_on {
                if !names.contains(&dep.as_str()) {
                    errors.push(
                        ValidationError::new(
                            format!("stage '{}' depends on unknown stage '{}'", stage.name, dep),
                            format!("stages.{}.dependsOn", stage.name),
                        )
                        .with_suggestion(format!("available stages: {}", names.join(", "))),
                    );
                }
            }
        }

        // Unknown dependencies and duplicates are already reported above
        if errors.iter().any(|e| e.path.starts_with("stages")) {
            return;
        }

        let graph = match StageGraph::from_spec(spec) {
            Ok(graph) => graph,
            Err(e) => {
                errors.push(ValidationError::new(e.message, "stages"));
                return;
            }
        };

        let producers = graph.producers();
        if producers.len() > 1 {
            let names: Vec<&str> = producers.iter().map(|p| p.name()).collect();
            errors.push(
                ValidationError::new(
                    format!(
                        "only one stage may produce the artifact, found: {}",
                        names.join(", ")
                    ),
                    "stages",
                )
                .with_suggestion("each run emits exactly one artifact"),
            );
        }
        for producer in producers {
            if !producer.dependents.is_empty() {
                errors.push(ValidationError::new(
                    format!(
                        "artifact producer '{}' must be terminal but '{}' depends on it",
                        producer.name(),
                        producer.dependents.join("', '")
                    ),
                    format!("stages.{}", producer.name()),
                ));
            }
        }
    }

    fn validate_globs(spec: &PipelineSpec, errors: &mut Vec<ValidationError>) {
        let mut check = |pattern: &str, path: String| {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError::new(
                    format!("invalid glob '{}': {}", pattern, e),
                    path,
                ));
            }
        };

        for (i, pattern) in spec.trigger.paths.iter().enumerate() {
            check(pattern, format!("trigger.paths[{}]", i));
        }
        for (i, pattern) in spec.trigger.branches.iter().enumerate() {
            check(pattern, format!("trigger.branches[{}]", i));
        }
        for stage in &spec.stages {
            match &stage.action {
                StageAction::Fetch(fetch) => {
                    for (i, pattern) in fetch.fetch.prune.iter().enumerate() {
                        check(pattern, format!("stages.{}.fetch.prune[{}]", stage.name, i));
                    }
                }
                StageAction::Package(package) => {
                    for (i, pattern) in package.package.strip.iter().enumerate() {
                        check(pattern, format!("stages.{}.package.strip[{}]", stage.name, i));
                    }
                }
                StageAction::Run(_) => {}
            }
        }
    }

    /// Run names key staging directories, events and report lookups, so they
    /// must stay distinct after sanitizing
    fn validate_run_names(spec: &PipelineSpec, errors: &mut Vec<ValidationError>) {
        let mut seen: HashMap<String, String> = HashMap::new();

        for combination in MatrixExpander::expand(&spec.matrix) {
            let name = sanitize_name(&combination.name());
            if let Some(previous) = seen.insert(name.clone(), combination.to_string()) {
                errors.push(
                    ValidationError::new(
                        format!(
                            "combinations ({}) and ({}) share the run name '{}'",
                            previous, combination, name
                        ),
                        "matrix",
                    )
                    .with_suggestion("avoid '_' and other separators inside matrix values"),
                );
            }
        }
    }

    /// Every combination must render a distinct artifact name
    fn validate_artifact_names(spec: &PipelineSpec, errors: &mut Vec<ValidationError>) {
        // Event macros are fixed for one invocation, so a placeholder ref is enough
        let event = TriggerEvent::manual("validate");
        let mut seen: HashMap<String, String> = HashMap::new();

        for combination in MatrixExpander::expand(&spec.matrix) {
            let name = artifact_name(spec, &combination, &event);
            if name.is_empty() {
                errors.push(ValidationError::new(
                    "artifact name template renders to an empty name",
                    "artifactName",
                ));
                return;
            }
            if let Some(previous) = seen.insert(name.clone(), combination.to_string()) {
                errors.push(
                    ValidationError::new(
                        format!(
                            "artifact name '{}' is produced by both ({}) and ({})",
                            name, previous, combination
                        ),
                        "artifactName",
                    )
                    .with_suggestion("include every matrix dimension, e.g. $(Matrix.Name)"),
                );
            }
        }
    }
}
