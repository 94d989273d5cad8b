// Run Context
// Per-combination state: macro values, staging directories and the stage environment

use crate::execution::matrix::Combination;
use crate::parser::models::{PipelineSpec, Stage, TriggerEvent};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Case-insensitive `$(name)` macro table
#[derive(Debug, Clone, Default)]
pub struct Macros {
    values: HashMap<String, String>,
}

impl Macros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(name.as_ref().to_lowercase(), value.into());
    }

    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// Pipeline.Name and Pipeline.Product
    pub fn for_pipeline(spec: &PipelineSpec) -> Self {
        Self::new()
            .with("Pipeline.Name", spec.name.clone())
            .with("Pipeline.Product", spec.product_name())
    }

    /// Event.Ref, Event.ShortRef and Event.Kind
    pub fn add_event(&mut self, event: &TriggerEvent) {
        self.insert("Event.Ref", event.git_ref.clone());
        self.insert("Event.ShortRef", event.short_ref());
        self.insert("Event.Kind", event.kind.to_string());
    }

    /// `<dim>`, `matrix.<dim>` and Matrix.Name
    pub fn add_combination(&mut self, combination: &Combination) {
        for (name, value) in &combination.values {
            self.insert(name, value.clone());
            self.insert(format!("matrix.{}", name), value.clone());
        }
        self.insert("Matrix.Name", combination.name());
    }

    /// Replace every known `$(name)`; unknown macros and shell
    /// substitutions such as `$(uname -m)` are left as written
    pub fn substitute(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("$(") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            let replaced = after.find(')').and_then(|end| {
                let name = &after[..end];
                if is_macro_name(name) {
                    self.get(name).map(|value| (value, end))
                } else {
                    None
                }
            });

            match replaced {
                Some((value, end)) => {
                    result.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    result.push_str("$(");
                    rest = after;
                }
            }
        }

        result.push_str(rest);
        result
    }
}

fn is_macro_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Make a rendered name safe to use as a file name
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Render the artifact name for one combination
pub fn artifact_name(spec: &PipelineSpec, combination: &Combination, event: &TriggerEvent) -> String {
    let mut macros = Macros::for_pipeline(spec);
    macros.add_event(event);
    macros.add_combination(combination);
    sanitize_name(&macros.substitute(&spec.artifact_name))
}

/// Context for one run (one matrix combination)
#[derive(Debug, Clone)]
pub struct RunContext {
    pub pipeline_name: String,
    pub combination: Combination,

    /// Deterministic artifact name (without extension)
    pub artifact_name: String,

    /// Cancellation group the run belongs to
    pub cancellation_group: String,

    /// Private scratch directory; stages run here
    pub staging_dir: PathBuf,

    /// Where the packaged artifact is written
    pub output_dir: PathBuf,

    pub macros: Macros,

    /// Base environment: pipeline env, MATRIX_* and RELCUT_* variables
    pub env: HashMap<String, String>,
}

impl RunContext {
    pub fn new(
        spec: &PipelineSpec,
        combination: Combination,
        event: &TriggerEvent,
        staging_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        let artifact_name = artifact_name(spec, &combination, event);

        let mut macros = Macros::for_pipeline(spec);
        macros.add_event(event);
        macros.add_combination(&combination);
        macros.insert("Run.StagingDir", staging_dir.display().to_string());
        macros.insert("Run.OutputDir", output_dir.display().to_string());
        macros.insert("Artifact.Name", artifact_name.clone());

        let mut env: HashMap<String, String> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), macros.substitute(v)))
            .collect();

        for (name, value) in &combination.values {
            env.insert(format!("MATRIX_{}", env_key(name)), value.clone());
        }
        env.insert("RELCUT_PIPELINE".to_string(), spec.name.clone());
        env.insert("RELCUT_MATRIX_NAME".to_string(), combination.name());
        env.insert("RELCUT_ARTIFACT_NAME".to_string(), artifact_name.clone());
        env.insert(
            "RELCUT_STAGING_DIR".to_string(),
            staging_dir.display().to_string(),
        );
        env.insert(
            "RELCUT_OUTPUT_DIR".to_string(),
            output_dir.display().to_string(),
        );

        Self {
            pipeline_name: spec.name.clone(),
            combination,
            artifact_name,
            cancellation_group: String::new(),
            staging_dir,
            output_dir,
            macros,
            env,
        }
    }

    pub fn with_cancellation_group(mut self, group: impl Into<String>) -> Self {
        self.cancellation_group = group.into();
        self
    }

    /// Short run label used in events and logs
    pub fn run_label(&self) -> String {
        self.combination.name()
    }

    pub fn substitute(&self, text: &str) -> String {
        self.macros.substitute(text)
    }

    /// Resolve a (macro-expanded) path relative to the staging directory
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        let expanded = self.substitute(relative);
        let path = Path::new(&expanded);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.staging_dir.join(path)
        }
    }

    /// Directory a stage executes in
    pub fn stage_dir(&self, stage: &Stage) -> PathBuf {
        match &stage.working_directory {
            Some(dir) => self.resolve_path(dir),
            None => self.staging_dir.clone(),
        }
    }

    /// Environment for a stage process (base env overlaid with stage env)
    pub fn stage_env(&self, stage: &Stage) -> HashMap<String, String> {
        let mut env = self.env.clone();
        for (k, v) in &stage.env {
            env.insert(k.clone(), self.substitute(v));
        }
        env.insert("RELCUT_STAGE".to_string(), stage.name.clone());
        env
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
