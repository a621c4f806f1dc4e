#![allow(dead_code)]

use std::path::{Path, PathBuf};

use bidstrack::config::{load_and_validate, ConfigFile, DatasetLayout};
use bidstrack::fs::mock::MockFileSystem;
use bidstrack::manifest::{Manifest, ManifestEntry};
use bidstrack::pipeline::{Descriptor, PipelineRegistry};
use bidstrack::types::{PipelineKey, UnitId};
use serde_json::{json, Value};

pub const DATASET_ROOT: &str = "/data";
pub const COMPLETION_MARKER: &str = ".bidstrack_complete";

pub fn unit(participant: &str, session: &str) -> UnitId {
    UnitId::parse(participant, session).expect("valid unit labels")
}

/// Builder for a `Manifest` (and its TSV form).
#[derive(Default)]
pub struct ManifestBuilder {
    entries: Vec<ManifestEntry>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, participant: &str, session: &str, modalities: &[&str]) -> Self {
        self.entries.push(ManifestEntry::new(
            unit(participant, session),
            modalities.iter().copied(),
        ));
        self
    }

    pub fn build(self) -> Manifest {
        Manifest::from_entries(self.entries).expect("Failed to build valid manifest from builder")
    }

    pub fn to_tsv(self) -> String {
        self.build().to_tsv()
    }
}

/// Builder for descriptor JSON.
pub struct DescriptorBuilder {
    name: String,
    command_line: String,
    inputs: Vec<Value>,
}

impl DescriptorBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            command_line: name.to_string(),
            inputs: vec![],
        }
    }

    pub fn command_line(mut self, command_line: &str) -> Self {
        self.command_line = command_line.to_string();
        self
    }

    /// Add a raw Boutiques input object.
    pub fn input(mut self, input: Value) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn file_input(self, id: &str, value_key: &str) -> Self {
        self.input(json!({"id": id, "type": "File", "value-key": value_key}))
    }

    pub fn file_output(self, id: &str, value_key: &str) -> Self {
        self.input(json!({"id": id, "type": "File", "value-key": value_key, "output": true}))
    }

    pub fn required_number(self, id: &str, value_key: &str) -> Self {
        self.input(json!({"id": id, "type": "Number", "value-key": value_key}))
    }

    pub fn optional_number(self, id: &str, value_key: &str, default: f64) -> Self {
        self.input(json!({
            "id": id,
            "type": "Number",
            "value-key": value_key,
            "optional": true,
            "default-value": default
        }))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "tool-version": "1.0.0",
            "command-line": self.command_line,
            "inputs": self.inputs,
        })
    }

    pub fn build(self) -> Descriptor {
        Descriptor::parse(&self.to_json().to_string(), "builder")
            .expect("Failed to build valid descriptor from builder")
    }
}

struct PipelineFixture {
    key: PipelineKey,
    depends_on: Option<PipelineKey>,
}

/// An in-memory dataset rooted at [`DATASET_ROOT`] with a `bidstrack.toml`.
pub struct DatasetFixture {
    pub fs: MockFileSystem,
    root: PathBuf,
    pipelines: Vec<PipelineFixture>,
    extra_config: String,
}

impl DatasetFixture {
    pub fn new() -> Self {
        let fs = MockFileSystem::new();
        fs.add_dir(DATASET_ROOT);
        Self {
            fs,
            root: PathBuf::from(DATASET_ROOT),
            pipelines: vec![],
            extra_config: String::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("bidstrack.toml")
    }

    pub fn write_manifest(&self, manifest: ManifestBuilder) {
        self.fs.add_file(self.root.join("manifest.tsv"), manifest.to_tsv());
    }

    pub fn write_manifest_text(&self, contents: &str) {
        self.fs.add_file(self.root.join("manifest.tsv"), contents);
    }

    fn unit_dir(base: &Path, unit: &UnitId) -> PathBuf {
        base.join(unit.participant.dir_name())
            .join(unit.session.dir_name())
    }

    fn write_unit(&self, base: &Path, unit: &UnitId, files: &[&str], complete: bool) {
        let dir = Self::unit_dir(base, unit);
        self.fs.add_dir(&dir);
        for file in files {
            self.fs.add_file(dir.join(file), "data");
        }
        if complete {
            self.fs.add_file(dir.join(COMPLETION_MARKER), "");
        }
    }

    /// Complete raw source directory for a unit.
    pub fn add_raw(&self, participant: &str, session: &str) {
        let base = self.root.join("sourcedata");
        self.write_unit(&base, &unit(participant, session), &["dicom.tgz"], true);
    }

    /// Complete BIDS directory with the given files (relative to the unit dir).
    pub fn add_bids(&self, participant: &str, session: &str, files: &[&str]) {
        let base = self.root.join("bids");
        self.write_unit(&base, &unit(participant, session), files, true);
    }

    /// BIDS directory still being written (no completion marker).
    pub fn add_partial_bids(&self, participant: &str, session: &str, files: &[&str]) {
        let base = self.root.join("bids");
        self.write_unit(&base, &unit(participant, session), files, false);
    }

    /// Delete a unit's BIDS directory.
    pub fn remove_bids(&self, participant: &str, session: &str) {
        let target = Self::unit_dir(&self.root.join("bids"), &unit(participant, session));
        self.fs.remove(target);
    }

    /// Complete derivative output for a unit.
    pub fn add_derivative(&self, name: &str, version: &str, participant: &str, session: &str) {
        let base = self
            .root
            .join("derivatives")
            .join(name)
            .join(version)
            .join("output");
        self.write_unit(&base, &unit(participant, session), &["report.html"], true);
    }

    /// Register a pipeline: writes descriptor + template files and a
    /// `[[pipeline]]` entry.
    pub fn add_pipeline(
        &mut self,
        name: &str,
        version: &str,
        descriptor: &DescriptorBuilder,
        template: Value,
    ) {
        self.add_pipeline_with_dependency(name, version, descriptor, template, None);
    }

    pub fn add_pipeline_with_dependency(
        &mut self,
        name: &str,
        version: &str,
        descriptor: &DescriptorBuilder,
        template: Value,
        depends_on: Option<PipelineKey>,
    ) {
        let dir = self.root.join("pipelines").join(name).join(version);
        self.fs
            .add_file(dir.join("descriptor.json"), descriptor.to_json().to_string());
        self.fs
            .add_file(dir.join("invocation.json"), template.to_string());
        self.pipelines.push(PipelineFixture {
            key: PipelineKey::new(name, version),
            depends_on,
        });
    }

    /// Extra TOML appended verbatim (e.g. `[substitutions]`).
    pub fn extra_config(&mut self, toml: &str) {
        self.extra_config.push_str(toml);
        self.extra_config.push('\n');
    }

    pub fn write_config(&self) {
        let mut toml = String::new();
        toml.push_str(&self.extra_config);
        for p in &self.pipelines {
            let dir = format!("pipelines/{}/{}", p.key.name, p.key.version);
            toml.push_str(&format!(
                "\n[[pipeline]]\nname = \"{}\"\nversion = \"{}\"\ncontainer = \"containers/{}_{}.sif\"\ndescriptor = \"{dir}/descriptor.json\"\ninvocation = \"{dir}/invocation.json\"\n",
                p.key.name, p.key.version, p.key.name, p.key.version
            ));
            if let Some(dep) = &p.depends_on {
                toml.push_str(&format!(
                    "depends_on = {{ name = \"{}\", version = \"{}\" }}\n",
                    dep.name, dep.version
                ));
            }
        }
        self.fs.add_file(self.config_path(), toml);
    }

    /// Write the config and load it back through the real loader.
    pub fn config(&self) -> ConfigFile {
        self.write_config();
        load_and_validate(&self.fs, self.config_path()).expect("fixture config is valid")
    }

    pub fn layout(&self) -> DatasetLayout {
        self.config().layout()
    }

    pub fn registry(&self) -> PipelineRegistry {
        PipelineRegistry::from_config(&self.fs, &self.config()).expect("fixture pipelines register")
    }
}

impl Default for DatasetFixture {
    fn default() -> Self {
        Self::new()
    }
}
